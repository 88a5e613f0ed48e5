use std::path::PathBuf;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::{ArgGroup, Parser, Subcommand};
use serde_json::Value;

use opsched::config::{LoggingConfig, SchedulerConfig, CONFIG_ENV};
use opsched::scheduler::{self, JobPatch, NewJob, RunRecord, Schedule};
use opsched::storage::{self, JobStore};

#[derive(Parser)]
#[command(
    name = "opsched",
    about = "Persistent background job scheduler for the ops dashboard",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (scheduler loop + API server)
    Serve {
        /// Bind address (overrides api.bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Manage scheduled jobs
    Job {
        #[command(subcommand)]
        action: JobAction,
    },

    /// Show the most recent runs across all jobs
    Runs {
        /// Only show runs of this job
        #[arg(long)]
        job: Option<String>,

        /// Maximum number of runs to show
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// List all jobs
    List {
        /// Only show enabled jobs
        #[arg(long)]
        enabled_only: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Add a new job
    #[command(group(ArgGroup::new("when").required(true).args(["every", "cron", "at"])))]
    Add {
        /// Unique job key
        #[arg(long)]
        key: String,

        /// Action tag, e.g. health_check:jenkins
        #[arg(long)]
        action: String,

        /// Fixed interval in seconds
        #[arg(long)]
        every: Option<u64>,

        /// Cron expression (5-field, UTC)
        #[arg(long)]
        cron: Option<String>,

        /// Run once at this RFC 3339 time
        #[arg(long)]
        at: Option<DateTime<Utc>>,

        /// Human-readable label
        #[arg(long)]
        label: Option<String>,

        /// Action arguments as a JSON object
        #[arg(long)]
        args: Option<Value>,

        /// Execution timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Create the job disabled
        #[arg(long)]
        disabled: bool,
    },

    /// Change an existing job; omitted fields keep their value
    #[command(group(ArgGroup::new("when").args(["every", "cron", "at"])))]
    Update {
        #[arg(long)]
        key: String,

        /// New action tag
        #[arg(long)]
        action: Option<String>,

        /// New fixed interval in seconds
        #[arg(long)]
        every: Option<u64>,

        /// New cron expression (5-field, UTC)
        #[arg(long)]
        cron: Option<String>,

        /// Run once at this RFC 3339 time instead
        #[arg(long)]
        at: Option<DateTime<Utc>>,

        /// New label
        #[arg(long)]
        label: Option<String>,

        /// New action arguments as a JSON object
        #[arg(long)]
        args: Option<Value>,

        /// New execution timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Remove a job and its run history
    Remove {
        #[arg(long)]
        key: String,
    },

    /// Enable a job
    Enable {
        #[arg(long)]
        key: String,
    },

    /// Disable a job
    Disable {
        #[arg(long)]
        key: String,
    },

    /// Show the most recent runs of a job
    History {
        #[arg(long)]
        key: String,

        /// Maximum number of runs to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.is_json() {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_store(config: &SchedulerConfig) -> Result<JobStore> {
    let pool = storage::open_pool(&config.storage.database_path()?)?;
    Ok(JobStore::new(pool))
}

/// At most one of the schedule flags is set; clap's arg group enforces it.
fn schedule_from(every: Option<u64>, cron: Option<String>, at: Option<DateTime<Utc>>) -> Result<Option<Schedule>> {
    Ok(match (every, cron, at) {
        (None, None, None) => None,
        (Some(seconds), None, None) => Some(Schedule::every(seconds)),
        (None, Some(expr), None) => Some(Schedule::cron(expr)),
        (None, None, Some(at)) => Some(Schedule::once(at)),
        _ => bail!("only one of --every, --cron or --at may be given"),
    })
}

fn print_runs(runs: &[RunRecord], with_key: bool) {
    if with_key {
        println!("{:<24} | {:<19} | {:<8} | {:>8} | Error", "Job", "Started", "Outcome", "ms");
        println!("{:-<24}-|-{:-<19}-|-{:-<8}-|-{:->8}-|-{:-<30}", "", "", "", "", "");
    } else {
        println!("{:<19} | {:<8} | {:>8} | Error", "Started", "Outcome", "ms");
        println!("{:-<19}-|-{:-<8}-|-{:->8}-|-{:-<30}", "", "", "", "");
    }
    for run in runs {
        if with_key {
            print!("{:<24} | ", run.job_key);
        }
        println!(
            "{:<19} | {:<8} | {:>8} | {}",
            fmt_time(Some(run.started_at)),
            run.outcome.as_str(),
            run.duration_ms,
            run.error.as_deref().unwrap_or(""),
        );
    }
}

fn fmt_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = SchedulerConfig::load_layered(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "Starting opsched daemon");
            opsched::serve(config).await?;
        }
        Commands::Job { action } => {
            let store = open_store(&config)?;

            match action {
                JobAction::List { enabled_only, json } => {
                    let jobs = store.list_jobs(enabled_only)?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&jobs)?);
                    } else if jobs.is_empty() {
                        println!("No jobs found.");
                    } else {
                        println!(
                            "{:<24} | {:<22} | {:<24} | {:<7} | {:<19} | Last",
                            "Key", "Schedule", "Action", "Enabled", "Next run"
                        );
                        println!("{:-<24}-|-{:-<22}-|-{:-<24}-|-{:-<7}-|-{:-<19}-|-{:-<7}", "", "", "", "", "", "");
                        for job in jobs {
                            println!(
                                "{:<24} | {:<22} | {:<24} | {:<7} | {:<19} | {}",
                                job.key,
                                job.schedule.to_string(),
                                job.action,
                                job.enabled,
                                fmt_time(job.next_run_at),
                                job.last_status.map(|s| s.as_str()).unwrap_or("-"),
                            );
                        }
                    }
                }
                JobAction::Add {
                    key,
                    action,
                    every,
                    cron,
                    at,
                    label,
                    args,
                    timeout,
                    disabled,
                } => {
                    let Some(schedule) = schedule_from(every, cron, at)? else {
                        bail!("one of --every, --cron or --at is required");
                    };
                    let mut new = NewJob::new(key, schedule, action);
                    if let Some(label) = label {
                        new = new.with_label(label);
                    }
                    if let Some(args) = args {
                        new = new.with_args(args);
                    }
                    if let Some(timeout) = timeout {
                        new = new.with_timeout(timeout);
                    }
                    if disabled {
                        new = new.disabled();
                    }
                    let job = store.create_job(new)?;
                    println!(
                        "Job '{}' added ({}, next run {}).",
                        job.key,
                        job.schedule,
                        fmt_time(job.next_run_at)
                    );
                }
                JobAction::Update {
                    key,
                    action,
                    every,
                    cron,
                    at,
                    label,
                    args,
                    timeout,
                } => {
                    let mut patch = JobPatch::default();
                    if let Some(schedule) = schedule_from(every, cron, at)? {
                        patch = patch.with_schedule(schedule);
                    }
                    if let Some(action) = action {
                        patch = patch.with_action(action);
                    }
                    if let Some(label) = label {
                        patch = patch.with_label(label);
                    }
                    if let Some(args) = args {
                        patch = patch.with_args(args);
                    }
                    if let Some(timeout) = timeout {
                        patch = patch.with_timeout(timeout);
                    }
                    let job = store.update_job(&key, &patch)?;
                    println!(
                        "Job '{}' updated ({}, next run {}).",
                        job.key,
                        job.schedule,
                        fmt_time(job.next_run_at)
                    );
                }
                JobAction::Remove { key } => {
                    store.delete_job(&key)?;
                    println!("Job '{}' removed.", key);
                }
                JobAction::Enable { key } => {
                    store.enable_job(&key)?;
                    println!("Job '{}' enabled.", key);
                }
                JobAction::Disable { key } => {
                    store.disable_job(&key)?;
                    println!("Job '{}' disabled.", key);
                }
                JobAction::History { key, limit } => {
                    store.get_job(&key)?;
                    let runs = store.list_run_records(&key, limit)?;
                    if runs.is_empty() {
                        println!("No runs recorded for '{}'.", key);
                    } else {
                        print_runs(&runs, false);
                    }
                }
            }
        }
        Commands::Runs { job, limit } => {
            let store = open_store(&config)?;
            let runs = store.list_recent_runs(job.as_deref(), limit)?;
            if runs.is_empty() {
                println!("No runs recorded.");
            } else {
                print_runs(&runs, true);
            }
        }
        Commands::DryRun { hours } => {
            let store = open_store(&config)?;
            let preview = scheduler::preview_jobs(&store, Utc::now(), hours)?;
            if preview.is_empty() {
                println!("No runs scheduled in next {} hours.", hours);
            } else {
                println!("Upcoming runs (next {} hours):", hours);
                for run in preview {
                    println!("{} : {} ({})", fmt_time(Some(run.at)), run.job_key, run.action);
                }
            }
        }
    }

    Ok(())
}
