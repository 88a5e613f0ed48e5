//! Background job scheduler.
//!
//! [`Scheduler`] is the context object the rest of the process talks to: it
//! owns the tick loop's lifecycle and re-exposes the job-management
//! operations of the store. Several independent instances can coexist, each
//! with its own store.

pub mod bootstrap;
pub mod cron;
pub mod due;
pub mod engine;
pub mod executor;
pub mod history;
pub mod job;

pub use self::engine::TickSummary;
pub use self::history::{NewRunRecord, RunOutcome, RunRecord};
pub use self::job::{Job, JobPatch, NewJob, Schedule};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use self::engine::{RuntimeState, TickLoop};
use self::executor::JobExecutor;
use crate::actions::ActionRegistry;
use crate::config::LoopConfig;
use crate::error::Result;
use crate::storage::JobStore;

/// Runtime knobs of one scheduler instance.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub tick_interval: Duration,
    pub job_timeout: Duration,
    pub max_concurrency: usize,
    pub max_jobs_per_tick: usize,
    pub shutdown_grace: Duration,
    pub bootstrap_jobs: bool,
}

impl From<&LoopConfig> for SchedulerOptions {
    fn from(cfg: &LoopConfig) -> Self {
        Self {
            tick_interval: cfg.tick_interval(),
            job_timeout: cfg.job_timeout(),
            max_concurrency: cfg.max_concurrency.max(1),
            max_jobs_per_tick: cfg.max_jobs_per_tick.max(1),
            shutdown_grace: cfg.shutdown_grace(),
            bootstrap_jobs: cfg.bootstrap_jobs,
        }
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from(&LoopConfig::default())
    }
}

/// Answer to the health/status query.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub enabled_jobs: usize,
    pub total_jobs: usize,
    pub in_flight: usize,
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time of the most recent tick.
    pub last_tick_at: Option<DateTime<Utc>>,
    pub tick_interval_secs: f64,
    pub last_tick: Option<TickSummary>,
}

/// One entry of a dry-run preview.
#[derive(Debug, Clone, Serialize)]
pub struct UpcomingRun {
    pub at: DateTime<Utc>,
    pub job_key: String,
    pub action: String,
}

struct LoopHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    store: JobStore,
    registry: Arc<ActionRegistry>,
    options: SchedulerOptions,
    state: Arc<RuntimeState>,
    handle: Mutex<Option<LoopHandle>>,
}

/// Scheduler context: cheap to clone, all clones share one tick loop.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(store: JobStore, registry: ActionRegistry, options: SchedulerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                registry: Arc::new(registry),
                options,
                state: Arc::new(RuntimeState::new()),
                handle: Mutex::new(None),
            }),
        }
    }

    /// Bootstrap (if enabled) and start the tick loop. Starting a running
    /// scheduler is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.inner.handle.lock().await;
        if slot.as_ref().is_some_and(|h| !h.task.is_finished()) {
            return Ok(());
        }

        let opts = &self.inner.options;
        if opts.bootstrap_jobs {
            bootstrap::bootstrap(&self.inner.store, Utc::now())?;
        }

        let executor = JobExecutor::new(
            self.inner.store.clone(),
            Arc::clone(&self.inner.registry),
            opts.job_timeout,
        );
        let tick_loop = TickLoop {
            store: self.inner.store.clone(),
            executor: Arc::new(executor),
            state: Arc::clone(&self.inner.state),
            tick_interval: opts.tick_interval,
            max_concurrency: opts.max_concurrency,
            max_jobs_per_tick: opts.max_jobs_per_tick,
            shutdown_grace: opts.shutdown_grace,
        };

        self.inner.state.mark_started(Utc::now());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(tick_loop.run(cancel.clone()));
        *slot = Some(LoopHandle { cancel, task });
        info!(actions = self.inner.registry.len(), "Scheduler started");
        Ok(())
    }

    /// Stop ticking, let in-flight jobs finish within the grace period, and
    /// return once nothing will write to the store any more.
    pub async fn shutdown(&self) {
        let handle = self.inner.handle.lock().await.take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                error!("Scheduler loop ended abnormally: {}", e);
            }
            info!("Scheduler stopped");
        }
    }

    pub fn create_job(&self, new: NewJob) -> Result<Job> {
        self.inner.store.create_job(new)
    }

    pub fn get_job(&self, key: &str) -> Result<Job> {
        self.inner.store.get_job(key)
    }

    pub fn list_jobs(&self, enabled_only: bool) -> Result<Vec<Job>> {
        self.inner.store.list_jobs(enabled_only)
    }

    pub fn update_job(&self, key: &str, patch: &JobPatch) -> Result<Job> {
        self.inner.store.update_job(key, patch)
    }

    pub fn enable_job(&self, key: &str) -> Result<()> {
        self.inner.store.enable_job(key)
    }

    pub fn disable_job(&self, key: &str) -> Result<()> {
        self.inner.store.disable_job(key)
    }

    pub fn delete_job(&self, key: &str) -> Result<()> {
        self.inner.store.delete_job(key)
    }

    pub fn list_run_records(&self, key: &str, limit: usize) -> Result<Vec<RunRecord>> {
        self.inner.store.list_run_records(key, limit)
    }

    /// Recent runs across all jobs, optionally narrowed to one job.
    pub fn list_recent_runs(&self, key: Option<&str>, limit: usize) -> Result<Vec<RunRecord>> {
        self.inner.store.list_recent_runs(key, limit)
    }

    pub fn status(&self) -> Result<SchedulerStatus> {
        let state = &self.inner.state;
        let last_tick = state.last_tick();
        Ok(SchedulerStatus {
            running: state.is_running(),
            enabled_jobs: self.inner.store.count_jobs(true)?,
            total_jobs: self.inner.store.count_jobs(false)?,
            in_flight: state.in_flight.len(),
            started_at: state.started_at(),
            last_tick_at: last_tick.as_ref().and_then(|t| t.completed_at),
            tick_interval_secs: self.inner.options.tick_interval.as_secs_f64(),
            last_tick,
        })
    }

    /// Upcoming runs of all enabled jobs within `hours`, sorted by time.
    pub fn preview(&self, hours: u64) -> Result<Vec<UpcomingRun>> {
        preview_jobs(&self.inner.store, Utc::now(), hours)
    }
}

/// Dry-run preview straight from a store; no running scheduler needed.
pub fn preview_jobs(store: &JobStore, now: DateTime<Utc>, hours: u64) -> Result<Vec<UpcomingRun>> {
    let until = now + chrono::Duration::hours(hours.min(24 * 366) as i64);
    let mut preview = Vec::new();
    for job in store.list_jobs(true)? {
        let times = match due::upcoming(&job, now, until) {
            Ok(times) => times,
            Err(e) => {
                warn!(job = %job.key, error = %e, "Cannot preview job");
                continue;
            }
        };
        for at in times {
            preview.push(UpcomingRun {
                at,
                job_key: job.key.clone(),
                action: job.action.clone(),
            });
        }
    }

    // Sort by time
    preview.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.job_key.cmp(&b.job_key)));
    Ok(preview)
}
