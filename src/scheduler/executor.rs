//! Job executor: runs one job's action and records the outcome.
//!
//! [`JobExecutor::execute`] never fails. Unknown actions, action errors,
//! panics and timeouts all become a run record. The record and the job's new
//! schedule state are written in one transaction; if that write fails nothing
//! is stored, the job keeps its old `next_run_at` and runs again on a later
//! tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use super::due;
use super::history::{NewRunRecord, RunOutcome};
use super::job::{Job, Schedule};
use crate::actions::ActionRegistry;
use crate::error::SchedulerError;
use crate::storage::{JobStore, ScheduleState};

pub struct JobExecutor {
    store: JobStore,
    registry: Arc<ActionRegistry>,
    default_timeout: Duration,
}

impl JobExecutor {
    pub fn new(store: JobStore, registry: Arc<ActionRegistry>, default_timeout: Duration) -> Self {
        Self {
            store,
            registry,
            default_timeout,
        }
    }

    pub fn timeout_for(&self, job: &Job) -> Duration {
        job.timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }

    /// Run `job`, dispatched by the tick at `tick`, and write back one run
    /// record plus the job's new schedule state.
    pub async fn execute(&self, job: &Job, tick: DateTime<Utc>) -> NewRunRecord {
        let started_at = Utc::now();
        let result = self.invoke(job).await;
        let finished_at = Utc::now();

        let record = match result {
            Ok(output) => NewRunRecord::success(&job.key, started_at, finished_at, output),
            Err(e @ SchedulerError::Timeout(_)) => {
                NewRunRecord::failed(&job.key, started_at, finished_at, RunOutcome::Timeout, e.to_string())
            }
            Err(e) => NewRunRecord::failed(&job.key, started_at, finished_at, RunOutcome::Failure, e.to_string()),
        };

        match record.outcome {
            RunOutcome::Success => info!(
                job = %job.key,
                action = %job.action,
                duration_ms = record.duration_ms(),
                "Job succeeded"
            ),
            outcome => warn!(
                job = %job.key,
                action = %job.action,
                %outcome,
                error = record.error.as_deref().unwrap_or_default(),
                "Job failed"
            ),
        }

        self.persist(job, tick, &record);
        record
    }

    async fn invoke(&self, job: &Job) -> Result<Value, SchedulerError> {
        let action = self.registry.resolve(&job.action)?;
        let timeout = self.timeout_for(job);
        let args = job.args.clone();

        // Own task so a panicking action is contained and a timed-out one is
        // aborted (best effort: blocking I/O inside it keeps running).
        let handle = AbortOnDropHandle::new(tokio::spawn(async move { action.run(&args).await }));

        match tokio::time::timeout(timeout, handle).await {
            Err(_) => Err(SchedulerError::Timeout(timeout)),
            Ok(Err(join_err)) if join_err.is_panic() => {
                Err(SchedulerError::ActionFailed("action panicked".into()))
            }
            Ok(Err(join_err)) => Err(SchedulerError::ActionFailed(join_err.to_string())),
            Ok(Ok(Err(e))) => Err(SchedulerError::ActionFailed(format!("{e:#}"))),
            Ok(Ok(Ok(output))) => Ok(output),
        }
    }

    fn persist(&self, job: &Job, tick: DateTime<Utc>, record: &NewRunRecord) {
        let next_run_at = match due::compute_next_run(job, tick) {
            Ok(next) => next,
            Err(e) => {
                warn!(job = %job.key, error = %e, "Cannot compute next run; keeping previous");
                job.next_run_at
            }
        };
        let state = ScheduleState {
            next_run_at,
            last_run_at: record.started_at,
            last_status: record.outcome,
            last_error: record.error.clone(),
            retire: matches!(job.schedule, Schedule::Once { .. }),
        };

        match self.store.record_run(record, &state) {
            Ok(id) => debug!(
                job = %job.key,
                run_id = id,
                next_run_at = ?state.next_run_at,
                "Run recorded"
            ),
            Err(SchedulerError::NotFound(_)) => {
                warn!(job = %job.key, "Job deleted during execution; dropping run record")
            }
            Err(e) => error!(
                job = %job.key,
                error = %e,
                "Failed to record run; job stays due"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Action;
    use crate::scheduler::job::NewJob;
    use crate::storage::{open_memory_pool, Pool};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    struct Ok200;

    #[async_trait::async_trait]
    impl Action for Ok200 {
        async fn run(&self, _args: &Value) -> anyhow::Result<Value> {
            Ok(json!({ "status": 200 }))
        }
    }

    struct Refused;

    #[async_trait::async_trait]
    impl Action for Refused {
        async fn run(&self, _args: &Value) -> anyhow::Result<Value> {
            anyhow::bail!("connection refused")
        }
    }

    struct Hang;

    #[async_trait::async_trait]
    impl Action for Hang {
        async fn run(&self, _args: &Value) -> anyhow::Result<Value> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        }
    }

    struct Explode;

    #[async_trait::async_trait]
    impl Action for Explode {
        async fn run(&self, _args: &Value) -> anyhow::Result<Value> {
            panic!("kaboom")
        }
    }

    fn executor() -> JobExecutor {
        executor_on(open_memory_pool().unwrap())
    }

    fn executor_on(pool: Pool) -> JobExecutor {
        let mut registry = ActionRegistry::new();
        registry
            .register("ok", Ok200)
            .register("refused", Refused)
            .register("hang", Hang)
            .register("explode", Explode);
        let store = JobStore::new(pool);
        JobExecutor::new(store, Arc::new(registry), Duration::from_secs(5))
    }

    fn create(exec: &JobExecutor, new: NewJob) -> Job {
        exec.store.create_job(new).unwrap()
    }

    #[tokio::test]
    async fn test_success_reschedules_from_tick() {
        let exec = executor();
        let job = create(&exec, NewJob::new("ping", Schedule::every(5), "ok"));

        // Overdue by a minute; the next run is still tick + interval.
        let tick = job.next_run_at.unwrap() + ChronoDuration::seconds(60);
        let record = exec.execute(&job, tick).await;
        assert_eq!(record.outcome, RunOutcome::Success);
        assert_eq!(record.output, Some(json!({ "status": 200 })));

        let job = exec.store.get_job("ping").unwrap();
        assert_eq!(job.next_run_at, Some(tick + ChronoDuration::seconds(5)));
        assert_eq!(job.last_status, Some(RunOutcome::Success));
        assert!(job.last_error.is_none());
        assert_eq!(exec.store.list_run_records("ping", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_action_is_recorded_failure() {
        let exec = executor();
        let job = create(
            &exec,
            NewJob::new("mystery", Schedule::every(60), "health_check:unknownsystem"),
        );

        let record = exec.execute(&job, Utc::now()).await;
        assert_eq!(record.outcome, RunOutcome::Failure);
        assert!(record.error.as_deref().unwrap().contains("unknown action"));

        let runs = exec.store.list_run_records("mystery", 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, RunOutcome::Failure);

        let job = exec.store.get_job("mystery").unwrap();
        assert_eq!(job.last_status, Some(RunOutcome::Failure));
        assert!(job.last_error.unwrap().contains("health_check:unknownsystem"));
    }

    #[tokio::test]
    async fn test_action_error_is_failure() {
        let exec = executor();
        let job = create(&exec, NewJob::new("ci", Schedule::every(60), "refused"));

        let record = exec.execute(&job, Utc::now()).await;
        assert_eq!(record.outcome, RunOutcome::Failure);
        assert!(record.error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_timeout_is_recorded() {
        let exec = executor();
        let job = create(&exec, NewJob::new("slow", Schedule::every(60), "hang").with_timeout(1));

        let record = exec.execute(&job, Utc::now()).await;
        assert_eq!(record.outcome, RunOutcome::Timeout);
        assert!(record.duration_ms() >= 900);
        assert_eq!(
            exec.store.get_job("slow").unwrap().last_status,
            Some(RunOutcome::Timeout)
        );
    }

    #[tokio::test]
    async fn test_panicking_action_is_contained() {
        let exec = executor();
        let job = create(&exec, NewJob::new("boom", Schedule::every(60), "explode"));

        let record = exec.execute(&job, Utc::now()).await;
        assert_eq!(record.outcome, RunOutcome::Failure);
        assert!(record.error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_one_shot_retires_after_firing() {
        let exec = executor();
        let at = Utc::now();
        let job = create(&exec, NewJob::new("once", Schedule::once(at), "ok"));

        exec.execute(&job, at).await;

        let job = exec.store.get_job("once").unwrap();
        assert!(job.fired);
        assert!(!job.enabled);
        assert!(job.next_run_at.is_none());
        assert!(!due::is_due(&job, at + ChronoDuration::seconds(1)).unwrap());
    }

    #[tokio::test]
    async fn test_job_deleted_mid_run_writes_nothing() {
        let exec = executor();
        let job = create(&exec, NewJob::new("gone", Schedule::every(60), "ok"));
        exec.store.delete_job("gone").unwrap();

        let record = exec.execute(&job, Utc::now()).await;
        assert_eq!(record.outcome, RunOutcome::Success);
        assert!(exec.store.list_run_records("gone", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_job_due() {
        let pool = open_memory_pool().unwrap();
        let exec = executor_on(pool.clone());
        let job = create(&exec, NewJob::new("ping", Schedule::every(5), "ok"));
        pool.get()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER run_records_reject BEFORE INSERT ON run_records
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();

        let tick = job.next_run_at.unwrap();
        let record = exec.execute(&job, tick).await;
        assert_eq!(record.outcome, RunOutcome::Success);

        let stored = exec.store.get_job("ping").unwrap();
        assert_eq!(stored.next_run_at, job.next_run_at);
        assert!(stored.last_run_at.is_none());
        assert!(stored.last_status.is_none());
        assert!(due::is_due(&stored, tick).unwrap());
        assert!(exec.store.list_run_records("ping", 10).unwrap().is_empty());
    }
}
