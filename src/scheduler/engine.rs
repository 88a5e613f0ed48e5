//! Tick loop.
//!
//! Wakes on a fixed interval, selects due jobs from a fresh read of the
//! store and spawns one task per job. The loop never waits on an execution:
//! a job still in flight is skipped, and so is any job beyond the
//! concurrency limit; both stay due and are picked up on a later tick.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::due;
use super::executor::JobExecutor;
use crate::storage::JobStore;

/// What one tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickSummary {
    pub at: Option<DateTime<Utc>>,
    /// When the pass finished selecting and dispatching.
    pub completed_at: Option<DateTime<Utc>>,
    pub due: usize,
    pub dispatched: usize,
    pub skipped_in_flight: usize,
    pub skipped_saturated: usize,
    /// Jobs whose stored schedule could not be decoded or evaluated.
    pub invalid: Vec<String>,
    /// Loop-level failure, e.g. the store was unreachable.
    pub error: Option<String>,
}

/// Keys of jobs currently executing.
#[derive(Debug, Default)]
pub struct InFlight {
    keys: Mutex<HashSet<String>>,
}

impl InFlight {
    /// Claim `key`; `None` if it is already running.
    pub fn try_claim(self: &Arc<Self>, key: &str) -> Option<InFlightGuard> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        if !keys.insert(key.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: Arc::clone(self),
            key: key.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases the claim when the execution task ends, however it ends.
pub struct InFlightGuard {
    set: Arc<InFlight>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// State shared between the loop and status queries.
#[derive(Debug)]
pub struct RuntimeState {
    started_at: RwLock<Option<DateTime<Utc>>>,
    running: AtomicBool,
    last_tick: RwLock<Option<TickSummary>>,
    pub in_flight: Arc<InFlight>,
}

impl RuntimeState {
    pub fn new() -> Self {
        Self {
            started_at: RwLock::new(None),
            running: AtomicBool::new(false),
            last_tick: RwLock::new(None),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Called by `Scheduler::start` before the loop task is spawned, so a
    /// status query right after `start` already sees a running scheduler.
    pub fn mark_started(&self, at: DateTime<Utc>) {
        *self.started_at.write().unwrap_or_else(PoisonError::into_inner) = Some(at);
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn last_tick(&self) -> Option<TickSummary> {
        self.last_tick
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_tick(&self, summary: TickSummary) {
        *self.last_tick.write().unwrap_or_else(PoisonError::into_inner) = Some(summary);
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct TickLoop {
    pub store: JobStore,
    pub executor: Arc<JobExecutor>,
    pub state: Arc<RuntimeState>,
    pub tick_interval: Duration,
    pub max_concurrency: usize,
    pub max_jobs_per_tick: usize,
    pub shutdown_grace: Duration,
}

impl TickLoop {
    /// Main scheduler execution loop. Returns after `cancel` fires and
    /// in-flight executions have finished or been abandoned.
    pub async fn run(self, cancel: CancellationToken) {
        info!(tick = ?self.tick_interval, max_concurrency = self.max_concurrency, "Scheduler engine started");

        let permits = Arc::new(Semaphore::new(self.max_concurrency.max(1)));
        let mut running: JoinSet<()> = JoinSet::new();
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            reap(&mut running);
            let mut summary = self.tick(Utc::now(), &permits, &mut running);
            summary.completed_at = Some(Utc::now());
            if summary.dispatched > 0 || summary.error.is_some() {
                debug!(?summary, "Tick complete");
            }
            self.state.record_tick(summary);
        }

        self.state.running.store(false, Ordering::SeqCst);
        self.drain(running).await;
        info!("Scheduler engine stopped");
    }

    /// One evaluation pass at `now`.
    fn tick(&self, now: DateTime<Utc>, permits: &Arc<Semaphore>, running: &mut JoinSet<()>) -> TickSummary {
        let mut summary = TickSummary {
            at: Some(now),
            ..Default::default()
        };

        let scan = match self.store.scan_jobs(true) {
            Ok(scan) => scan,
            Err(e) => {
                error!(error = %e, "Failed to list jobs; retrying next tick");
                summary.error = Some(e.to_string());
                return summary;
            }
        };

        for (key, e) in scan.undecodable {
            warn!(job = %key, error = %e, "Stored schedule cannot be decoded; job is not due");
            summary.invalid.push(key);
        }

        let mut due_jobs = Vec::new();
        for job in scan.jobs {
            match due::is_due(&job, now) {
                Ok(true) => due_jobs.push(job),
                Ok(false) => {}
                Err(e) => {
                    warn!(job = %job.key, error = %e, "Schedule cannot be evaluated; job is not due");
                    summary.invalid.push(job.key);
                }
            }
        }
        summary.due = due_jobs.len();

        // Most overdue first when more are due than one tick may dispatch.
        // The cap counts dispatches only, so jobs still in flight do not use
        // up slots meant for others.
        due_jobs.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at).then_with(|| a.key.cmp(&b.key)));

        for job in due_jobs {
            if summary.dispatched >= self.max_jobs_per_tick {
                debug!(job = %job.key, "Per-tick limit reached; deferring");
                break;
            }
            let Some(claim) = self.state.in_flight.try_claim(&job.key) else {
                debug!(job = %job.key, "Still running; skipping");
                summary.skipped_in_flight += 1;
                continue;
            };
            let Ok(permit) = Arc::clone(permits).try_acquire_owned() else {
                debug!(job = %job.key, "Concurrency limit reached; deferring");
                summary.skipped_saturated += 1;
                continue;
            };

            info!(job = %job.key, action = %job.action, "Task due");
            let executor = Arc::clone(&self.executor);
            running.spawn(async move {
                let _claim = claim;
                let _permit = permit;
                executor.execute(&job, now).await;
            });
            summary.dispatched += 1;
        }

        summary
    }

    /// Wait for in-flight executions up to the grace period, then abort the
    /// rest. Aborted tasks stop at their next await point, before anything
    /// is written, so nothing touches the store once this returns.
    async fn drain(&self, mut running: JoinSet<()>) {
        if running.is_empty() {
            return;
        }
        info!(in_flight = running.len(), grace = ?self.shutdown_grace, "Waiting for in-flight jobs");

        let finished = tokio::time::timeout(self.shutdown_grace, async {
            while let Some(res) = running.join_next().await {
                log_join(res);
            }
        })
        .await;

        if finished.is_err() {
            warn!(abandoned = running.len(), "Grace period elapsed; abandoning in-flight jobs");
            running.shutdown().await;
        }
    }
}

fn reap(running: &mut JoinSet<()>) {
    while let Some(res) = running.try_join_next() {
        log_join(res);
    }
}

fn log_join(res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        if e.is_panic() {
            error!("Job execution task panicked: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{Action, ActionRegistry};
    use crate::scheduler::job::{NewJob, Schedule};
    use crate::storage::{open_memory_pool, Pool};
    use chrono::Duration as ChronoDuration;
    use serde_json::Value;

    struct Noop;

    #[async_trait::async_trait]
    impl Action for Noop {
        async fn run(&self, _args: &Value) -> anyhow::Result<Value> {
            Ok(Value::Null)
        }
    }

    fn tick_loop(pool: Pool, max_jobs_per_tick: usize) -> TickLoop {
        let store = JobStore::new(pool);
        let mut registry = ActionRegistry::new();
        registry.register("noop", Noop);
        let executor = JobExecutor::new(store.clone(), Arc::new(registry), Duration::from_secs(5));
        TickLoop {
            store,
            executor: Arc::new(executor),
            state: Arc::new(RuntimeState::new()),
            tick_interval: Duration::from_millis(50),
            max_concurrency: 4,
            max_jobs_per_tick,
            shutdown_grace: Duration::from_secs(1),
        }
    }

    /// Create `key` so that it is already overdue.
    fn overdue(tl: &TickLoop, key: &str, schedule: Schedule) {
        let past = Utc::now() - ChronoDuration::hours(1);
        tl.store
            .create_job_at(NewJob::new(key, schedule, "noop").first_run_at(past), past)
            .unwrap();
    }

    fn tick_now(tl: &TickLoop, running: &mut JoinSet<()>) -> TickSummary {
        let permits = Arc::new(Semaphore::new(tl.max_concurrency));
        tl.tick(Utc::now(), &permits, running)
    }

    #[tokio::test]
    async fn test_store_failure_is_reported_and_next_tick_recovers() {
        let pool = open_memory_pool().unwrap();
        let tl = tick_loop(pool.clone(), 10);
        overdue(&tl, "ping", Schedule::every(60));
        let mut running = JoinSet::new();

        pool.get()
            .unwrap()
            .execute_batch("ALTER TABLE jobs RENAME TO jobs_offline;")
            .unwrap();
        let summary = tick_now(&tl, &mut running);
        assert!(summary.error.is_some());
        assert_eq!(summary.dispatched, 0);
        assert!(running.is_empty());

        pool.get()
            .unwrap()
            .execute_batch("ALTER TABLE jobs_offline RENAME TO jobs;")
            .unwrap();
        let summary = tick_now(&tl, &mut running);
        assert!(summary.error.is_none());
        assert_eq!(summary.dispatched, 1);
        while running.join_next().await.is_some() {}
    }

    #[tokio::test]
    async fn test_corrupt_cron_is_invalid_and_others_still_run() {
        let pool = open_memory_pool().unwrap();
        let tl = tick_loop(pool.clone(), 10);
        overdue(&tl, "nightly", Schedule::cron("0 3 * * *"));
        overdue(&tl, "ping", Schedule::every(60));
        pool.get()
            .unwrap()
            .execute("UPDATE jobs SET schedule_value = 'every tuesday' WHERE key = 'nightly'", [])
            .unwrap();

        let mut running = JoinSet::new();
        let summary = tick_now(&tl, &mut running);
        assert_eq!(summary.invalid, vec!["nightly".to_string()]);
        assert_eq!(summary.due, 1);
        assert_eq!(summary.dispatched, 1);
        while running.join_next().await.is_some() {}

        assert!(tl.store.get_job("ping").unwrap().last_run_at.is_some());
    }

    #[tokio::test]
    async fn test_undecodable_row_is_invalid() {
        let pool = open_memory_pool().unwrap();
        let tl = tick_loop(pool.clone(), 10);
        overdue(&tl, "broken", Schedule::every(60));
        overdue(&tl, "ping", Schedule::every(60));
        pool.get()
            .unwrap()
            .execute("UPDATE jobs SET schedule_value = 'abc' WHERE key = 'broken'", [])
            .unwrap();

        let mut running = JoinSet::new();
        let summary = tick_now(&tl, &mut running);
        assert_eq!(summary.invalid, vec!["broken".to_string()]);
        assert_eq!(summary.dispatched, 1);
        while running.join_next().await.is_some() {}
    }

    #[tokio::test]
    async fn test_in_flight_jobs_do_not_use_up_the_tick_cap() {
        let tl = tick_loop(open_memory_pool().unwrap(), 1);
        // "alpha" is the most overdue and would be first in line.
        let past = Utc::now() - ChronoDuration::hours(2);
        tl.store
            .create_job_at(NewJob::new("alpha", Schedule::every(60), "noop").first_run_at(past), past)
            .unwrap();
        overdue(&tl, "bravo", Schedule::every(60));
        overdue(&tl, "charlie", Schedule::every(60));
        let _busy = tl.state.in_flight.try_claim("alpha").unwrap();

        let mut running = JoinSet::new();
        let summary = tick_now(&tl, &mut running);
        assert_eq!(summary.due, 3);
        assert_eq!(summary.skipped_in_flight, 1);
        assert_eq!(summary.dispatched, 1);
        while running.join_next().await.is_some() {}

        assert!(tl.store.get_job("bravo").unwrap().last_run_at.is_some());
        assert!(tl.store.get_job("charlie").unwrap().last_run_at.is_none());
    }

    #[tokio::test]
    async fn test_loop_records_tick_completion() {
        let tl = tick_loop(open_memory_pool().unwrap(), 10);
        let state = Arc::clone(&tl.state);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(tl.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(120)).await;
        cancel.cancel();
        task.await.unwrap();

        let last = state.last_tick().unwrap();
        let (at, completed_at) = (last.at.unwrap(), last.completed_at.unwrap());
        assert!(completed_at >= at);
        assert!(!state.is_running());
    }
}
