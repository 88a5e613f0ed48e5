//! Job store: the only owner of the `jobs` and `run_records` tables.
//!
//! Every method runs on a pooled connection and commits before returning.
//! Multi-statement operations run inside a transaction so readers never
//! observe a half-applied change.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::{debug, warn};

use super::{from_db_time, to_db_time, Pool};
use crate::error::{Result, SchedulerError};
use crate::scheduler::due;
use crate::scheduler::history::{NewRunRecord, RunOutcome, RunRecord};
use crate::scheduler::job::{Job, JobPatch, NewJob, Schedule};

const JOB_COLUMNS: &str = "key, label, schedule_kind, schedule_value, action, args_json, enabled, \
     timeout_seconds, next_run_at, last_run_at, last_status, last_error, created_at, updated_at";

/// Post-execution state written back after each run.
#[derive(Debug, Clone)]
pub struct ScheduleState {
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: DateTime<Utc>,
    pub last_status: RunOutcome,
    pub last_error: Option<String>,
    /// Disable the job in the same update (one-shot jobs after firing).
    pub retire: bool,
}

/// Result of [`JobStore::scan_jobs`]: decodable jobs plus the keys of rows
/// that could not be turned into a [`Job`].
#[derive(Debug, Default)]
pub struct JobScan {
    pub jobs: Vec<Job>,
    pub undecodable: Vec<(String, SchedulerError)>,
}

/// Durable store for jobs and their run history.
#[derive(Clone)]
pub struct JobStore {
    pool: Pool,
}

impl JobStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Insert a new job. Fails with `DuplicateKey` without touching the
    /// existing row.
    pub fn create_job(&self, new: NewJob) -> Result<Job> {
        self.create_job_at(new, Utc::now())
    }

    /// [`JobStore::create_job`] with an explicit creation time.
    pub fn create_job_at(&self, new: NewJob, now: DateTime<Utc>) -> Result<Job> {
        new.validate()?;

        let next_run_at = match new.first_run_at {
            Some(at) => Some(at),
            None => due::initial_next_run(&new.schedule, now)?,
        };
        let args_json = serde_json::to_string(&new.args_or_empty())
            .map_err(|e| SchedulerError::InvalidJob(e.to_string()))?;

        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        if job_exists(&tx, &new.key)? {
            return Err(SchedulerError::DuplicateKey(new.key));
        }
        tx.execute(
            "INSERT INTO jobs (key, label, schedule_kind, schedule_value, action, args_json, enabled,
                               timeout_seconds, next_run_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                new.key,
                new.label_or_key(),
                new.schedule.kind(),
                new.schedule.value_column(),
                new.action,
                args_json,
                new.enabled,
                new.timeout_seconds.map(|t| t as i64),
                next_run_at.as_ref().map(to_db_time),
                to_db_time(&now),
            ],
        )?;
        let job = load_job(&tx, &new.key)?;
        tx.commit()?;

        debug!(job = %job.key, schedule = %job.schedule, action = %job.action, "Job created");
        Ok(job)
    }

    pub fn get_job(&self, key: &str) -> Result<Job> {
        let conn = self.pool.get()?;
        load_job(&conn, key)
    }

    /// All jobs ordered by key. Rows whose schedule can no longer be decoded
    /// are logged and left out so one bad row cannot stall the others.
    pub fn list_jobs(&self, enabled_only: bool) -> Result<Vec<Job>> {
        let scan = self.scan_jobs(enabled_only)?;
        for (key, e) in &scan.undecodable {
            warn!(job = %key, error = %e, "Skipping undecodable job row");
        }
        Ok(scan.jobs)
    }

    /// Like [`JobStore::list_jobs`], but hands undecodable rows back to the
    /// caller instead of logging them.
    pub fn scan_jobs(&self, enabled_only: bool) -> Result<JobScan> {
        let conn = self.pool.get()?;
        let sql = if enabled_only {
            format!("SELECT {JOB_COLUMNS} FROM jobs WHERE enabled = 1 ORDER BY key")
        } else {
            format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY key")
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], JobRow::from_row)?;

        let mut scan = JobScan::default();
        for row in rows {
            let row = row?;
            let key = row.key.clone();
            match row.into_job() {
                Ok(job) => scan.jobs.push(job),
                Err(e) => scan.undecodable.push((key, e)),
            }
        }
        Ok(scan)
    }

    pub fn count_jobs(&self, enabled_only: bool) -> Result<usize> {
        let conn = self.pool.get()?;
        let sql = if enabled_only {
            "SELECT COUNT(*) FROM jobs WHERE enabled = 1"
        } else {
            "SELECT COUNT(*) FROM jobs"
        };
        let count: i64 = conn.query_row(sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.count_jobs(false)? == 0)
    }

    /// Atomically write the post-run state of a job in one statement.
    pub fn update_job_schedule_state(&self, key: &str, state: &ScheduleState) -> Result<()> {
        let conn = self.pool.get()?;
        write_schedule_state(&conn, key, state)
    }

    /// Append `record` and write `state` for its job in one transaction.
    /// Either both land or neither does, so a failed write leaves the job
    /// due exactly as it was.
    pub fn record_run(&self, record: &NewRunRecord, state: &ScheduleState) -> Result<i64> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        if !job_exists(&tx, &record.job_key)? {
            return Err(SchedulerError::NotFound(record.job_key.clone()));
        }
        let id = insert_run_record(&tx, record)?;
        write_schedule_state(&tx, &record.job_key, state)?;
        tx.commit()?;
        Ok(id)
    }

    /// Edit an existing job in place. The merged definition is validated like
    /// a new one; a changed schedule recomputes `next_run_at` from now.
    pub fn update_job(&self, key: &str, patch: &JobPatch) -> Result<Job> {
        self.update_job_at(key, patch, Utc::now())
    }

    /// [`JobStore::update_job`] with an explicit current time.
    pub fn update_job_at(&self, key: &str, patch: &JobPatch, now: DateTime<Utc>) -> Result<Job> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let current = load_job(&tx, key)?;
        let merged = patch.merge(&current);
        merged.validate()?;

        let next_run_at = if !patch.reschedules(&current) {
            current.next_run_at
        } else if matches!(merged.schedule, Schedule::Once { .. }) && current.last_run_at.is_some() {
            // A one-shot that already ran stays fired.
            None
        } else {
            due::initial_next_run(&merged.schedule, now)?
        };
        let args_json = serde_json::to_string(&merged.args_or_empty())
            .map_err(|e| SchedulerError::InvalidJob(e.to_string()))?;

        tx.execute(
            "UPDATE jobs
             SET label = ?2, schedule_kind = ?3, schedule_value = ?4, action = ?5, args_json = ?6,
                 enabled = ?7, timeout_seconds = ?8, next_run_at = ?9, updated_at = ?10
             WHERE key = ?1",
            params![
                key,
                merged.label_or_key(),
                merged.schedule.kind(),
                merged.schedule.value_column(),
                merged.action,
                args_json,
                merged.enabled,
                merged.timeout_seconds.map(|t| t as i64),
                next_run_at.as_ref().map(to_db_time),
                to_db_time(&now),
            ],
        )?;
        let job = load_job(&tx, key)?;
        tx.commit()?;

        debug!(job = %key, schedule = %job.schedule, next_run_at = ?job.next_run_at, "Job updated");
        Ok(job)
    }

    pub fn enable_job(&self, key: &str) -> Result<()> {
        self.set_enabled(key, true)
    }

    pub fn disable_job(&self, key: &str) -> Result<()> {
        self.set_enabled(key, false)
    }

    fn set_enabled(&self, key: &str, enabled: bool) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE jobs SET enabled = ?2, updated_at = ?3 WHERE key = ?1",
            params![key, enabled, to_db_time(&Utc::now())],
        )?;
        if changed == 0 {
            return Err(SchedulerError::NotFound(key.to_string()));
        }
        debug!(job = %key, enabled, "Job toggled");
        Ok(())
    }

    /// Delete a job. Its run history goes with it (`ON DELETE CASCADE`).
    pub fn delete_job(&self, key: &str) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute("DELETE FROM jobs WHERE key = ?1", params![key])?;
        if changed == 0 {
            return Err(SchedulerError::NotFound(key.to_string()));
        }
        debug!(job = %key, "Job deleted");
        Ok(())
    }

    /// Write-once insert of a run record. Returns the new record id.
    pub fn append_run_record(&self, record: &NewRunRecord) -> Result<i64> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        if !job_exists(&tx, &record.job_key)? {
            return Err(SchedulerError::NotFound(record.job_key.clone()));
        }
        let id = insert_run_record(&tx, record)?;
        tx.commit()?;
        Ok(id)
    }

    /// Most recent first.
    pub fn list_run_records(&self, job_key: &str, limit: usize) -> Result<Vec<RunRecord>> {
        self.list_recent_runs(Some(job_key), limit)
    }

    /// Most recent runs across all jobs, or of one job when `job_key` is set.
    pub fn list_recent_runs(&self, job_key: Option<&str>, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, job_key, started_at, finished_at, outcome, error, output_json, duration_ms
             FROM run_records
             WHERE ?1 IS NULL OR job_key = ?1
             ORDER BY started_at DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![job_key, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, job_key, started_at, finished_at, outcome, error, output_json, duration_ms) = row?;
            records.push(RunRecord {
                id,
                job_key,
                started_at: from_db_time(&started_at)?,
                finished_at: from_db_time(&finished_at)?,
                outcome: outcome.parse()?,
                error,
                output: output_json.and_then(|raw| serde_json::from_str(&raw).ok()),
                duration_ms,
            });
        }
        Ok(records)
    }
}

fn insert_run_record(conn: &Connection, record: &NewRunRecord) -> Result<i64> {
    let output_json = record
        .output
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| SchedulerError::Storage(e.to_string()))?;

    conn.execute(
        "INSERT INTO run_records (job_key, started_at, finished_at, outcome, error, output_json, duration_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.job_key,
            to_db_time(&record.started_at),
            to_db_time(&record.finished_at),
            record.outcome.as_str(),
            record.error,
            output_json,
            record.duration_ms(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn write_schedule_state(conn: &Connection, key: &str, state: &ScheduleState) -> Result<()> {
    let changed = conn.execute(
        "UPDATE jobs
         SET next_run_at = ?2,
             last_run_at = ?3,
             last_status = ?4,
             last_error = ?5,
             enabled = CASE WHEN ?6 THEN 0 ELSE enabled END,
             updated_at = ?7
         WHERE key = ?1",
        params![
            key,
            state.next_run_at.as_ref().map(to_db_time),
            to_db_time(&state.last_run_at),
            state.last_status.as_str(),
            state.last_error,
            state.retire,
            to_db_time(&Utc::now()),
        ],
    )?;
    if changed == 0 {
        return Err(SchedulerError::NotFound(key.to_string()));
    }
    Ok(())
}

fn job_exists(conn: &Connection, key: &str) -> Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM jobs WHERE key = ?1", params![key], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

fn load_job(conn: &Connection, key: &str) -> Result<Job> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE key = ?1");
    conn.query_row(&sql, params![key], JobRow::from_row)
        .optional()?
        .ok_or_else(|| SchedulerError::NotFound(key.to_string()))?
        .into_job()
}

/// Raw column values; decoding into [`Job`] happens outside rusqlite so
/// schedule errors keep their own variant.
struct JobRow {
    key: String,
    label: String,
    schedule_kind: String,
    schedule_value: String,
    action: String,
    args_json: String,
    enabled: bool,
    timeout_seconds: Option<i64>,
    next_run_at: Option<String>,
    last_run_at: Option<String>,
    last_status: Option<String>,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            label: row.get(1)?,
            schedule_kind: row.get(2)?,
            schedule_value: row.get(3)?,
            action: row.get(4)?,
            args_json: row.get(5)?,
            enabled: row.get(6)?,
            timeout_seconds: row.get(7)?,
            next_run_at: row.get(8)?,
            last_run_at: row.get(9)?,
            last_status: row.get(10)?,
            last_error: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let schedule = Schedule::from_columns(&self.schedule_kind, &self.schedule_value)?;
        let last_run_at = self.last_run_at.as_deref().map(from_db_time).transpose()?;
        let fired = matches!(schedule, Schedule::Once { .. }) && last_run_at.is_some();
        Ok(Job {
            args: serde_json::from_str(&self.args_json).unwrap_or_else(|_| Value::Object(Default::default())),
            timeout_seconds: self.timeout_seconds.map(|t| t.max(1) as u64),
            next_run_at: self.next_run_at.as_deref().map(from_db_time).transpose()?,
            last_status: self.last_status.as_deref().map(str::parse).transpose()?,
            created_at: from_db_time(&self.created_at)?,
            updated_at: from_db_time(&self.updated_at)?,
            key: self.key,
            label: self.label,
            schedule,
            action: self.action,
            enabled: self.enabled,
            last_run_at,
            last_error: self.last_error,
            fired,
        })
    }
}
