//! SQLite storage layer -- pool, schema, and the job store.

pub mod jobs;
pub mod schema;

pub use self::jobs::{JobScan, JobStore, ScheduleState};

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::error::SchedulerError;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

const CONNECTION_PRAGMAS: &str = "PRAGMA journal_mode = WAL;
     PRAGMA synchronous = FULL;
     PRAGMA foreign_keys = ON;
     PRAGMA busy_timeout = 5000;";

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| c.execute_batch(CONNECTION_PRAGMAS));
    let pool = R2D2Pool::new(manager)
        .with_context(|| format!("failed to open database {}", path.display()))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// In-memory database behind a single-connection pool.
///
/// Every `:memory:` connection is its own database, so the pool must never
/// hand out a second one.
pub fn open_memory_pool() -> Result<Pool> {
    let manager = SqliteConnectionManager::memory().with_init(|c| c.execute_batch(CONNECTION_PRAGMAS));
    let pool = R2D2Pool::builder().max_size(1).build(manager)?;
    let conn = pool.get()?;
    schema::migrate(&conn)?;
    Ok(pool)
}

/// Fixed-width UTC timestamp so that text ordering matches time ordering.
pub(crate) fn to_db_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn from_db_time(raw: &str) -> Result<DateTime<Utc>, SchedulerError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SchedulerError::Storage(format!("bad timestamp '{raw}': {e}")))
}
