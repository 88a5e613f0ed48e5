//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS jobs (
            key TEXT PRIMARY KEY,
            label TEXT NOT NULL,
            schedule_kind TEXT NOT NULL CHECK (schedule_kind IN ('interval', 'cron', 'once')),
            schedule_value TEXT NOT NULL,
            action TEXT NOT NULL,
            args_json TEXT NOT NULL DEFAULT '{}',
            enabled INTEGER NOT NULL DEFAULT 1,
            timeout_seconds INTEGER,
            next_run_at TEXT,
            last_run_at TEXT,
            last_status TEXT,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS run_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_key TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            outcome TEXT NOT NULL CHECK (outcome IN ('success', 'failure', 'timeout')),
            error TEXT,
            output_json TEXT,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            CHECK (finished_at >= started_at),
            FOREIGN KEY (job_key) REFERENCES jobs(key) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_enabled_next ON jobs(enabled, next_run_at);
        CREATE INDEX IF NOT EXISTS idx_run_records_job_started ON run_records(job_key, started_at);

        CREATE TRIGGER IF NOT EXISTS run_records_append_only
        BEFORE UPDATE ON run_records
        BEGIN
            SELECT RAISE(ABORT, 'run records are append-only');
        END;",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
