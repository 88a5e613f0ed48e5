//! Execution history tracking for scheduled runs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SchedulerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failure,
    Timeout,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunOutcome {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "timeout" => Ok(Self::Timeout),
            other => Err(SchedulerError::Storage(format!("unknown run outcome '{other}'"))),
        }
    }
}

/// A record of one job execution, as written by the executor.
#[derive(Debug, Clone, Serialize)]
pub struct NewRunRecord {
    pub job_key: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub error: Option<String>,
    pub output: Option<Value>,
}

impl NewRunRecord {
    pub fn success(
        job_key: impl Into<String>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        output: Value,
    ) -> Self {
        Self::build(job_key.into(), started_at, finished_at, RunOutcome::Success, None, Some(output))
    }

    /// A failed or timed-out run. The error text is kept even when empty.
    pub fn failed(
        job_key: impl Into<String>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        outcome: RunOutcome,
        error: impl Into<String>,
    ) -> Self {
        Self::build(job_key.into(), started_at, finished_at, outcome, Some(error.into()), None)
    }

    fn build(
        job_key: String,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        outcome: RunOutcome,
        error: Option<String>,
        output: Option<Value>,
    ) -> Self {
        // The wall clock may step backwards mid-run.
        let finished_at = finished_at.max(started_at);
        Self {
            job_key,
            started_at,
            finished_at,
            outcome,
            error,
            output,
        }
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// A persisted run record. Never modified after insert.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: i64,
    pub job_key: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub error: Option<String>,
    pub output: Option<Value>,
    pub duration_ms: i64,
}
