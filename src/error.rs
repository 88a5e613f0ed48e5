//! Scheduler error taxonomy.
//!
//! Validation errors (`DuplicateKey`, `InvalidSchedule`, `InvalidJob`,
//! `NotFound`) surface to callers of the management interface. Execution
//! errors (`UnknownAction`, `ActionFailed`, `Timeout`) are captured by the
//! executor and end up in run records instead of propagating.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job '{0}' already exists")]
    DuplicateKey(String),

    #[error("invalid schedule '{spec}': {reason}")]
    InvalidSchedule { spec: String, reason: String },

    #[error("invalid job definition: {0}")]
    InvalidJob(String),

    #[error("job '{0}' not found")]
    NotFound(String),

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("action failed: {0}")]
    ActionFailed(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("action timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
}

impl SchedulerError {
    pub fn invalid_schedule(spec: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidSchedule {
            spec: spec.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<rusqlite::Error> for SchedulerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<r2d2::Error> for SchedulerError {
    fn from(e: r2d2::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

pub type Result<T, E = SchedulerError> = std::result::Result<T, E>;
