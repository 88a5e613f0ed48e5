//! Job definitions and schedule specs.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::cron;
use super::history::RunOutcome;
use crate::error::{Result, SchedulerError};

/// Longest accepted fixed interval (one year).
pub const MAX_INTERVAL_SECONDS: u64 = 366 * 24 * 60 * 60;

const MAX_KEY_LEN: usize = 128;

/// When a job should run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Every `seconds`, measured from the tick that last dispatched the job.
    Interval { seconds: u64 },
    /// Five-field cron expression, evaluated in UTC.
    Cron { expr: String },
    /// Exactly once at `at`.
    Once { at: DateTime<Utc> },
}

impl Schedule {
    pub fn every(seconds: u64) -> Self {
        Self::Interval { seconds }
    }

    pub fn cron(expr: impl Into<String>) -> Self {
        Self::Cron { expr: expr.into() }
    }

    pub fn once(at: DateTime<Utc>) -> Self {
        Self::Once { at }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Interval { .. } => "interval",
            Self::Cron { .. } => "cron",
            Self::Once { .. } => "once",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Interval { seconds } => {
                if *seconds == 0 || *seconds > MAX_INTERVAL_SECONDS {
                    return Err(SchedulerError::invalid_schedule(
                        self.to_string(),
                        format!("interval must be between 1 and {MAX_INTERVAL_SECONDS} seconds"),
                    ));
                }
                Ok(())
            }
            Self::Cron { expr } => cron::parse(expr).map(|_| ()),
            Self::Once { .. } => Ok(()),
        }
    }

    /// Value column as persisted next to [`Schedule::kind`].
    pub(crate) fn value_column(&self) -> String {
        match self {
            Self::Interval { seconds } => seconds.to_string(),
            Self::Cron { expr } => expr.clone(),
            Self::Once { at } => crate::storage::to_db_time(at),
        }
    }

    /// Rebuild from persisted columns. Cron expressions are not parsed here;
    /// that happens when the job is evaluated.
    pub(crate) fn from_columns(kind: &str, value: &str) -> Result<Self> {
        match kind {
            "interval" => value
                .parse::<u64>()
                .map(|seconds| Self::Interval { seconds })
                .map_err(|e| SchedulerError::invalid_schedule(value, e)),
            "cron" => Ok(Self::Cron {
                expr: value.to_string(),
            }),
            "once" => DateTime::parse_from_rfc3339(value)
                .map(|at| Self::Once {
                    at: at.with_timezone(&Utc),
                })
                .map_err(|e| SchedulerError::invalid_schedule(value, e)),
            other => Err(SchedulerError::invalid_schedule(
                value,
                format!("unknown schedule kind '{other}'"),
            )),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interval { seconds } => write!(f, "every {seconds}s"),
            Self::Cron { expr } => write!(f, "cron '{expr}'"),
            Self::Once { at } => write!(f, "once at {}", at.to_rfc3339()),
        }
    }
}

/// A persisted job.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub key: String,
    pub label: String,
    pub schedule: Schedule,
    /// Action tag resolved through the action registry, e.g. `health_check:jenkins`.
    pub action: String,
    pub args: Value,
    pub enabled: bool,
    /// Overrides the scheduler's default execution timeout.
    pub timeout_seconds: Option<u64>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<RunOutcome>,
    pub last_error: Option<String>,
    /// One-shot job that already executed. It is kept (disabled) with its
    /// history and is never due again, even if re-enabled.
    pub fired: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for [`crate::storage::JobStore::create_job`].
#[derive(Debug, Clone, Deserialize)]
pub struct NewJob {
    pub key: String,
    #[serde(default)]
    pub label: Option<String>,
    pub schedule: Schedule,
    pub action: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Override for the first `next_run_at`; by default it is derived from the
    /// schedule and the creation time.
    #[serde(default)]
    pub first_run_at: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl NewJob {
    pub fn new(key: impl Into<String>, schedule: Schedule, action: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            label: None,
            schedule,
            action: action.into(),
            args: Value::Null,
            enabled: true,
            timeout_seconds: None,
            first_run_at: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn first_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.first_run_at = Some(at);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let key = self.key.trim();
        if key.is_empty() {
            return Err(SchedulerError::InvalidJob("key must not be empty".into()));
        }
        if key != self.key || key.len() > MAX_KEY_LEN {
            return Err(SchedulerError::InvalidJob(format!(
                "key '{}' must be at most {MAX_KEY_LEN} characters without surrounding whitespace",
                self.key
            )));
        }
        if self.action.trim().is_empty() {
            return Err(SchedulerError::InvalidJob("action must not be empty".into()));
        }
        if !(self.args.is_object() || self.args.is_null()) {
            return Err(SchedulerError::InvalidJob("args must be a JSON object".into()));
        }
        if self.timeout_seconds == Some(0) {
            return Err(SchedulerError::InvalidJob("timeout must be positive".into()));
        }
        if self.first_run_at.is_some() && matches!(self.schedule, Schedule::Once { .. }) {
            return Err(SchedulerError::InvalidJob(
                "first_run_at does not apply to one-shot jobs; set the schedule time instead".into(),
            ));
        }
        self.schedule.validate()
    }

    /// Label to persist; falls back to the key.
    pub(crate) fn label_or_key(&self) -> &str {
        self.label
            .as_deref()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or(&self.key)
    }

    pub(crate) fn args_or_empty(&self) -> Value {
        if self.args.is_null() {
            Value::Object(Default::default())
        } else {
            self.args.clone()
        }
    }
}

/// Partial update for [`crate::storage::JobStore::update_job`]. Absent fields
/// keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobPatch {
    pub label: Option<String>,
    pub schedule: Option<Schedule>,
    pub action: Option<String>,
    pub args: Option<Value>,
    pub enabled: Option<bool>,
    pub timeout_seconds: Option<u64>,
}

impl JobPatch {
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Whether the patch changes the schedule of `job`.
    pub(crate) fn reschedules(&self, job: &Job) -> bool {
        self.schedule.as_ref().is_some_and(|s| *s != job.schedule)
    }

    /// `job` with the patch applied, in the shape `create_job` validates.
    pub(crate) fn merge(&self, job: &Job) -> NewJob {
        NewJob {
            key: job.key.clone(),
            label: Some(self.label.clone().unwrap_or_else(|| job.label.clone())),
            schedule: self.schedule.clone().unwrap_or_else(|| job.schedule.clone()),
            action: self.action.clone().unwrap_or_else(|| job.action.clone()),
            args: self.args.clone().unwrap_or_else(|| job.args.clone()),
            enabled: self.enabled.unwrap_or(job.enabled),
            timeout_seconds: self.timeout_seconds.or(job.timeout_seconds),
            first_run_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_schedule_columns_round_trip() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        for schedule in [Schedule::every(60), Schedule::cron("*/5 * * * *"), Schedule::once(at)] {
            let back = Schedule::from_columns(schedule.kind(), &schedule.value_column()).unwrap();
            assert_eq!(back, schedule);
        }
    }

    #[test]
    fn test_unknown_kind_is_invalid_schedule() {
        let err = Schedule::from_columns("weekly", "1").unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule { .. }));
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(matches!(
            Schedule::every(0).validate(),
            Err(SchedulerError::InvalidSchedule { .. })
        ));
        assert!(Schedule::every(1).validate().is_ok());
    }

    #[test]
    fn test_new_job_validation() {
        let ok = NewJob::new("ping", Schedule::every(5), "noop");
        assert!(ok.validate().is_ok());

        let blank = NewJob::new("  ", Schedule::every(5), "noop");
        assert!(matches!(blank.validate(), Err(SchedulerError::InvalidJob(_))));

        let padded = NewJob::new(" ping", Schedule::every(5), "noop");
        assert!(matches!(padded.validate(), Err(SchedulerError::InvalidJob(_))));

        let bad_args = NewJob::new("ping", Schedule::every(5), "noop").with_args(json!([1, 2]));
        assert!(matches!(bad_args.validate(), Err(SchedulerError::InvalidJob(_))));

        let bad_cron = NewJob::new("ping", Schedule::cron("not a cron"), "noop");
        assert!(matches!(
            bad_cron.validate(),
            Err(SchedulerError::InvalidSchedule { .. })
        ));
    }

    #[test]
    fn test_first_run_override_rejected_for_one_shot() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let once = NewJob::new("migrate", Schedule::once(at), "noop").first_run_at(at);
        assert!(matches!(once.validate(), Err(SchedulerError::InvalidJob(_))));

        let cron = NewJob::new("nightly", Schedule::cron("0 3 * * *"), "noop").first_run_at(at);
        assert!(cron.validate().is_ok());
    }

    #[test]
    fn test_patch_rejects_unknown_fields() {
        let patch: JobPatch = serde_json::from_value(json!({ "label": "Jenkins" })).unwrap();
        assert_eq!(patch.label.as_deref(), Some("Jenkins"));
        assert!(patch.schedule.is_none());

        assert!(serde_json::from_value::<JobPatch>(json!({ "key": "renamed" })).is_err());
    }

    #[test]
    fn test_new_job_deserializes_with_defaults() {
        let job: NewJob = serde_json::from_value(json!({
            "key": "jenkins-health",
            "schedule": { "kind": "interval", "seconds": 60 },
            "action": "health_check:jenkins"
        }))
        .unwrap();

        assert!(job.enabled);
        assert_eq!(job.schedule, Schedule::every(60));
        assert_eq!(job.label_or_key(), "jenkins-health");
        assert_eq!(job.args_or_empty(), json!({}));
    }
}
