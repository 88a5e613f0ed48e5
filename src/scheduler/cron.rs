//! Cron dialect.
//!
//! Standard five-field expressions (`min hour dom month dow`) are accepted
//! and padded with a leading `0` seconds field for the `cron` crate, which
//! also lets six/seven-field expressions and `@hourly`-style shorthands
//! through unchanged. All evaluation is in UTC. Numeric day-of-week values
//! follow the `cron` crate (1 = Sunday); names such as `MON-FRI` are the
//! portable spelling.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;

use crate::error::{Result, SchedulerError};

/// Parse a cron expression in the dialect described above.
pub fn parse(expr: &str) -> Result<CronSchedule> {
    let trimmed = expr.trim();
    let normalized = if trimmed.starts_with('@') {
        trimmed.to_string()
    } else {
        match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            6 | 7 => trimmed.to_string(),
            n => {
                return Err(SchedulerError::invalid_schedule(
                    expr,
                    format!("expected 5 fields, got {n}"),
                ))
            }
        }
    };

    CronSchedule::from_str(&normalized).map_err(|e| SchedulerError::invalid_schedule(expr, e))
}

/// First matching time strictly after `after`.
pub fn next_after(expr: &str, after: &DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    Ok(parse(expr)?.after(after).next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_five_field_is_accepted() {
        assert!(parse("*/5 * * * *").is_ok());
        assert!(parse("0 3 * * *").is_ok());
    }

    #[test]
    fn test_six_field_and_shorthand_pass_through() {
        assert!(parse("30 */5 * * * *").is_ok());
        assert!(parse("@hourly").is_ok());
    }

    #[test]
    fn test_wrong_field_count_rejected() {
        let err = parse("* * *").unwrap_err();
        assert!(err.to_string().contains("expected 5 fields"));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            parse("61 * * * *"),
            Err(SchedulerError::InvalidSchedule { .. })
        ));
    }

    #[test]
    fn test_next_after_is_strict() {
        let on_the_minute = Utc.with_ymd_and_hms(2026, 5, 1, 10, 5, 0).unwrap();
        let next = next_after("*/5 * * * *", &on_the_minute).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 5, 1, 10, 10, 0).unwrap());
    }
}
