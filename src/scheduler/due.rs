//! Due-job selection: pure functions of a job and the current time.
//!
//! Fixed intervals are drift-tolerant: the next run is `now + interval`
//! where `now` is the tick that dispatched the job, never
//! `next_run_at + interval`. A job that was overdue for an hour runs once and
//! then resumes its normal cadence instead of bursting to catch up.

use chrono::{DateTime, Duration, Utc};

use super::cron;
use super::job::{Job, Schedule};
use crate::error::Result;

/// Upper bound on fire times returned by [`upcoming`] per job.
const MAX_PREVIEW_PER_JOB: usize = 1_000;

/// Whether `job` should execute at `now`.
///
/// Disabled jobs are never due. Interval and cron jobs are due once their
/// stored `next_run_at` has passed. A cron expression that no longer parses
/// is returned as `InvalidSchedule` so the caller can report it.
pub fn is_due(job: &Job, now: DateTime<Utc>) -> Result<bool> {
    if !job.enabled {
        return Ok(false);
    }

    match &job.schedule {
        Schedule::Interval { .. } => Ok(job.next_run_at.map_or(true, |next| now >= next)),
        Schedule::Cron { expr } => {
            let schedule = cron::parse(expr)?;
            let next = match job.next_run_at {
                Some(next) => Some(next),
                None => schedule.after(&job.last_run_at.unwrap_or(job.created_at)).next(),
            };
            Ok(next.is_some_and(|next| next <= now))
        }
        Schedule::Once { at } => Ok(job.last_run_at.is_none() && now >= *at),
    }
}

/// `next_run_at` to store after an execution dispatched at `now`.
/// One-shot jobs have none.
pub fn compute_next_run(job: &Job, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match &job.schedule {
        Schedule::Interval { seconds } => Ok(Some(now + interval(*seconds))),
        Schedule::Cron { expr } => cron::next_after(expr, &now),
        Schedule::Once { .. } => Ok(None),
    }
}

/// `next_run_at` for a freshly created job.
pub fn initial_next_run(schedule: &Schedule, created_at: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match schedule {
        Schedule::Interval { seconds } => Ok(Some(created_at + interval(*seconds))),
        Schedule::Cron { expr } => cron::next_after(expr, &created_at),
        Schedule::Once { at } => Ok(Some(*at)),
    }
}

/// Fire times of `job` in `[from, until]`, assuming every run happens on
/// time. An overdue job reports its stored `next_run_at` first.
pub fn upcoming(job: &Job, from: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>> {
    if !job.enabled || job.fired {
        return Ok(Vec::new());
    }

    let mut times = Vec::new();
    match &job.schedule {
        Schedule::Interval { seconds } => {
            let mut next = job.next_run_at.unwrap_or(from);
            while next <= until && times.len() < MAX_PREVIEW_PER_JOB {
                times.push(next);
                next = next.max(from) + interval(*seconds);
            }
        }
        Schedule::Cron { expr } => {
            let schedule = cron::parse(expr)?;
            if let Some(next) = job.next_run_at.filter(|next| *next <= until) {
                times.push(next);
            }
            let start = job.next_run_at.map_or(from, |next| next.max(from));
            times.extend(
                schedule
                    .after(&start)
                    .take_while(|t| *t <= until)
                    .take(MAX_PREVIEW_PER_JOB - times.len()),
            );
        }
        Schedule::Once { at } => {
            if *at <= until {
                times.push(*at);
            }
        }
    }
    Ok(times)
}

fn interval(seconds: u64) -> Duration {
    // Bounded by MAX_INTERVAL_SECONDS at validation time.
    Duration::seconds(seconds.min(i64::MAX as u64 / 1_000) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchedulerError;
    use crate::scheduler::history::RunOutcome;
    use chrono::TimeZone;
    use serde_json::Value;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn job(schedule: Schedule) -> Job {
        let next_run_at = initial_next_run(&schedule, t(0)).unwrap();
        Job {
            key: "ping".into(),
            label: "ping".into(),
            schedule,
            action: "noop".into(),
            args: Value::Null,
            enabled: true,
            timeout_seconds: None,
            next_run_at,
            last_run_at: None,
            last_status: None,
            last_error: None,
            fired: false,
            created_at: t(0),
            updated_at: t(0),
        }
    }

    fn ran_at(mut job: Job, tick: DateTime<Utc>) -> Job {
        job.next_run_at = compute_next_run(&job, tick).unwrap();
        job.last_run_at = Some(tick);
        job.last_status = Some(RunOutcome::Success);
        if matches!(job.schedule, Schedule::Once { .. }) {
            job.fired = true;
            job.enabled = false;
        }
        job
    }

    #[test]
    fn test_interval_scenario() {
        // "ping" every 5s, created at T=0, ticking every second.
        let mut ping = job(Schedule::every(5));
        for s in 0..5 {
            assert!(!is_due(&ping, t(s)).unwrap(), "not due at T={s}");
        }
        assert!(is_due(&ping, t(5)).unwrap());

        ping = ran_at(ping, t(5));
        assert_eq!(ping.next_run_at, Some(t(10)));
        for s in 6..10 {
            assert!(!is_due(&ping, t(s)).unwrap(), "not due at T={s}");
        }
        assert!(is_due(&ping, t(10)).unwrap());
    }

    #[test]
    fn test_interval_does_not_catch_up() {
        let ping = job(Schedule::every(5));
        // Overdue by almost an hour.
        let late = t(3_600);
        assert!(is_due(&ping, late).unwrap());

        let ping = ran_at(ping, late);
        assert_eq!(ping.next_run_at, Some(late + Duration::seconds(5)));
        assert!(!is_due(&ping, late + Duration::seconds(1)).unwrap());
    }

    #[test]
    fn test_disabled_is_never_due() {
        let schedules = [
            Schedule::every(1),
            Schedule::cron("* * * * *"),
            Schedule::once(t(10)),
        ];
        for schedule in schedules {
            let mut j = job(schedule);
            j.enabled = false;
            for s in [-100, 0, 10, 60, 86_400] {
                assert!(!is_due(&j, t(s)).unwrap());
            }
        }
    }

    #[test]
    fn test_one_shot_fires_exactly_once() {
        let mut once = job(Schedule::once(t(100)));
        for s in [0, 50, 99] {
            assert!(!is_due(&once, t(s)).unwrap());
        }
        assert!(is_due(&once, t(100)).unwrap());

        once = ran_at(once, t(100));
        assert!(once.next_run_at.is_none());
        for s in [100, 101, 1_000, 1_000_000] {
            assert!(!is_due(&once, t(s)).unwrap());
        }

        // Re-enabling a fired one-shot does not make it due again.
        once.enabled = true;
        assert!(!is_due(&once, t(200)).unwrap());
    }

    #[test]
    fn test_cron_due_from_next_run() {
        // Every minute; created at 00:00:00, first match 00:01:00.
        let mut c = job(Schedule::cron("* * * * *"));
        assert_eq!(c.next_run_at, Some(t(60)));
        assert!(!is_due(&c, t(59)).unwrap());
        assert!(is_due(&c, t(61)).unwrap());

        c = ran_at(c, t(61));
        assert_eq!(c.next_run_at, Some(t(120)));
        assert!(!is_due(&c, t(90)).unwrap());
        assert!(is_due(&c, t(120)).unwrap());
    }

    #[test]
    fn test_cron_honours_overridden_first_run() {
        let mut c = job(Schedule::cron("0 3 * * *"));
        c.next_run_at = Some(t(10));
        assert!(!is_due(&c, t(9)).unwrap());
        assert!(is_due(&c, t(11)).unwrap());

        c = ran_at(c, t(11));
        assert_eq!(c.next_run_at, Some(t(3 * 3_600)));
        assert!(!is_due(&c, t(12)).unwrap());
    }

    #[test]
    fn test_cron_without_next_run_falls_back_to_last_run() {
        let mut c = job(Schedule::cron("* * * * *"));
        c.next_run_at = None;
        c.last_run_at = Some(t(61));
        assert!(!is_due(&c, t(90)).unwrap());
        assert!(is_due(&c, t(120)).unwrap());
    }

    #[test]
    fn test_corrupt_cron_is_reported() {
        let mut c = job(Schedule::every(5));
        c.schedule = Schedule::cron("nonsense");
        assert!(matches!(
            is_due(&c, t(10)),
            Err(SchedulerError::InvalidSchedule { .. })
        ));
    }

    #[test]
    fn test_upcoming_interval() {
        let ping = job(Schedule::every(30));
        let times = upcoming(&ping, t(0), t(100)).unwrap();
        assert_eq!(times, vec![t(30), t(60), t(90)]);
    }

    #[test]
    fn test_upcoming_cron_starts_at_stored_next_run() {
        let mut c = job(Schedule::cron("0 * * * *"));
        c.next_run_at = Some(t(10));
        let times = upcoming(&c, t(0), t(2 * 3_600)).unwrap();
        assert_eq!(times, vec![t(10), t(3_600), t(7_200)]);
    }

    #[test]
    fn test_upcoming_skips_fired_one_shot() {
        let once = ran_at(job(Schedule::once(t(10))), t(10));
        assert!(upcoming(&once, t(0), t(100)).unwrap().is_empty());

        let pending = job(Schedule::once(t(50)));
        assert_eq!(upcoming(&pending, t(0), t(100)).unwrap(), vec![t(50)]);
    }
}
