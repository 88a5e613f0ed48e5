//! Default jobs seeded into an empty store.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::job::{NewJob, Schedule};
use crate::actions::health;
use crate::error::{Result, SchedulerError};
use crate::storage::JobStore;

/// Return the default out-of-box jobs. They are due immediately so a fresh
/// install shows results on the first tick.
pub fn defaults(now: DateTime<Utc>) -> Vec<NewJob> {
    [
        ("docker-health", "Docker: health check", "docker"),
        ("jenkins-health", "Jenkins: server info", "jenkins"),
        ("kubernetes-health", "Kubernetes: health check", "kubernetes"),
        ("nexus-health", "Nexus: health check", "nexus"),
        ("sonarqube-health", "SonarQube: system status", "sonarqube"),
    ]
    .into_iter()
    .map(|(key, label, system)| {
        NewJob::new(key, Schedule::every(60), health::tag(system))
            .with_label(label)
            .first_run_at(now)
    })
    .collect()
}

/// Seed [`defaults`] if the store has no jobs at all. Existing keys are
/// never duplicated or overwritten. Returns how many jobs were created.
pub fn bootstrap(store: &JobStore, now: DateTime<Utc>) -> Result<usize> {
    if !store.is_empty()? {
        debug!("Store already has jobs; skipping bootstrap");
        return Ok(0);
    }

    let mut created = 0;
    for job in defaults(now) {
        let key = job.key.clone();
        match store.create_job_at(job, now) {
            Ok(_) => created += 1,
            Err(SchedulerError::DuplicateKey(_)) => debug!(job = %key, "Default job already present"),
            Err(e) => return Err(e),
        }
    }
    info!(created, "Bootstrapped default jobs");
    Ok(created)
}
