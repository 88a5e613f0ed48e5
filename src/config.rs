//! TOML configuration for the scheduler service.
//!
//! Layered: compiled-in defaults, then an optional TOML file, then
//! environment variables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "SCHEDULER_CONFIG";

/// External systems with a built-in health check: name, URL variable, path.
pub const KNOWN_TARGETS: &[(&str, &str, &str)] = &[
    ("docker", "DOCKER_URL", "/_ping"),
    ("jenkins", "JENKINS_URL", "/api/json"),
    ("kubernetes", "KUBERNETES_URL", "/livez"),
    ("nexus", "NEXUS_URL", "/service/rest/v1/status"),
    ("sonarqube", "SONARQUBE_URL", "/api/system/status"),
];

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub scheduler: LoopConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Health-check targets keyed by system name.
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,
}

impl SchedulerConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded scheduler configuration");
        Ok(config)
    }

    /// File at `path` (if given and present) or defaults, with environment
    /// overrides applied on top.
    pub fn load_layered(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => Self::load(p)?,
            Some(p) => {
                warn!(path = %p.display(), "config file not found, using defaults");
                Self::default()
            }
            None => {
                debug!("no config file given, using compiled-in defaults");
                Self::default()
            }
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("SCHEDULER_TICK_SECONDS") {
            env_parse(&mut self.scheduler.tick_seconds, "SCHEDULER_TICK_SECONDS", &v);
        }
        if let Some(v) = get("SCHEDULER_BOOTSTRAP_JOBS") {
            match parse_bool(&v) {
                Some(b) => self.scheduler.bootstrap_jobs = b,
                None => warn!(value = %v, "ignoring unparsable SCHEDULER_BOOTSTRAP_JOBS"),
            }
        }
        if let Some(v) = get("SCHEDULER_JOB_TIMEOUT_SECONDS") {
            env_parse(&mut self.scheduler.job_timeout_seconds, "SCHEDULER_JOB_TIMEOUT_SECONDS", &v);
        }
        if let Some(v) = get("SCHEDULER_MAX_CONCURRENCY") {
            env_parse(&mut self.scheduler.max_concurrency, "SCHEDULER_MAX_CONCURRENCY", &v);
        }
        if let Some(v) = get("SCHEDULER_MAX_JOBS_PER_TICK") {
            env_parse(&mut self.scheduler.max_jobs_per_tick, "SCHEDULER_MAX_JOBS_PER_TICK", &v);
        }
        if let Some(v) = get("SCHEDULER_SHUTDOWN_GRACE_SECONDS") {
            env_parse(&mut self.scheduler.shutdown_grace_seconds, "SCHEDULER_SHUTDOWN_GRACE_SECONDS", &v);
        }
        // Shared platform database wins over the scheduler-specific one.
        if let Some(v) = get("PLATFORM_DATABASE_URL").or_else(|| get("SCHEDULER_DATABASE_URL")) {
            self.storage.database_url = v;
        }
        if let Some(v) = get("SCHEDULER_HTTP_BIND") {
            self.api.bind = v;
        }
        if let Some(v) = get("SCHEDULER_LOG_FORMAT") {
            self.logging.format = v;
        }
        for &(system, var, _) in KNOWN_TARGETS {
            if let Some(url) = get(var) {
                self.targets
                    .entry(system.to_string())
                    .and_modify(|t| t.url = url.clone())
                    .or_insert(TargetConfig {
                        url,
                        health_path: None,
                    });
            }
        }

        self.scheduler.clamp();
    }
}

fn env_parse<T: std::str::FromStr>(slot: &mut T, name: &str, raw: &str) {
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(_) => warn!(var = name, value = %raw, "ignoring unparsable environment override"),
    }
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tick loop
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Seconds between ticks (minimum 1).
    pub tick_seconds: u64,
    /// Seed the default jobs when the store is empty.
    pub bootstrap_jobs: bool,
    /// Default per-job execution timeout.
    pub job_timeout_seconds: u64,
    /// Maximum executions in flight at once.
    pub max_concurrency: usize,
    /// Maximum jobs dispatched in one tick; the rest wait for the next one.
    pub max_jobs_per_tick: usize,
    /// How long shutdown waits for in-flight executions before abandoning them.
    pub shutdown_grace_seconds: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 5,
            bootstrap_jobs: true,
            job_timeout_seconds: 30,
            max_concurrency: 8,
            max_jobs_per_tick: 20,
            shutdown_grace_seconds: 10,
        }
    }
}

impl LoopConfig {
    fn clamp(&mut self) {
        self.tick_seconds = self.tick_seconds.max(1);
        self.job_timeout_seconds = self.job_timeout_seconds.max(1);
        self.max_concurrency = self.max_concurrency.max(1);
        self.max_jobs_per_tick = self.max_jobs_per_tick.max(1);
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_seconds.max(1))
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_seconds.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite path or `sqlite:///path` URL.
    pub database_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "data/scheduler.db".to_string(),
        }
    }
}

impl StorageConfig {
    /// Filesystem path of the SQLite database.
    pub fn database_path(&self) -> Result<PathBuf> {
        let url = self.database_url.trim();
        if let Some(rest) = url.strip_prefix("sqlite:///") {
            // sqlite:////abs/path keeps its leading slash
            return Ok(PathBuf::from(rest));
        }
        if let Some(rest) = url.strip_prefix("sqlite://") {
            return Ok(PathBuf::from(rest));
        }
        if let Some(rest) = url.strip_prefix("sqlite:") {
            return Ok(PathBuf::from(rest));
        }
        if let Some((scheme, _)) = url.split_once("://") {
            anyhow::bail!("unsupported database backend '{scheme}': only SQLite is supported");
        }
        Ok(PathBuf::from(url))
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address for the HTTP management API.
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8010".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence.
    pub level: String,
    /// `text` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

/// An external system checked by `health_check:<name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Base URL, e.g. `http://jenkins:8080`.
    pub url: String,
    /// Path appended to `url`; defaults to the system's well-known endpoint.
    #[serde(default)]
    pub health_path: Option<String>,
}

impl TargetConfig {
    pub fn health_url(&self, system: &str) -> String {
        let path = self.health_path.as_deref().or_else(|| {
            KNOWN_TARGETS
                .iter()
                .find(|(name, _, _)| *name == system)
                .map(|(_, _, path)| *path)
        });
        let base = self.url.trim_end_matches('/');
        match path {
            Some(p) if p.starts_with('/') => format!("{base}{p}"),
            Some(p) if !p.is_empty() => format!("{base}/{p}"),
            _ => base.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_sane() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.scheduler.tick_seconds, 5);
        assert!(cfg.scheduler.bootstrap_jobs);
        assert_eq!(cfg.scheduler.job_timeout_seconds, 30);
        assert_eq!(cfg.scheduler.max_concurrency, 8);
        assert_eq!(cfg.scheduler.max_jobs_per_tick, 20);
        assert_eq!(cfg.storage.database_url, "data/scheduler.db");
        assert_eq!(cfg.api.bind, "127.0.0.1:8010");
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.is_json());
        assert!(cfg.targets.is_empty());
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[scheduler]
tick_seconds = 2
bootstrap_jobs = false
job_timeout_seconds = 15

[storage]
database_url = "sqlite:///var/lib/opsched/scheduler.db"

[api]
bind = "0.0.0.0:9000"

[logging]
level = "debug"
format = "json"

[targets.jenkins]
url = "http://jenkins:8080/"

[targets.nexus]
url = "http://nexus:8081"
health_path = "/service/rest/v1/status/writable"
"#;

        let cfg: SchedulerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.scheduler.tick_seconds, 2);
        assert!(!cfg.scheduler.bootstrap_jobs);
        assert_eq!(cfg.scheduler.job_timeout_seconds, 15);
        assert_eq!(cfg.scheduler.max_concurrency, 8); // default
        assert_eq!(
            cfg.storage.database_path().unwrap(),
            PathBuf::from("var/lib/opsched/scheduler.db")
        );
        assert_eq!(cfg.api.bind, "0.0.0.0:9000");
        assert!(cfg.logging.is_json());
        assert_eq!(
            cfg.targets["jenkins"].health_url("jenkins"),
            "http://jenkins:8080/api/json"
        );
        assert_eq!(
            cfg.targets["nexus"].health_url("nexus"),
            "http://nexus:8081/service/rest/v1/status/writable"
        );
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: SchedulerConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.scheduler.tick_seconds, LoopConfig::default().tick_seconds);
        assert_eq!(cfg.api.bind, ApiConfig::default().bind);
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = SchedulerConfig::default();
        cfg.apply_env(env(&[
            ("SCHEDULER_TICK_SECONDS", "1"),
            ("SCHEDULER_BOOTSTRAP_JOBS", "off"),
            ("SCHEDULER_JOB_TIMEOUT_SECONDS", "12"),
            ("SCHEDULER_DATABASE_URL", "sqlite:///tmp/other.db"),
            ("PLATFORM_DATABASE_URL", "/srv/platform.db"),
            ("SCHEDULER_HTTP_BIND", "0.0.0.0:8010"),
            ("JENKINS_URL", "http://ci:8080"),
        ]));

        assert_eq!(cfg.scheduler.tick_seconds, 1);
        assert!(!cfg.scheduler.bootstrap_jobs);
        assert_eq!(cfg.scheduler.job_timeout_seconds, 12);
        assert_eq!(cfg.storage.database_url, "/srv/platform.db");
        assert_eq!(cfg.api.bind, "0.0.0.0:8010");
        assert_eq!(cfg.targets["jenkins"].health_url("jenkins"), "http://ci:8080/api/json");
    }

    #[test]
    fn test_bad_env_values_keep_defaults() {
        let mut cfg = SchedulerConfig::default();
        cfg.apply_env(env(&[
            ("SCHEDULER_TICK_SECONDS", "soon"),
            ("SCHEDULER_BOOTSTRAP_JOBS", "maybe"),
            ("SCHEDULER_MAX_CONCURRENCY", "0"),
        ]));
        assert_eq!(cfg.scheduler.tick_seconds, 5);
        assert!(cfg.scheduler.bootstrap_jobs);
        // Parsed but clamped.
        assert_eq!(cfg.scheduler.max_concurrency, 1);
    }

    #[test]
    fn test_database_path_forms() {
        let path = |url: &str| {
            StorageConfig {
                database_url: url.to_string(),
            }
            .database_path()
        };
        assert_eq!(path("data/scheduler.db").unwrap(), PathBuf::from("data/scheduler.db"));
        assert_eq!(path("sqlite:///data/s.db").unwrap(), PathBuf::from("data/s.db"));
        assert_eq!(path("sqlite:////abs/s.db").unwrap(), PathBuf::from("/abs/s.db"));
        assert!(path("postgresql://db:5432/platform").is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("perhaps"), None);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("opsched.toml");
        std::fs::write(&path, "[api]\nbind = \"127.0.0.1:9999\"\n").unwrap();

        let cfg = SchedulerConfig::load(&path).unwrap();
        assert_eq!(cfg.api.bind, "127.0.0.1:9999");
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(SchedulerConfig::load(Path::new("/nonexistent/opsched.toml")).is_err());
    }
}
