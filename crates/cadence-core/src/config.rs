use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_ENQUEUE_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 3_600;
pub const DEFAULT_JOB_TIMEOUT_MINUTES: u64 = 30; // whole execution
pub const DEFAULT_EXECUTION_TIMEOUT_MINUTES: u64 = 25; // single target run
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a connection waits on another instance's write lock.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Poller and dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between two due-schedule sweeps.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Upper bound on a single enqueue round-trip; the dispatch fails fast after it.
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,
    /// IANA zone applied to schedules stored without one.
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            enqueue_timeout_ms: DEFAULT_ENQUEUE_TIMEOUT_MS,
            default_timezone: DEFAULT_TIMEZONE.to_string(),
        }
    }
}

/// Staleness sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
    /// RUNNING executions older than this are failed.
    #[serde(default = "default_job_timeout_minutes")]
    pub job_timeout_minutes: u64,
    /// RUNNING per-target runs older than this are failed.
    #[serde(default = "default_execution_timeout_minutes")]
    pub execution_timeout_minutes: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_RECONCILE_INTERVAL_SECS,
            job_timeout_minutes: DEFAULT_JOB_TIMEOUT_MINUTES,
            execution_timeout_minutes: DEFAULT_EXECUTION_TIMEOUT_MINUTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Buffered tasks before enqueue starts failing.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_enqueue_timeout_ms() -> u64 {
    DEFAULT_ENQUEUE_TIMEOUT_MS
}
fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}
fn default_reconcile_interval_secs() -> u64 {
    DEFAULT_RECONCILE_INTERVAL_SECS
}
fn default_job_timeout_minutes() -> u64 {
    DEFAULT_JOB_TIMEOUT_MINUTES
}
fn default_execution_timeout_minutes() -> u64 {
    DEFAULT_EXECUTION_TIMEOUT_MINUTES
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.cadence/cadence.toml
    ///
    /// A missing file is not an error; every field has a default. Env keys use
    /// a double underscore between section and field so that field names keep
    /// their own underscores: `CADENCE_SCHEDULER__POLL_INTERVAL_SECS=10`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        debug!(%path, "loading configuration");

        Self::figment(&path)
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| crate::error::CadenceError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::from(Serialized::defaults(CadenceConfig::default())).merge(Toml::file(path))
    }

    /// Validate values the loops cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        let must_be_positive = [
            ("scheduler.poll_interval_secs", self.scheduler.poll_interval_secs),
            ("reconciler.interval_secs", self.reconciler.interval_secs),
            ("queue.capacity", self.queue.capacity as u64),
        ];
        for (key, value) in must_be_positive {
            if value == 0 {
                return Err(crate::error::CadenceError::InvalidSetting {
                    key,
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let config: CadenceConfig = CadenceConfig::figment("/nonexistent/cadence.toml")
            .extract()
            .expect("defaults should extract");
        assert_eq!(config.scheduler.poll_interval_secs, 30);
        assert_eq!(config.scheduler.default_timezone, "UTC");
        assert_eq!(config.reconciler.job_timeout_minutes, 30);
        assert_eq!(config.reconciler.execution_timeout_minutes, 25);
        assert_eq!(config.queue.capacity, 256);
    }

    #[test]
    fn toml_overrides_single_fields() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "[scheduler]\npoll_interval_secs = 5\ndefault_timezone = \"Europe/Berlin\"\n\n[database]\npath = \"/tmp/c.db\""
        )
        .expect("write");
        let path = file.path().to_string_lossy().to_string();

        let config: CadenceConfig = CadenceConfig::figment(&path).extract().expect("extract");
        assert_eq!(config.scheduler.poll_interval_secs, 5);
        assert_eq!(config.scheduler.default_timezone, "Europe/Berlin");
        assert_eq!(config.scheduler.enqueue_timeout_ms, DEFAULT_ENQUEUE_TIMEOUT_MS);
        assert_eq!(config.database.path, "/tmp/c.db");
        assert_eq!(config.reconciler.interval_secs, 3_600);
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let mut config = CadenceConfig::default();
        config.scheduler.poll_interval_secs = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "INVALID_SETTING");
        assert!(err.to_string().contains("scheduler.poll_interval_secs"));
    }
}
