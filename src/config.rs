//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::tasks::broadcast::DEFAULT_BROADCAST_CAPACITY;
use crate::tasks::retry::{DEFAULT_MAX_RETRIES, RetryPolicy};

/// Server and queue configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// HTTP/WebSocket listen port.
    pub port: u16,
    /// libSQL database file, or `:memory:`.
    pub db_path: String,
    /// Retries allowed per task.
    pub max_retries: u32,
    /// Advisory backoff before the first re-execution.
    pub retry_base_delay: Duration,
    /// Events a subscriber may fall behind before it lags.
    pub broadcast_capacity: usize,
    /// Retention for finished tasks. `None` disables pruning.
    pub prune_after: Option<Duration>,
    /// Directory for daily rolling log files. Stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: "./data/taskflow.db".to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: Duration::from_millis(2000),
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            prune_after: Some(Duration::from_secs(168 * 3600)), // 7 days
            log_dir: None,
        }
    }
}

impl QueueConfig {
    /// Read `TASKFLOW_*` variables, falling back to defaults when unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like `from_env`, reading values through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let retry_base_ms: u64 = parse_var(
            &lookup,
            "TASKFLOW_RETRY_BASE_MS",
            defaults.retry_base_delay.as_millis() as u64,
        )?;
        let prune_hours: u64 = parse_var(&lookup, "TASKFLOW_PRUNE_AFTER_HOURS", 168)?;
        let prune_secs = prune_hours
            .checked_mul(3600)
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "TASKFLOW_PRUNE_AFTER_HOURS".to_string(),
                message: format!("{prune_hours} hours overflows a duration"),
            })?;

        Ok(Self {
            port: parse_var(&lookup, "TASKFLOW_PORT", defaults.port)?,
            db_path: lookup("TASKFLOW_DB_PATH")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.db_path),
            max_retries: parse_var(&lookup, "TASKFLOW_MAX_RETRIES", defaults.max_retries)?,
            retry_base_delay: Duration::from_millis(retry_base_ms),
            broadcast_capacity: parse_var(
                &lookup,
                "TASKFLOW_BROADCAST_CAPACITY",
                defaults.broadcast_capacity,
            )?,
            prune_after: (prune_secs > 0).then(|| Duration::from_secs(prune_secs)),
            log_dir: lookup("TASKFLOW_LOG_DIR")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(self.max_retries)
            .with_base_delay(self.retry_base_delay)
    }

    pub fn is_ephemeral(&self) -> bool {
        self.db_path == ":memory:"
    }
}

fn parse_var<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
    }
}
