//! Retry policy: caps retries and computes advisory backoff.

use std::time::Duration;

use super::model::Task;
use crate::error::TaskError;

/// Default retry cap.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Decides whether a failed task may be retried.
///
/// The core never delays a `retry` action; `backoff` is advisory and only
/// consulted by a scheduler deciding when to start a `retrying` task.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed per task.
    pub max_retries: u32,
    /// Delay before the first re-execution.
    pub base_delay: Duration,
    /// Growth factor per additional retry.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn is_retry_eligible(&self, task: &Task) -> bool {
        task.retry_count < self.max_retries
    }

    /// Gate a `retry` request. The state machine is checked separately.
    pub fn check(&self, task: &Task) -> Result<(), TaskError> {
        if self.is_retry_eligible(task) {
            Ok(())
        } else {
            Err(TaskError::RetryLimitExceeded {
                id: task.id,
                retry_count: task.retry_count,
                max: self.max_retries,
            })
        }
    }

    /// Delay before starting attempt number `retry_count` (1-indexed):
    /// `base_delay * multiplier^(retry_count - 1)`, capped at `max_delay`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}
