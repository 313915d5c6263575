//! Reconnection policy with exponential backoff.

use std::time::Duration;

use crate::core::config::RetryPolicy;

/// Decides whether and when the supervisor schedules another connect attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub multiplier: f64,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&RetryPolicy::default())
    }
}

impl From<&RetryPolicy> for ReconnectPolicy {
    fn from(policy: &RetryPolicy) -> Self {
        Self {
            enabled: policy.enabled,
            max_attempts: policy.max_retries,
            multiplier: policy.backoff_multiplier.max(1.0),
            base_delay: Duration::from_millis(policy.initial_delay),
            max_delay: Duration::from_millis(policy.max_delay.max(policy.initial_delay)),
        }
    }
}

impl ReconnectPolicy {
    /// Whether a retry may follow after `attempts` retries were already scheduled.
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.enabled && attempts < self.max_attempts
    }

    /// delay = min(base_delay * multiplier^(attempt-1), max_delay)
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.powi(exponent);
        let delay_ms = self.base_delay.as_millis() as f64 * factor;
        let max_ms = self.max_delay.as_millis() as f64;
        if !delay_ms.is_finite() || delay_ms >= max_ms {
            return self.max_delay;
        }
        Duration::from_millis(delay_ms.round() as u64)
    }
}
