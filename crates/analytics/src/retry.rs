//! Bounded exponential backoff for sink and transport calls.

use churn_core::config::WriterConfig;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Spread each delay by up to ±25%.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl From<&WriterConfig> for RetryPolicy {
    fn from(config: &WriterConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            backoff_multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base_ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.max_backoff_ms as f64);

        let final_ms = if self.jitter {
            capped_ms * rand::thread_rng().gen_range(0.75..=1.25)
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms.max(0.0) as u64)
    }
}
