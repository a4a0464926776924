//! Count/time trigger policy for partition batches.
//!
//! A batch opens on the first poll of a cycle and closes as soon as it holds
//! `max_events` records or `max_wait` has elapsed, whichever comes first.

use churn_core::config::OrchestratorConfig;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct TriggerPolicy {
    pub max_events: usize,
    pub max_wait: Duration,
    /// Upper bound on a single source wait inside the batch window.
    pub poll_wait: Duration,
}

impl TriggerPolicy {
    pub fn new(max_events: usize, max_wait: Duration, poll_wait: Duration) -> Self {
        Self {
            max_events: max_events.max(1),
            max_wait,
            poll_wait,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(
            config.batch_max_events,
            Duration::from_millis(config.batch_max_wait_ms),
            Duration::from_millis(config.poll_wait_ms.max(1)),
        )
    }

    pub fn open(&self) -> BatchWindow {
        BatchWindow {
            policy: *self,
            opened_at: Instant::now(),
            collected: 0,
        }
    }
}

/// An open batch being filled by successive polls.
#[derive(Debug)]
pub struct BatchWindow {
    policy: TriggerPolicy,
    opened_at: Instant,
    collected: usize,
}

impl BatchWindow {
    pub fn record(&mut self, count: usize) {
        self.collected += count;
    }

    pub fn collected(&self) -> usize {
        self.collected
    }

    /// Records still accepted before the count trigger fires.
    pub fn room(&self) -> usize {
        self.policy.max_events.saturating_sub(self.collected)
    }

    pub fn is_due(&self) -> bool {
        self.room() == 0 || self.opened_at.elapsed() >= self.policy.max_wait
    }

    /// How long the next poll may wait.
    pub fn next_wait(&self) -> Duration {
        self.policy
            .max_wait
            .saturating_sub(self.opened_at.elapsed())
            .min(self.policy.poll_wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_trigger() {
        let policy = TriggerPolicy::new(3, Duration::from_secs(60), Duration::from_millis(100));
        let mut batch = policy.open();
        batch.record(2);
        assert!(!batch.is_due());
        assert_eq!(batch.room(), 1);
        batch.record(1);
        assert!(batch.is_due());
    }

    #[test]
    fn test_time_trigger() {
        let policy = TriggerPolicy::new(100, Duration::from_millis(5), Duration::from_millis(100));
        let batch = policy.open();
        assert!(batch.next_wait() <= Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(10));
        assert!(batch.is_due());
        assert_eq!(batch.next_wait(), Duration::ZERO);
    }
}
