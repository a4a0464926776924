//! Prediction writer: idempotent upserts with bounded retries.
//!
//! Every attempt has its own deadline. A prediction is never dropped
//! silently: exhaustion is reported to the caller, which must hold the
//! partition checkpoint back.
//!
//! Retry depth is tracked per partition in a [`RetryQueue`], so a flaky
//! write on one partition never throttles another.

use crate::retry::RetryPolicy;
use churn_core::config::WriterConfig;
use churn_core::sink::{PredictionSink, WriteError};
use churn_core::types::{PartitionId, Prediction};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// Written on the first attempt.
    Committed,
    /// Written after retrying transient failures.
    Retried { attempts: u32 },
    /// Not written. The partition must not checkpoint past this prediction.
    Failed { attempts: u32, error: WriteError },
}

impl WriteOutcome {
    pub fn is_committed(&self) -> bool {
        !matches!(self, WriteOutcome::Failed { .. })
    }
}

/// Writes of one partition currently waiting out a retry backoff.
#[derive(Debug)]
pub struct RetryQueue {
    partition: PartitionId,
    depth: AtomicUsize,
}

impl RetryQueue {
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            depth: AtomicUsize::new(0),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    fn enter(&self) -> RetryTicket<'_> {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.publish(depth);
        RetryTicket { queue: self }
    }

    fn publish(&self, depth: usize) {
        metrics::gauge!("writer.pending", "partition" => self.partition.to_string())
            .set(depth as f64);
    }
}

/// Holds one slot of a [`RetryQueue`]; released on drop, including when the
/// write is aborted mid-backoff.
struct RetryTicket<'a> {
    queue: &'a RetryQueue,
}

impl Drop for RetryTicket<'_> {
    fn drop(&mut self) {
        let depth = self.queue.depth.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        self.queue.publish(depth);
    }
}

pub struct PredictionWriter {
    sink: Arc<dyn PredictionSink>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    max_in_flight: usize,
    max_pending: usize,
}

impl PredictionWriter {
    pub fn new(sink: Arc<dyn PredictionSink>, config: &WriterConfig) -> Self {
        Self {
            sink,
            policy: RetryPolicy::from(config),
            attempt_timeout: Duration::from_millis(config.timeout_ms.max(1)),
            max_in_flight: config.max_in_flight.max(1),
            max_pending: config.max_pending.max(1),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn sink(&self) -> &Arc<dyn PredictionSink> {
        &self.sink
    }

    /// Concurrent upserts a partition may keep open.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// The partition's retry queue is full; dispatch nothing new until a
    /// retrying write settles.
    pub fn is_saturated(&self, retries: &RetryQueue) -> bool {
        retries.depth() >= self.max_pending
    }

    pub async fn write(&self, prediction: &Prediction, retries: &RetryQueue) -> WriteOutcome {
        let mut attempts = 0;
        let mut ticket = None;

        let outcome = loop {
            attempts += 1;
            let result = match tokio::time::timeout(self.attempt_timeout, self.sink.upsert(prediction)).await
            {
                Ok(result) => result,
                Err(_) => Err(WriteError::Timeout),
            };

            match result {
                Ok(()) if attempts == 1 => {
                    metrics::counter!("writer.committed").increment(1);
                    break WriteOutcome::Committed;
                }
                Ok(()) => {
                    metrics::counter!("writer.committed").increment(1);
                    metrics::counter!("writer.retried").increment(1);
                    debug!(
                        entity_id = %prediction.entity_id,
                        window_id = %prediction.window_id,
                        attempts,
                        "Prediction written after retry"
                    );
                    break WriteOutcome::Retried { attempts };
                }
                Err(e) if e.is_retryable() && attempts < self.policy.max_attempts => {
                    if ticket.is_none() {
                        ticket = Some(retries.enter());
                    }
                    let backoff = self.policy.backoff_for_attempt(attempts - 1);
                    warn!(
                        sink = self.sink.name(),
                        entity_id = %prediction.entity_id,
                        window_id = %prediction.window_id,
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Prediction write failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    metrics::counter!("writer.failed").increment(1);
                    error!(
                        sink = self.sink.name(),
                        entity_id = %prediction.entity_id,
                        window_id = %prediction.window_id,
                        attempts,
                        error = %e,
                        "Prediction write failed permanently"
                    );
                    break WriteOutcome::Failed { attempts, error: e };
                }
            }
        };

        drop(ticket);
        outcome
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::InMemoryPredictionSink;
    use chrono::Utc;
    use churn_core::types::WindowId;

    fn prediction() -> Prediction {
        Prediction {
            entity_id: "C1".into(),
            window_id: WindowId(1),
            scored_at: Utc::now(),
            churn_probability: 0.82,
            churn_flag: 1,
            risk_factors: vec![],
            model_version: "v1".into(),
        }
    }

    fn writer(sink: Arc<InMemoryPredictionSink>, max_attempts: u32) -> PredictionWriter {
        let config = WriterConfig {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            jitter: false,
            timeout_ms: 50,
            ..WriterConfig::default()
        };
        PredictionWriter::new(sink, &config)
    }

    #[tokio::test]
    async fn test_first_attempt_commits() {
        let sink = Arc::new(InMemoryPredictionSink::new());
        let outcome = writer(sink.clone(), 3).write(&prediction(), &RetryQueue::new(0)).await;
        assert_eq!(outcome, WriteOutcome::Committed);
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_fails_twice_then_succeeds() {
        let sink = Arc::new(InMemoryPredictionSink::new());
        sink.fail_next(2, WriteError::Transient("connection reset".into()));
        let retries = RetryQueue::new(0);
        let outcome = writer(sink.clone(), 5).write(&prediction(), &retries).await;
        assert_eq!(outcome, WriteOutcome::Retried { attempts: 3 });
        assert_eq!(sink.attempts(), 3);
        assert_eq!(retries.depth(), 0);
    }

    #[tokio::test]
    async fn test_retrying_write_saturates_its_partition_only() {
        let sink = Arc::new(InMemoryPredictionSink::new());
        sink.fail_next(1, WriteError::Transient("connection reset".into()));
        let config = WriterConfig {
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 50,
            jitter: false,
            max_in_flight: 4,
            max_pending: 1,
            ..WriterConfig::default()
        };
        let writer = Arc::new(PredictionWriter::new(sink, &config));
        let flaky = Arc::new(RetryQueue::new(0));
        let healthy = RetryQueue::new(1);

        let task = {
            let (writer, flaky) = (writer.clone(), flaky.clone());
            tokio::spawn(async move { writer.write(&prediction(), &flaky).await })
        };
        for _ in 0..100 {
            if flaky.depth() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(writer.is_saturated(&flaky));
        assert!(!writer.is_saturated(&healthy));

        assert_eq!(task.await.unwrap(), WriteOutcome::Retried { attempts: 2 });
        assert!(!writer.is_saturated(&flaky));
    }

    #[tokio::test]
    async fn test_aborted_write_releases_retry_slot() {
        let sink = Arc::new(InMemoryPredictionSink::new());
        sink.fail_next(10, WriteError::Transient("down".into()));
        let config = WriterConfig {
            max_attempts: 10,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 1_000,
            jitter: false,
            ..WriterConfig::default()
        };
        let writer = Arc::new(PredictionWriter::new(sink, &config));
        let retries = Arc::new(RetryQueue::new(0));

        let task = {
            let (writer, retries) = (writer.clone(), retries.clone());
            tokio::spawn(async move { writer.write(&prediction(), &retries).await })
        };
        for _ in 0..100 {
            if retries.depth() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(retries.depth(), 1);
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(retries.depth(), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_is_reported() {
        let sink = Arc::new(InMemoryPredictionSink::new());
        sink.fail_next(10, WriteError::Transient("down".into()));
        let outcome = writer(sink.clone(), 3).write(&prediction(), &RetryQueue::new(0)).await;
        assert!(matches!(outcome, WriteOutcome::Failed { attempts: 3, .. }));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let sink = Arc::new(InMemoryPredictionSink::new());
        sink.fail_next(1, WriteError::Rejected("schema mismatch".into()));
        let outcome = writer(sink.clone(), 5).write(&prediction(), &RetryQueue::new(0)).await;
        assert!(matches!(outcome, WriteOutcome::Failed { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_slow_sink_times_out() {
        let sink = Arc::new(InMemoryPredictionSink::new());
        sink.set_delay(Duration::from_millis(200));
        let outcome = writer(sink.clone(), 2).write(&prediction(), &RetryQueue::new(0)).await;
        assert_eq!(
            outcome,
            WriteOutcome::Failed {
                attempts: 2,
                error: WriteError::Timeout
            }
        );
    }
}
