//! In-memory prediction table for tests and local runs.

use async_trait::async_trait;
use churn_core::sink::{PredictionSink, WriteError};
use churn_core::types::{Prediction, PredictionKey, WindowId};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Keyed by `(entity_id, window_id)` with the same replace rule as the
/// warehouse table: a stored row is only kept over a new one when its
/// `scored_at` is strictly later.
#[derive(Default)]
pub struct InMemoryPredictionSink {
    rows: DashMap<PredictionKey, Prediction>,
    failures: Mutex<Vec<WriteError>>,
    delay: Mutex<Option<Duration>>,
    attempts: AtomicU64,
}

impl InMemoryPredictionSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` upserts with `error`.
    pub fn fail_next(&self, count: usize, error: WriteError) {
        let mut failures = self.failures.lock();
        failures.extend(std::iter::repeat(error).take(count));
    }

    /// Delay every upsert, to exercise write deadlines.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Upsert calls received, including failed ones.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// All rows, ordered by key.
    pub fn rows(&self) -> Vec<Prediction> {
        let mut rows: Vec<Prediction> = self.rows.iter().map(|r| r.value().clone()).collect();
        rows.sort_by_key(|p| p.key());
        rows
    }
}

#[async_trait]
impl PredictionSink for InMemoryPredictionSink {
    async fn upsert(&self, prediction: &Prediction) -> Result<(), WriteError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let injected = self.failures.lock().pop();
        if let Some(error) = injected {
            return Err(error);
        }

        self.rows
            .entry(prediction.key())
            .and_modify(|stored| {
                if stored.scored_at <= prediction.scored_at {
                    *stored = prediction.clone();
                }
            })
            .or_insert_with(|| prediction.clone());
        Ok(())
    }

    async fn get(
        &self,
        entity_id: &str,
        window_id: WindowId,
    ) -> Result<Option<Prediction>, WriteError> {
        let key = PredictionKey {
            entity_id: entity_id.to_string(),
            window_id,
        };
        Ok(self.rows.get(&key).map(|r| r.value().clone()))
    }

    fn name(&self) -> &str {
        "memory"
    }
}
