//! Write/read contracts of the external stores the core talks to.

use crate::error::ChurnError;
use crate::types::{Checkpoint, PartitionId, Prediction, WindowId};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;

/// Failure reported by a prediction sink for a single write attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteError {
    /// Sink temporarily unavailable; the write may be retried.
    Transient(String),
    /// Sink refused the row; retrying will not help.
    Rejected(String),
    /// The attempt exceeded its deadline.
    Timeout,
}

impl WriteError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, WriteError::Rejected(_))
    }
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::Transient(msg) => write!(f, "transient sink failure: {msg}"),
            WriteError::Rejected(msg) => write!(f, "sink rejected write: {msg}"),
            WriteError::Timeout => write!(f, "sink write timed out"),
        }
    }
}

impl std::error::Error for WriteError {}

/// Prediction table keyed by `(entity_id, window_id)`.
///
/// `upsert` replaces any existing row with the same key in full, unless the
/// stored row has a strictly later `scored_at`.
#[async_trait]
pub trait PredictionSink: Send + Sync {
    async fn upsert(&self, prediction: &Prediction) -> Result<(), WriteError>;

    async fn get(
        &self,
        entity_id: &str,
        window_id: WindowId,
    ) -> Result<Option<Prediction>, WriteError>;

    fn name(&self) -> &str;
}

/// Durable per-partition checkpoint storage. Read before any replay begins.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get_committed(&self, partition: PartitionId) -> Result<Option<Checkpoint>, ChurnError>;

    async fn set_committed(&self, checkpoint: &Checkpoint) -> Result<(), ChurnError>;
}

/// Read-only access to the warehouse's materialized feature table.
#[async_trait]
pub trait FeatureStore: Send + Sync {
    async fn get_features(&self, entity_id: &str)
        -> Result<Option<BTreeMap<String, f64>>, ChurnError>;
}
