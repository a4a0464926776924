//! Event source adapter interface.
//!
//! The transport guarantees at-least-once, in-order delivery per partition.
//! Adapters are stateless from the caller's point of view: every poll names
//! the offset to read after, which makes replay from a checkpoint trivial.

use crate::error::ChurnError;
use crate::types::{Offset, PartitionId, SourceRecord};
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Return up to `max` records with offsets strictly greater than `after`,
    /// waiting at most `wait` for the first one. An empty result is not an error.
    async fn poll(
        &self,
        partition: PartitionId,
        after: Offset,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<SourceRecord>, ChurnError>;

    /// Acknowledge everything up to and including `offset`.
    async fn commit(&self, partition: PartitionId, offset: Offset) -> Result<(), ChurnError>;

    /// Whether offsets within a partition are gap-free. Enables gap detection
    /// during recovery.
    fn contiguous_offsets(&self) -> bool {
        true
    }

    fn name(&self) -> &str;
}
