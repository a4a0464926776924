//! Dead-letter routing for events that cannot be processed.
//!
//! Workers accept an `Arc<dyn DeadLetterSink>` and route malformed records to
//! it instead of failing the partition.

use crate::types::{Offset, PartitionId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// A record quarantined by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub partition: PartitionId,
    pub offset: Offset,
    /// Raw payload, lossily decoded as UTF-8.
    pub payload: String,
    pub error: String,
    pub received_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(partition: PartitionId, offset: Offset, payload: &[u8], error: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            partition,
            offset,
            payload: String::from_utf8_lossy(payload).into_owned(),
            error,
            received_at: Utc::now(),
        }
    }
}

/// Destination for quarantined records.
pub trait DeadLetterSink: Send + Sync {
    fn route(&self, record: DeadLetterRecord);

    fn total_routed(&self) -> u64;
}

/// Bounded in-memory dead-letter queue. Evicts the oldest record when full.
pub struct DeadLetterQueue {
    records: Mutex<VecDeque<DeadLetterRecord>>,
    max_size: usize,
    total_routed: AtomicU64,
}

impl DeadLetterQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            max_size: max_size.max(1),
            total_routed: AtomicU64::new(0),
        }
    }

    pub fn depth(&self) -> usize {
        self.records.lock().len()
    }

    /// Peek at the oldest records without removing them.
    pub fn peek(&self, limit: usize) -> Vec<DeadLetterRecord> {
        self.records.lock().iter().take(limit).cloned().collect()
    }
}

impl DeadLetterSink for DeadLetterQueue {
    fn route(&self, record: DeadLetterRecord) {
        tracing::warn!(
            partition = record.partition,
            offset = record.offset,
            error = %record.error,
            "Event routed to dead-letter queue"
        );
        metrics::counter!("events.malformed").increment(1);
        let mut queue = self.records.lock();
        if queue.len() >= self.max_size {
            queue.pop_front();
        }
        queue.push_back(record);
        self.total_routed.fetch_add(1, Ordering::Relaxed);
    }

    fn total_routed(&self) -> u64 {
        self.total_routed.load(Ordering::Relaxed)
    }
}
