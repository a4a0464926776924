//! Event source adapters.
//!
//! `NatsEventSource` reads one JetStream stream per partition, so a record's
//! stream sequence is its partition offset. `MemoryEventSource` serves tests
//! and local replays.

use async_nats::jetstream::{self, consumer::PullConsumer};
use async_trait::async_trait;
use churn_core::config::NatsConfig;
use churn_core::error::ChurnError;
use churn_core::source::EventSource;
use churn_core::types::{Event, Offset, PartitionId, SourceRecord};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::{debug, info};

pub fn stream_name(prefix: &str, partition: PartitionId) -> String {
    format!("{prefix}_{partition}")
}

pub fn subject(prefix: &str, partition: PartitionId) -> String {
    format!("{prefix}.{partition}")
}

/// Connect to NATS and return a JetStream context.
pub async fn connect(config: &NatsConfig) -> anyhow::Result<jetstream::Context> {
    let url = config
        .urls
        .first()
        .cloned()
        .unwrap_or_else(|| "nats://localhost:4222".to_string());

    info!(url = %url, "Connecting to NATS");
    let client = async_nats::ConnectOptions::new()
        .max_reconnects(Some(config.max_reconnects))
        .connection_timeout(Duration::from_millis(config.connect_timeout_ms))
        .connect(&url)
        .await?;
    info!("NATS connection established");

    Ok(jetstream::new(client))
}

/// Create the per-partition streams that do not exist yet.
pub async fn ensure_streams(
    jetstream: &jetstream::Context,
    config: &NatsConfig,
    partition_count: u32,
) -> anyhow::Result<()> {
    for partition in 0..partition_count {
        let name = stream_name(&config.stream_prefix, partition);
        if jetstream.get_stream(&name).await.is_ok() {
            continue;
        }
        jetstream
            .create_stream(jetstream::stream::Config {
                name: name.clone(),
                subjects: vec![subject(&config.subject_prefix, partition)],
                description: Some(format!("Churn events, partition {partition}")),
                ..Default::default()
            })
            .await?;
        info!(stream = %name, "Created stream");
    }
    Ok(())
}

/// One independently locked slot per partition. A slot lock is held across
/// the fetch, so it must never be shared between partitions.
pub(crate) struct PartitionSlots<T> {
    slots: DashMap<PartitionId, Arc<tokio::sync::Mutex<Option<T>>>>,
}

impl<T> PartitionSlots<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    pub(crate) fn slot(&self, partition: PartitionId) -> Arc<tokio::sync::Mutex<Option<T>>> {
        self.slots
            .entry(partition)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .clone()
    }
}

struct Cursor {
    consumer: PullConsumer,
    /// Offset the consumer will deliver next.
    next: Offset,
}

pub struct NatsEventSource {
    jetstream: jetstream::Context,
    stream_prefix: String,
    cursors: PartitionSlots<Cursor>,
}

impl NatsEventSource {
    pub fn new(jetstream: jetstream::Context, config: &NatsConfig) -> Self {
        Self {
            jetstream,
            stream_prefix: config.stream_prefix.clone(),
            cursors: PartitionSlots::new(),
        }
    }

    async fn open_cursor(&self, partition: PartitionId, start: Offset) -> Result<Cursor, ChurnError> {
        let name = stream_name(&self.stream_prefix, partition);
        let stream = self
            .jetstream
            .get_stream(&name)
            .await
            .map_err(|e| ChurnError::Transport(format!("stream {name}: {e}")))?;
        let consumer = stream
            .create_consumer(jetstream::consumer::pull::Config {
                deliver_policy: jetstream::consumer::DeliverPolicy::ByStartSequence {
                    start_sequence: start,
                },
                ack_policy: jetstream::consumer::AckPolicy::None,
                inactive_threshold: Duration::from_secs(300),
                ..Default::default()
            })
            .await
            .map_err(|e| ChurnError::Transport(format!("consumer on {name}: {e}")))?;
        debug!(partition, start, "Opened partition cursor");
        Ok(Cursor {
            consumer,
            next: start,
        })
    }
}

#[async_trait]
impl EventSource for NatsEventSource {
    async fn poll(
        &self,
        partition: PartitionId,
        after: Offset,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<SourceRecord>, ChurnError> {
        let slot = self.cursors.slot(partition);
        let mut guard = slot.lock().await;
        let start = after + 1;
        let mut cursor = match guard.take() {
            Some(cursor) if cursor.next == start => cursor,
            _ => self.open_cursor(partition, start).await?,
        };

        // The cursor goes back into its slot only after a clean drain, so any
        // failure reopens it from the caller's position on the next poll.
        let fetched = cursor
            .consumer
            .fetch()
            .max_messages(max.max(1))
            .expires(wait.max(Duration::from_millis(10)))
            .messages()
            .await;
        let mut batch = fetched
            .map_err(|e| ChurnError::Transport(format!("fetch partition {partition}: {e}")))?;

        let mut records = Vec::new();
        while let Some(message) = batch.next().await {
            let message = message
                .map_err(|e| ChurnError::Transport(format!("receive partition {partition}: {e}")))?;
            let info = message
                .info()
                .map_err(|e| ChurnError::Transport(format!("message metadata: {e}")))?;
            let offset = info.stream_sequence;
            records.push(SourceRecord {
                offset,
                payload: message.payload.to_vec(),
            });
            cursor.next = offset + 1;
        }
        *guard = Some(cursor);
        Ok(records)
    }

    async fn commit(&self, partition: PartitionId, offset: Offset) -> Result<(), ChurnError> {
        // Consumers are unacknowledged; progress lives in the checkpoint store.
        debug!(partition, offset, "Partition progress committed");
        Ok(())
    }

    fn name(&self) -> &str {
        "nats-jetstream"
    }
}

#[derive(Default)]
struct MemoryPartition {
    records: Vec<SourceRecord>,
    committed: Option<Offset>,
}

/// In-memory partitioned log. Offsets start at 1 and grow by one unless
/// records are pushed with explicit offsets.
#[derive(Default)]
pub struct MemoryEventSource {
    partitions: Mutex<HashMap<PartitionId, MemoryPartition>>,
    poll_failures: Mutex<u32>,
}

impl MemoryEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, partition: PartitionId, payload: Vec<u8>) -> Offset {
        let mut partitions = self.partitions.lock();
        let log = partitions.entry(partition).or_default();
        let offset = log.records.last().map_or(1, |r| r.offset + 1);
        log.records.push(SourceRecord { offset, payload });
        offset
    }

    pub fn push_event(&self, partition: PartitionId, event: &Event) -> Result<Offset, ChurnError> {
        Ok(self.push(partition, event.to_wire()?))
    }

    /// Append with an explicit offset, which must be above the last one.
    pub fn push_at(&self, partition: PartitionId, offset: Offset, payload: Vec<u8>) {
        let mut partitions = self.partitions.lock();
        partitions
            .entry(partition)
            .or_default()
            .records
            .push(SourceRecord { offset, payload });
    }

    /// Fail the next `count` polls with a transport error.
    pub fn fail_next_polls(&self, count: u32) {
        *self.poll_failures.lock() += count;
    }

    pub fn committed(&self, partition: PartitionId) -> Option<Offset> {
        self.partitions
            .lock()
            .get(&partition)
            .and_then(|p| p.committed)
    }

    pub fn last_offset(&self, partition: PartitionId) -> Option<Offset> {
        self.partitions
            .lock()
            .get(&partition)
            .and_then(|p| p.records.last().map(|r| r.offset))
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn poll(
        &self,
        partition: PartitionId,
        after: Offset,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<SourceRecord>, ChurnError> {
        {
            let mut failures = self.poll_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(ChurnError::Transport("injected poll failure".to_string()));
            }
        }
        let records: Vec<SourceRecord> = {
            let partitions = self.partitions.lock();
            partitions
                .get(&partition)
                .map(|log| {
                    log.records
                        .iter()
                        .filter(|r| r.offset > after)
                        .take(max)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        if records.is_empty() {
            tokio::time::sleep(wait.min(Duration::from_millis(5))).await;
        }
        Ok(records)
    }

    async fn commit(&self, partition: PartitionId, offset: Offset) -> Result<(), ChurnError> {
        let mut partitions = self.partitions.lock();
        let log = partitions.entry(partition).or_default();
        log.committed = Some(log.committed.map_or(offset, |c| c.max(offset)));
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_naming() {
        assert_eq!(stream_name("CHURN_EVENTS", 2), "CHURN_EVENTS_2");
        assert_eq!(subject("churn.events", 2), "churn.events.2");
    }

    #[tokio::test]
    async fn test_partition_slots_lock_independently() {
        let slots: PartitionSlots<u64> = PartitionSlots::new();
        let p0 = slots.slot(0);
        let held = p0.lock().await;

        // Another partition proceeds while partition 0 is mid-fetch.
        let p1 = slots.slot(1);
        let mut other = p1.try_lock().unwrap();
        *other = Some(7);
        drop(other);

        assert!(slots.slot(0).try_lock().is_err());
        drop(held);
        assert!(slots.slot(0).try_lock().is_ok());
        assert_eq!(*slots.slot(1).lock().await, Some(7));
    }

    #[tokio::test]
    async fn test_memory_poll_is_positional() {
        let source = MemoryEventSource::new();
        for i in 0..5 {
            source.push(0, format!("{{\"n\":{i}}}").into_bytes());
        }
        let first = source.poll(0, 0, 2, Duration::ZERO).await.unwrap();
        assert_eq!(first.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![1, 2]);
        let rest = source.poll(0, 2, 10, Duration::ZERO).await.unwrap();
        assert_eq!(rest.len(), 3);
        // Replaying from an earlier position returns the same records.
        let replay = source.poll(0, 0, 10, Duration::ZERO).await.unwrap();
        assert_eq!(replay.len(), 5);
        assert!(source.poll(1, 0, 10, Duration::ZERO).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_failure_injection_and_commit() {
        let source = MemoryEventSource::new();
        source.push(0, b"{}".to_vec());
        source.fail_next_polls(1);
        assert!(matches!(
            source.poll(0, 0, 10, Duration::ZERO).await,
            Err(ChurnError::Transport(_))
        ));
        assert_eq!(source.poll(0, 0, 10, Duration::ZERO).await.unwrap().len(), 1);

        source.commit(0, 1).await.unwrap();
        source.commit(0, 0).await.unwrap();
        assert_eq!(source.committed(0), Some(1));
    }
}
