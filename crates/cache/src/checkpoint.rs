//! Durable per-partition checkpoints.
//!
//! Each partition's checkpoint is a single JSON document, so the committed
//! offset and the state snapshot taken at that offset are always replaced
//! together.

use async_trait::async_trait;
use churn_core::config::RedisConfig;
use churn_core::error::ChurnError;
use churn_core::sink::CheckpointStore;
use churn_core::types::{Checkpoint, PartitionId};
use dashmap::DashMap;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

pub struct RedisCheckpointStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisCheckpointStore {
    pub async fn new(config: &RedisConfig) -> anyhow::Result<Self> {
        let url = config
            .urls
            .first()
            .cloned()
            .unwrap_or_else(|| "redis://localhost:6379".to_string());

        info!(url = %url, "Connecting to Redis checkpoint store");
        let client = redis::Client::open(url.as_str())?;
        let mut conn = ConnectionManager::new(client).await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(response = %pong, "Redis connection established");

        Ok(Self {
            conn,
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn key(&self, partition: PartitionId) -> String {
        checkpoint_key(&self.key_prefix, partition)
    }
}

pub fn checkpoint_key(prefix: &str, partition: PartitionId) -> String {
    format!("{prefix}:checkpoint:{partition}")
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn get_committed(&self, partition: PartitionId) -> Result<Option<Checkpoint>, ChurnError> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn
            .get(self.key(partition))
            .await
            .map_err(|e| ChurnError::Checkpoint(format!("read partition {partition}: {e}")))?;
        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set_committed(&self, checkpoint: &Checkpoint) -> Result<(), ChurnError> {
        let json = serde_json::to_string(checkpoint)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(self.key(checkpoint.partition_id), json)
            .await
            .map_err(|e| {
                ChurnError::Checkpoint(format!("write partition {}: {e}", checkpoint.partition_id))
            })?;
        debug!(
            partition = checkpoint.partition_id,
            offset = checkpoint.committed_offset,
            "Checkpoint persisted"
        );
        Ok(())
    }
}

/// Process-local checkpoint store for tests and single-node dev runs.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: DashMap<PartitionId, Checkpoint>,
    failures: Mutex<u32>,
    writes: AtomicU64,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` writes.
    pub fn fail_next_writes(&self, count: u32) {
        *self.failures.lock() += count;
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn committed_offset(&self, partition: PartitionId) -> Option<u64> {
        self.checkpoints
            .get(&partition)
            .map(|c| c.committed_offset)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get_committed(&self, partition: PartitionId) -> Result<Option<Checkpoint>, ChurnError> {
        Ok(self.checkpoints.get(&partition).map(|c| c.value().clone()))
    }

    async fn set_committed(&self, checkpoint: &Checkpoint) -> Result<(), ChurnError> {
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(ChurnError::Checkpoint("injected failure".to_string()));
            }
        }
        // Round-trip through JSON like the durable store does.
        let stored: Checkpoint = serde_json::from_str(&serde_json::to_string(checkpoint)?)?;
        self.checkpoints.insert(checkpoint.partition_id, stored);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_key_layout() {
        assert_eq!(checkpoint_key("churn", 3), "churn:checkpoint:3");
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = InMemoryCheckpointStore::new();
        assert!(store.get_committed(2).await.unwrap().is_none());

        let mut checkpoint = Checkpoint::initial(2);
        checkpoint.committed_offset = 41;
        checkpoint.state = Some(serde_json::json!({"entities": []}));
        store.set_committed(&checkpoint).await.unwrap();

        let loaded = store.get_committed(2).await.unwrap().unwrap();
        assert_eq!(loaded.committed_offset, 41);
        assert_eq!(loaded.state, checkpoint.state);
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_failure_injection() {
        let store = InMemoryCheckpointStore::new();
        store.fail_next_writes(1);
        let checkpoint = Checkpoint::initial(0);
        assert!(store.set_committed(&checkpoint).await.is_err());
        assert!(store.set_committed(&checkpoint).await.is_ok());
        assert_eq!(store.committed_offset(0), Some(0));
    }
}
