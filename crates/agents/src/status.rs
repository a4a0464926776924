//! Shared, read-mostly view of every partition worker on this node.

use chrono::{DateTime, Utc};
use churn_core::types::{Offset, PartitionId};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;

/// Per-partition orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionState {
    Idle,
    Consuming,
    Aggregating,
    Scoring,
    Explaining,
    Writing,
    Checkpointing,
    Failed,
    Recovering,
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionState::Idle => "IDLE",
            PartitionState::Consuming => "CONSUMING",
            PartitionState::Aggregating => "AGGREGATING",
            PartitionState::Scoring => "SCORING",
            PartitionState::Explaining => "EXPLAINING",
            PartitionState::Writing => "WRITING",
            PartitionState::Checkpointing => "CHECKPOINTING",
            PartitionState::Failed => "FAILED",
            PartitionState::Recovering => "RECOVERING",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionStatus {
    pub partition: PartitionId,
    pub state: PartitionState,
    pub committed_offset: Offset,
    pub last_committed_at: Option<DateTime<Utc>>,
    /// Latest event time covered by the committed checkpoint.
    pub last_event_time: Option<DateTime<Utc>>,
    /// Seconds between now and `last_event_time` at the last commit.
    pub lag_seconds: Option<f64>,
    pub late_drops: u64,
    pub duplicates: u64,
    pub dead_letters: u64,
    pub degraded_windows: usize,
    /// Entities held in partition state, dormant ones included.
    pub entities: usize,
    pub recovery_attempts: u32,
    pub last_error: Option<String>,
}

impl PartitionStatus {
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            state: PartitionState::Recovering,
            committed_offset: 0,
            last_committed_at: None,
            last_event_time: None,
            lag_seconds: None,
            late_drops: 0,
            duplicates: 0,
            dead_letters: 0,
            degraded_windows: 0,
            entities: 0,
            recovery_attempts: 0,
            last_error: None,
        }
    }
}

#[derive(Default)]
pub struct StatusRegistry {
    partitions: DashMap<PartitionId, PartitionStatus>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, partition: PartitionId) {
        self.partitions
            .entry(partition)
            .or_insert_with(|| PartitionStatus::new(partition));
    }

    pub fn update(&self, partition: PartitionId, f: impl FnOnce(&mut PartitionStatus)) {
        let mut entry = self
            .partitions
            .entry(partition)
            .or_insert_with(|| PartitionStatus::new(partition));
        f(entry.value_mut());
    }

    pub fn get(&self, partition: PartitionId) -> Option<PartitionStatus> {
        self.partitions.get(&partition).map(|s| s.value().clone())
    }

    /// All partitions, ordered by id.
    pub fn all(&self) -> Vec<PartitionStatus> {
        let mut all: Vec<PartitionStatus> =
            self.partitions.iter().map(|s| s.value().clone()).collect();
        all.sort_by_key(|s| s.partition);
        all
    }

    pub fn any_failed(&self) -> bool {
        self.partitions
            .iter()
            .any(|s| s.state == PartitionState::Failed)
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_tracks_failures() {
        let registry = StatusRegistry::new();
        registry.register(1);
        registry.register(0);
        assert!(!registry.any_failed());

        registry.update(1, |s| {
            s.state = PartitionState::Failed;
            s.last_error = Some("sink down".into());
        });
        assert!(registry.any_failed());
        let all = registry.all();
        assert_eq!(all[0].partition, 0);
        assert_eq!(all[1].last_error.as_deref(), Some("sink down"));
    }

    #[test]
    fn test_state_serializes_upper_case() {
        let json = serde_json::to_string(&PartitionState::Checkpointing).unwrap();
        assert_eq!(json, "\"CHECKPOINTING\"");
        assert_eq!(PartitionState::Idle.to_string(), "IDLE");
    }
}
