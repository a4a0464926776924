//! Stable entity-to-partition routing shared by producers and workers.

use crate::types::PartitionId;
use sha2::{Digest, Sha256};

/// Partition owning `entity_id`. Stable across processes, builds and
/// platforms, unlike `std`'s randomized hasher.
pub fn partition_for(entity_id: &str, partition_count: u32) -> PartitionId {
    let digest = Sha256::digest(entity_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(partition_count.max(1))) as PartitionId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_is_stable_and_in_range() {
        for id in ["C1", "C2", "7590-VHVEG", "5575-GNVDE"] {
            let p = partition_for(id, 8);
            assert!(p < 8);
            assert_eq!(p, partition_for(id, 8));
        }
    }

    #[test]
    fn test_single_partition() {
        assert_eq!(partition_for("anything", 1), 0);
        assert_eq!(partition_for("anything", 0), 0);
    }

    #[test]
    fn test_entities_spread_across_partitions() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..200 {
            seen.insert(partition_for(&format!("customer-{i}"), 4));
        }
        assert_eq!(seen.len(), 4);
    }
}
