//! In-process TTL cache backed by DashMap for lock-free concurrent access.
//! Serves as L1 in front of Redis to cut network round trips.

use dashmap::DashMap;
use std::time::{Duration, Instant};

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

pub struct LocalCache<V> {
    store: DashMap<String, CacheEntry<V>>,
    ttl: Duration,
    max_entries: usize,
}

impl<V: Clone> LocalCache<V> {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            store: DashMap::new(),
            ttl,
            max_entries,
        }
    }

    /// Returns None if expired or missing.
    pub fn get(&self, key: &str) -> Option<V> {
        let entry = self.store.get(key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            drop(entry);
            self.store.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn put(&self, key: String, value: V) {
        // Full: skip new keys until eviction frees room.
        if self.store.len() >= self.max_entries && !self.store.contains_key(&key) {
            return;
        }
        self.store.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Remove expired entries. Call this periodically from a background task.
    pub fn evict_expired(&self) -> usize {
        let before = self.store.len();
        self.store
            .retain(|_, entry| entry.inserted_at.elapsed() <= self.ttl);
        before - self.store.len()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_entries_are_misses() {
        let cache = LocalCache::new(Duration::ZERO, 10);
        cache.put("C1".into(), 1.0);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get("C1"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_skips_new_keys() {
        let cache = LocalCache::new(Duration::from_secs(60), 1);
        cache.put("C1".into(), 1);
        cache.put("C2".into(), 2);
        cache.put("C1".into(), 3);
        assert_eq!(cache.get("C1"), Some(3));
        assert_eq!(cache.get("C2"), None);
        assert_eq!(cache.evict_expired(), 0);
    }
}
