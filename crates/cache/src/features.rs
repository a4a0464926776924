//! Two-tier cache in front of the warehouse feature table:
//! LocalCache (L1) -> Redis (L2) -> warehouse.

use crate::local::LocalCache;
use async_trait::async_trait;
use churn_core::config::RedisConfig;
use churn_core::error::ChurnError;
use churn_core::sink::FeatureStore;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

type FeatureMap = BTreeMap<String, f64>;

pub struct CachedFeatureStore {
    inner: Arc<dyn FeatureStore>,
    local: LocalCache<FeatureMap>,
    redis: Option<ConnectionManager>,
    key_prefix: String,
    ttl_secs: u64,
}

impl CachedFeatureStore {
    /// L1 TTL is half of the Redis TTL. `redis` is optional so the cache
    /// still works when only the local tier is available.
    pub fn new(
        inner: Arc<dyn FeatureStore>,
        redis: Option<ConnectionManager>,
        config: &RedisConfig,
    ) -> Self {
        Self {
            inner,
            local: LocalCache::new(
                Duration::from_secs(config.feature_ttl_secs / 2),
                config.local_cache_entries,
            ),
            redis,
            key_prefix: config.key_prefix.clone(),
            ttl_secs: config.feature_ttl_secs.max(1),
        }
    }

    pub async fn connect(inner: Arc<dyn FeatureStore>, config: &RedisConfig) -> anyhow::Result<Self> {
        let url = config
            .urls
            .first()
            .cloned()
            .unwrap_or_else(|| "redis://localhost:6379".to_string());
        let client = redis::Client::open(url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(inner, Some(conn), config))
    }

    fn key(&self, entity_id: &str) -> String {
        format!("{}:features:{entity_id}", self.key_prefix)
    }

    /// Run periodic maintenance (L1 eviction).
    pub fn maintenance(&self) {
        let evicted = self.local.evict_expired();
        if evicted > 0 {
            debug!(evicted, "Local feature cache eviction complete");
        }
    }

    pub fn local_cache_size(&self) -> usize {
        self.local.len()
    }

    async fn redis_get(&self, conn: &mut ConnectionManager, key: &str) -> Option<FeatureMap> {
        let data: Option<String> = match conn.get(key).await {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Redis feature lookup failed, falling through to warehouse");
                return None;
            }
        };
        data.and_then(|json| serde_json::from_str(&json).ok())
    }
}

#[async_trait]
impl FeatureStore for CachedFeatureStore {
    async fn get_features(&self, entity_id: &str) -> Result<Option<FeatureMap>, ChurnError> {
        if let Some(features) = self.local.get(entity_id) {
            metrics::counter!("cache.l1.hit").increment(1);
            return Ok(Some(features));
        }
        metrics::counter!("cache.l1.miss").increment(1);

        let key = self.key(entity_id);
        let mut conn = self.redis.clone();
        if let Some(conn) = conn.as_mut() {
            if let Some(features) = self.redis_get(conn, &key).await {
                metrics::counter!("cache.l2.hit").increment(1);
                self.local.put(entity_id.to_string(), features.clone());
                return Ok(Some(features));
            }
            metrics::counter!("cache.l2.miss").increment(1);
        }

        let Some(features) = self.inner.get_features(entity_id).await? else {
            return Ok(None);
        };
        if let Some(conn) = conn.as_mut() {
            let json = serde_json::to_string(&features)?;
            if let Err(e) = conn.set_ex::<_, _, ()>(&key, json, self.ttl_secs).await {
                warn!(error = %e, "Failed to populate Redis feature cache");
            }
        }
        self.local.put(entity_id.to_string(), features.clone());
        Ok(Some(features))
    }
}
