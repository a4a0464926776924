//! Read-only access to the warehouse's materialized feature table, used to
//! seed entities the stream has not seen yet.

use async_trait::async_trait;
use churn_core::config::ClickHouseConfig;
use churn_core::error::ChurnError;
use churn_core::sink::FeatureStore;
use clickhouse::Row;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Table layout: `(entity_id String, feature String, value Float64, updated_at DateTime64)`.
pub struct ClickHouseFeatureStore {
    client: clickhouse::Client,
    table: String,
}

#[derive(Debug, Row, Deserialize)]
struct FeatureRow {
    feature: String,
    value: f64,
}

impl ClickHouseFeatureStore {
    pub fn new(config: &ClickHouseConfig) -> Self {
        let client = clickhouse::Client::default()
            .with_url(&config.url)
            .with_database(&config.database);
        Self {
            client,
            table: config.features_table.clone(),
        }
    }
}

#[async_trait]
impl FeatureStore for ClickHouseFeatureStore {
    async fn get_features(
        &self,
        entity_id: &str,
    ) -> Result<Option<BTreeMap<String, f64>>, ChurnError> {
        let sql = format!(
            "SELECT feature, argMax(value, updated_at) AS value
             FROM {}
             WHERE entity_id = ?
             GROUP BY feature",
            self.table
        );
        let rows = self
            .client
            .query(&sql)
            .bind(entity_id)
            .fetch_all::<FeatureRow>()
            .await
            .map_err(|e| ChurnError::Transport(format!("feature table read failed: {e}")))?;

        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            rows.into_iter()
                .filter(|r| r.value.is_finite())
                .map(|r| (r.feature, r.value))
                .collect(),
        ))
    }
}
