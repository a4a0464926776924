//! ClickHouse prediction table.
//!
//! Upserts are typed `RowBinary` inserts into a `ReplacingMergeTree(scored_at)`
//! ordered by the natural key: the engine keeps the row with the greatest
//! `scored_at` per `(entity_id, window_id)`, and reads use `FINAL` so a key
//! never yields two rows even before background merges run.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use churn_core::config::ClickHouseConfig;
use churn_core::sink::{PredictionSink, WriteError};
use churn_core::types::{Prediction, RiskFactor, WindowId};
use clickhouse::Row;
use serde::{Deserialize, Serialize};
use tracing::info;

pub struct ClickHousePredictionSink {
    client: clickhouse::Client,
    table: String,
}

/// Insert layout. `scored_at` travels as `DateTime64(3)` ticks.
#[derive(Debug, Row, Serialize)]
struct PredictionInsert<'a> {
    entity_id: &'a str,
    window_id: i64,
    scored_at: i64,
    churn_probability: f64,
    churn_flag: u8,
    risk_factors: Vec<(&'a str, f64)>,
    model_version: &'a str,
}

impl<'a> From<&'a Prediction> for PredictionInsert<'a> {
    fn from(prediction: &'a Prediction) -> Self {
        Self {
            entity_id: &prediction.entity_id,
            window_id: prediction.window_id.0,
            scored_at: prediction.scored_at.timestamp_millis(),
            churn_probability: prediction.churn_probability,
            churn_flag: prediction.churn_flag,
            risk_factors: prediction
                .risk_factors
                .iter()
                .map(|f| (f.feature.as_str(), f.contribution))
                .collect(),
            model_version: &prediction.model_version,
        }
    }
}

#[derive(Debug, Row, Deserialize)]
struct PredictionRow {
    entity_id: String,
    window_id: i64,
    scored_at_ms: i64,
    churn_probability: f64,
    churn_flag: u8,
    risk_factors: Vec<(String, f64)>,
    model_version: String,
}

impl ClickHousePredictionSink {
    pub async fn new(config: &ClickHouseConfig) -> anyhow::Result<Self> {
        let client = clickhouse::Client::default()
            .with_url(&config.url)
            .with_database(&config.database);
        let sink = Self {
            client,
            table: config.predictions_table.clone(),
        };
        sink.ensure_schema().await?;
        Ok(sink)
    }

    async fn ensure_schema(&self) -> anyhow::Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                entity_id String,
                window_id Int64,
                scored_at DateTime64(3, 'UTC'),
                churn_probability Float64,
                churn_flag UInt8,
                risk_factors Array(Tuple(feature String, contribution Float64)),
                model_version LowCardinality(String)
            ) ENGINE = ReplacingMergeTree(scored_at)
            ORDER BY (entity_id, window_id)",
            self.table
        );
        self.client.query(&ddl).execute().await?;
        info!(table = %self.table, "ClickHouse prediction schema verified");
        Ok(())
    }
}

#[async_trait]
impl PredictionSink for ClickHousePredictionSink {
    async fn upsert(&self, prediction: &Prediction) -> Result<(), WriteError> {
        let transient = |e: clickhouse::error::Error| WriteError::Transient(e.to_string());
        let mut insert = self
            .client
            .insert::<PredictionInsert<'_>>(&self.table)
            .map_err(transient)?;
        insert
            .write(&PredictionInsert::from(prediction))
            .await
            .map_err(transient)?;
        insert.end().await.map_err(transient)?;
        metrics::counter!("clickhouse.rows_written").increment(1);
        Ok(())
    }

    async fn get(
        &self,
        entity_id: &str,
        window_id: WindowId,
    ) -> Result<Option<Prediction>, WriteError> {
        let sql = format!(
            "SELECT entity_id, window_id, toUnixTimestamp64Milli(scored_at) AS scored_at_ms,
                    churn_probability, churn_flag, risk_factors, model_version
             FROM {} FINAL
             WHERE entity_id = ? AND window_id = ?",
            self.table
        );
        let rows = self
            .client
            .query(&sql)
            .bind(entity_id)
            .bind(window_id.0)
            .fetch_all::<PredictionRow>()
            .await
            .map_err(|e| WriteError::Transient(e.to_string()))?;

        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        let scored_at = Utc
            .timestamp_millis_opt(row.scored_at_ms)
            .single()
            .ok_or_else(|| WriteError::Rejected(format!("invalid scored_at {}", row.scored_at_ms)))?;
        Ok(Some(Prediction {
            entity_id: row.entity_id,
            window_id: WindowId(row.window_id),
            scored_at,
            churn_probability: row.churn_probability,
            churn_flag: row.churn_flag,
            risk_factors: row
                .risk_factors
                .into_iter()
                .map(|(feature, contribution)| RiskFactor {
                    feature,
                    contribution,
                })
                .collect(),
            model_version: row.model_version,
        }))
    }

    fn name(&self) -> &str {
        "clickhouse"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn prediction(entity_id: &str) -> Prediction {
        Prediction {
            entity_id: entity_id.into(),
            window_id: WindowId(19783),
            scored_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 5).unwrap(),
            churn_probability: 0.82,
            churn_flag: 1,
            risk_factors: vec![RiskFactor {
                feature: "is_mtm?".into(),
                contribution: 0.21,
            }],
            model_version: "v1?".into(),
        }
    }

    #[test]
    fn test_insert_row_layout() {
        let prediction = prediction("C1");
        let row = PredictionInsert::from(&prediction);
        assert_eq!(row.scored_at, 1_709_294_405_000);
        assert_eq!(row.window_id, 19783);
        assert_eq!(row.risk_factors, vec![("is_mtm?", 0.21)]);
        assert_eq!(row.model_version, "v1?");
    }

    #[tokio::test]
    async fn test_placeholder_characters_fail_as_transient() {
        let sink = ClickHousePredictionSink {
            client: clickhouse::Client::default().with_url("http://127.0.0.1:1"),
            table: "churn_predictions".into(),
        };
        let err = sink.upsert(&prediction("C?1")).await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err}");
    }
}
