use crate::error::ChurnError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type PartitionId = u32;

/// Position of a record within a partition. Monotonic, starts at 1.
pub type Offset = u64;

/// Behavioral event for one customer, as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub entity_id: String,
    pub event_time: DateTime<Utc>,
    pub event_type: String,
    /// Every wire field other than the three above, kept opaque.
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    /// Parse a wire record. Required fields are validated here; unknown
    /// fields land in `payload` untouched.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ChurnError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| ChurnError::MalformedEvent(format!("invalid JSON: {e}")))?;
        let serde_json::Value::Object(mut fields) = value else {
            return Err(ChurnError::MalformedEvent(
                "event must be a JSON object".to_string(),
            ));
        };

        let entity_id = take_string(&mut fields, "entity_id")?;
        let event_type = take_string(&mut fields, "event_type")?;
        let event_time = match fields.remove("event_time") {
            Some(serde_json::Value::String(s)) => DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| {
                    ChurnError::MalformedEvent(format!("event_time '{s}' is not RFC 3339: {e}"))
                })?,
            Some(serde_json::Value::Number(n)) => n
                .as_i64()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .ok_or_else(|| {
                    ChurnError::MalformedEvent(format!("event_time {n} is not epoch millis"))
                })?,
            Some(other) => {
                return Err(ChurnError::MalformedEvent(format!(
                    "event_time has unsupported type: {other}"
                )))
            }
            None => {
                return Err(ChurnError::MalformedEvent(
                    "missing required field 'event_time'".to_string(),
                ))
            }
        };

        Ok(Self {
            entity_id,
            event_time,
            event_type,
            payload: fields,
        })
    }

    /// Numeric payload field. Accepts JSON numbers and numeric strings.
    pub fn numeric(&self, field: &str) -> Option<f64> {
        let value = match self.payload.get(field)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
            serde_json::Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        };
        value.filter(|v| v.is_finite())
    }

    /// Categorical payload field rendered as text.
    pub fn text(&self, field: &str) -> Option<String> {
        match self.payload.get(field)? {
            serde_json::Value::String(s) => Some(s.trim().to_string()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Serialize back to the wire layout (flat object).
    pub fn to_wire(&self) -> Result<Vec<u8>, ChurnError> {
        let mut fields = self.payload.clone();
        fields.insert("entity_id".into(), self.entity_id.clone().into());
        fields.insert("event_time".into(), self.event_time.to_rfc3339().into());
        fields.insert("event_type".into(), self.event_type.clone().into());
        Ok(serde_json::to_vec(&serde_json::Value::Object(fields))?)
    }
}

fn take_string(
    fields: &mut serde_json::Map<String, serde_json::Value>,
    name: &str,
) -> Result<String, ChurnError> {
    match fields.remove(name) {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
        Some(_) => Err(ChurnError::MalformedEvent(format!(
            "field '{name}' must be a non-empty string"
        ))),
        None => Err(ChurnError::MalformedEvent(format!(
            "missing required field '{name}'"
        ))),
    }
}

/// Raw record delivered by the event source, before parsing.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub offset: Offset,
    pub payload: Vec<u8>,
}

/// Tumbling window index: `floor(epoch_seconds / window_size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowId(pub i64);

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "W{}", self.0)
    }
}

/// Point-in-time feature snapshot for one entity-window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub entity_id: String,
    pub window_id: WindowId,
    pub as_of_time: DateTime<Utc>,
    pub features: BTreeMap<String, f64>,
}

impl FeatureVector {
    pub fn key(&self) -> PredictionKey {
        PredictionKey {
            entity_id: self.entity_id.clone(),
            window_id: self.window_id,
        }
    }
}

/// Natural key of a prediction row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PredictionKey {
    pub entity_id: String,
    pub window_id: WindowId,
}

/// Output of the model scorer for one feature vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub probability: f64,
    pub flag: bool,
    pub model_version: String,
}

/// A feature's signed contribution to the churn probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub feature: String,
    pub contribution: f64,
}

/// Scored, explained entity-window, as written to the prediction sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub entity_id: String,
    pub window_id: WindowId,
    pub scored_at: DateTime<Utc>,
    pub churn_probability: f64,
    pub churn_flag: u8,
    pub risk_factors: Vec<RiskFactor>,
    pub model_version: String,
}

impl Prediction {
    pub fn new(
        vector: &FeatureVector,
        score: &Score,
        risk_factors: Vec<RiskFactor>,
        scored_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id: vector.entity_id.clone(),
            window_id: vector.window_id,
            scored_at,
            churn_probability: score.probability,
            churn_flag: u8::from(score.flag),
            risk_factors,
            model_version: score.model_version.clone(),
        }
    }

    pub fn key(&self) -> PredictionKey {
        PredictionKey {
            entity_id: self.entity_id.clone(),
            window_id: self.window_id,
        }
    }
}

/// Durable marker of how far a partition has safely progressed.
///
/// `state` is the opaque partition snapshot taken at `committed_offset`;
/// recovery restores it and resumes from `committed_offset + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub partition_id: PartitionId,
    pub committed_offset: Offset,
    pub committed_at: DateTime<Utc>,
    #[serde(default)]
    pub state: Option<serde_json::Value>,
}

impl Checkpoint {
    pub fn initial(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            committed_offset: 0,
            committed_at: Utc::now(),
            state: None,
        }
    }
}
