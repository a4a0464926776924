//! Feature catalog: declares how event payloads become model features.
//!
//! The catalog is configuration, not code: each entry names a feature, the
//! aggregation that produces it, and whether its value survives a window roll.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub name: String,
    pub kind: FeatureKind,
    /// Carried into the next window instead of resetting.
    #[serde(default)]
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeatureKind {
    /// Most recent numeric value of a payload field.
    Latest { field: String },
    /// Sum of a numeric payload field.
    Sum { field: String },
    /// Number of events of the given type.
    Count { event_type: String },
    /// 1.0 when the most recent value of `field` equals `equals`, else 0.0.
    Indicator { field: String, equals: String },
    /// Days between the latest event of the given type and the snapshot time.
    DaysSince { event_type: String },
}

impl FeatureSpec {
    pub fn new(name: &str, kind: FeatureKind, retain: bool) -> Self {
        Self {
            name: name.to_string(),
            kind,
            retain,
        }
    }
}

/// Default telco churn catalog.
pub fn default_churn_features() -> Vec<FeatureSpec> {
    vec![
        FeatureSpec::new(
            "tenure",
            FeatureKind::Latest {
                field: "tenure".into(),
            },
            true,
        ),
        FeatureSpec::new(
            "monthly_charge",
            FeatureKind::Latest {
                field: "monthly_charge".into(),
            },
            true,
        ),
        FeatureSpec::new(
            "is_mtm",
            FeatureKind::Indicator {
                field: "contract_type".into(),
                equals: "Month-to-month".into(),
            },
            true,
        ),
        FeatureSpec::new(
            "tickets_30d",
            FeatureKind::Count {
                event_type: "support_ticket".into(),
            },
            false,
        ),
        FeatureSpec::new(
            "last_login_days",
            FeatureKind::DaysSince {
                event_type: "login".into(),
            },
            true,
        ),
    ]
}
