//! Per-entity, per-window incremental state.
//!
//! Every accumulator merges commutatively: sums are kept in fixed-point
//! micro-units and "latest" values are ordered by `(event_time, offset)`, so
//! the snapshot of a window is bit-identical whatever order its events were
//! applied in.

use chrono::{DateTime, Utc};
use churn_core::features::{FeatureKind, FeatureSpec};
use churn_core::types::{Event, FeatureVector, Offset, WindowId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

const MICROS: f64 = 1_000_000.0;
const MILLIS_PER_DAY: f64 = 86_400_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Accumulator {
    Sum { micros: i64 },
    Count { n: u64 },
    Latest { value: f64, at_ms: i64, offset: Offset },
    Indicator { value: bool, at_ms: i64, offset: Offset },
    LastSeen { at_ms: i64 },
}

impl Accumulator {
    /// Value seeded from the warehouse. Sorts before any real event.
    pub fn seeded(kind: &FeatureKind, value: f64) -> Option<Self> {
        match kind {
            FeatureKind::Latest { .. } => Some(Accumulator::Latest {
                value,
                at_ms: i64::MIN,
                offset: 0,
            }),
            FeatureKind::Indicator { .. } => Some(Accumulator::Indicator {
                value: value != 0.0,
                at_ms: i64::MIN,
                offset: 0,
            }),
            _ => None,
        }
    }

    fn value_at(&self, as_of: DateTime<Utc>) -> f64 {
        match self {
            Accumulator::Sum { micros } => *micros as f64 / MICROS,
            Accumulator::Count { n } => *n as f64,
            Accumulator::Latest { value, .. } => *value,
            Accumulator::Indicator { value, .. } => {
                if *value {
                    1.0
                } else {
                    0.0
                }
            }
            Accumulator::LastSeen { at_ms } => {
                let elapsed = as_of.timestamp_millis().saturating_sub(*at_ms).max(0);
                elapsed as f64 / MILLIS_PER_DAY
            }
        }
    }
}

/// Fold one event into the accumulator for `kind`. Returns the new
/// accumulator when the event is relevant to the feature.
fn fold(
    current: Option<&Accumulator>,
    kind: &FeatureKind,
    event: &Event,
    offset: Offset,
) -> Option<Accumulator> {
    let at_ms = event.event_time.timestamp_millis();
    match kind {
        FeatureKind::Latest { field } => {
            let value = event.numeric(field)?;
            match current {
                Some(Accumulator::Latest {
                    at_ms: prev_at,
                    offset: prev_offset,
                    ..
                }) if (*prev_at, *prev_offset) >= (at_ms, offset) => None,
                _ => Some(Accumulator::Latest {
                    value,
                    at_ms,
                    offset,
                }),
            }
        }
        FeatureKind::Sum { field } => {
            let delta = (event.numeric(field)? * MICROS).round() as i64;
            let micros = match current {
                Some(Accumulator::Sum { micros }) => *micros,
                _ => 0,
            };
            Some(Accumulator::Sum {
                micros: micros.saturating_add(delta),
            })
        }
        FeatureKind::Count { event_type } => {
            if event.event_type != *event_type {
                return None;
            }
            let n = match current {
                Some(Accumulator::Count { n }) => *n,
                _ => 0,
            };
            Some(Accumulator::Count { n: n + 1 })
        }
        FeatureKind::Indicator { field, equals } => {
            let text = event.text(field)?;
            match current {
                Some(Accumulator::Indicator {
                    at_ms: prev_at,
                    offset: prev_offset,
                    ..
                }) if (*prev_at, *prev_offset) >= (at_ms, offset) => None,
                _ => Some(Accumulator::Indicator {
                    value: text.eq_ignore_ascii_case(equals),
                    at_ms,
                    offset,
                }),
            }
        }
        FeatureKind::DaysSince { event_type } => {
            if event.event_type != *event_type {
                return None;
            }
            match current {
                Some(Accumulator::LastSeen { at_ms: prev }) if *prev >= at_ms => None,
                _ => Some(Accumulator::LastSeen { at_ms }),
            }
        }
    }
}

/// Aggregation state of one entity for one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub window_id: WindowId,
    pub counters: BTreeMap<String, Accumulator>,
    /// Latest event time applied directly to this window.
    pub last_event_time: Option<DateTime<Utc>>,
    pub last_offset_applied: Offset,
    /// `(event_time_ms, event_type)` of every event applied to this window.
    pub seen: BTreeSet<(i64, String)>,
    /// A final snapshot of this window has been emitted.
    #[serde(default)]
    pub final_emitted: bool,
}

impl EntityState {
    pub fn new(entity_id: &str, window_id: WindowId) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            window_id,
            counters: BTreeMap::new(),
            last_event_time: None,
            last_offset_applied: 0,
            seen: BTreeSet::new(),
            final_emitted: false,
        }
    }

    pub fn has_seen(&self, event: &Event) -> bool {
        self.seen
            .contains(&(event.event_time.timestamp_millis(), event.event_type.clone()))
    }

    /// Apply an event that belongs to this window.
    pub fn apply(&mut self, specs: &[FeatureSpec], event: &Event, offset: Offset) {
        self.seen
            .insert((event.event_time.timestamp_millis(), event.event_type.clone()));
        self.last_event_time = Some(match self.last_event_time {
            Some(t) => t.max(event.event_time),
            None => event.event_time,
        });
        self.last_offset_applied = self.last_offset_applied.max(offset);
        self.fold_specs(specs.iter(), event, offset);
    }

    /// Apply only the retained features of an event from an earlier window.
    pub fn apply_retained(&mut self, specs: &[FeatureSpec], event: &Event, offset: Offset) {
        self.fold_specs(specs.iter().filter(|s| s.retain), event, offset);
    }

    fn fold_specs<'a>(
        &mut self,
        specs: impl Iterator<Item = &'a FeatureSpec>,
        event: &Event,
        offset: Offset,
    ) {
        for spec in specs {
            if let Some(next) = fold(self.counters.get(&spec.name), &spec.kind, event, offset) {
                self.counters.insert(spec.name.clone(), next);
            }
        }
    }

    /// Fresh state for `next`, carrying forward retained accumulators only.
    pub fn roll(&self, specs: &[FeatureSpec], next: WindowId) -> Self {
        let mut rolled = Self::new(&self.entity_id, next);
        for spec in specs.iter().filter(|s| s.retain) {
            if let Some(acc) = self.counters.get(&spec.name) {
                rolled.counters.insert(spec.name.clone(), acc.clone());
            }
        }
        rolled
    }

    /// Drop everything but retained accumulators. Returns whether anything
    /// was dropped.
    pub fn compact(&mut self, specs: &[FeatureSpec]) -> bool {
        let before = (self.counters.len(), self.seen.len());
        self.counters
            .retain(|name, _| specs.iter().any(|s| s.retain && s.name == *name));
        self.seen.clear();
        before != (self.counters.len(), 0)
    }

    /// Point-in-time feature vector. Counts and sums are always present
    /// (zero when nothing happened); the rest only once observed.
    pub fn snapshot(&self, specs: &[FeatureSpec], as_of: DateTime<Utc>) -> FeatureVector {
        let mut features = BTreeMap::new();
        for spec in specs {
            let value = match (self.counters.get(&spec.name), &spec.kind) {
                (Some(acc), _) => acc.value_at(as_of),
                (None, FeatureKind::Count { .. } | FeatureKind::Sum { .. }) => 0.0,
                (None, _) => continue,
            };
            features.insert(spec.name.clone(), value);
        }
        FeatureVector {
            entity_id: self.entity_id.clone(),
            window_id: self.window_id,
            as_of_time: as_of,
            features,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use churn_core::features::default_churn_features;

    fn event(minute: u32, event_type: &str, payload: serde_json::Value) -> Event {
        Event {
            entity_id: "C1".into(),
            event_time: Utc.with_ymd_and_hms(2024, 3, 1, 10, minute, 0).unwrap(),
            event_type: event_type.into(),
            payload: payload.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_latest_ignores_older_values() {
        let specs = default_churn_features();
        let mut state = EntityState::new("C1", WindowId(0));
        state.apply(&specs, &event(5, "profile", serde_json::json!({"tenure": 7})), 2);
        state.apply(&specs, &event(1, "profile", serde_json::json!({"tenure": 5})), 3);
        let fv = state.snapshot(&specs, Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap());
        assert_eq!(fv.features["tenure"], 7.0);
    }

    #[test]
    fn test_sum_is_order_independent_bitwise() {
        let specs = vec![FeatureSpec::new(
            "charges",
            FeatureKind::Sum {
                field: "amount".into(),
            },
            false,
        )];
        let amounts = [0.1, 0.2, 0.3, 1e-3, 7.77];
        let as_of = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();

        let mut forward = EntityState::new("C1", WindowId(0));
        for (i, a) in amounts.iter().enumerate() {
            let e = event(i as u32, "charge", serde_json::json!({ "amount": a }));
            forward.apply(&specs, &e, i as u64 + 1);
        }
        let mut backward = EntityState::new("C1", WindowId(0));
        for (i, a) in amounts.iter().enumerate().rev() {
            let e = event(i as u32, "charge", serde_json::json!({ "amount": a }));
            backward.apply(&specs, &e, i as u64 + 1);
        }

        let f = forward.snapshot(&specs, as_of).features["charges"];
        let b = backward.snapshot(&specs, as_of).features["charges"];
        assert_eq!(f.to_bits(), b.to_bits());
    }

    #[test]
    fn test_roll_keeps_only_retained() {
        let specs = default_churn_features();
        let mut state = EntityState::new("C1", WindowId(0));
        state.apply(
            &specs,
            &event(0, "profile", serde_json::json!({"tenure": 5, "contract_type": "month-to-month"})),
            1,
        );
        state.apply(&specs, &event(1, "support_ticket", serde_json::json!({})), 2);
        state.apply(&specs, &event(2, "login", serde_json::json!({})), 3);

        let rolled = state.roll(&specs, WindowId(1));
        let as_of = Utc.with_ymd_and_hms(2024, 3, 3, 10, 2, 0).unwrap();
        let fv = rolled.snapshot(&specs, as_of);
        assert_eq!(fv.features["tenure"], 5.0);
        assert_eq!(fv.features["is_mtm"], 1.0);
        assert_eq!(fv.features["tickets_30d"], 0.0);
        assert_eq!(fv.features["last_login_days"], 2.0);
        assert!(rolled.seen.is_empty());
    }

    #[test]
    fn test_unobserved_features_are_absent() {
        let specs = default_churn_features();
        let state = EntityState::new("C1", WindowId(0));
        let fv = state.snapshot(&specs, Utc::now());
        assert_eq!(fv.features.len(), 1);
        assert_eq!(fv.features["tickets_30d"], 0.0);
    }

    #[test]
    fn test_seeded_values_yield_to_events() {
        let kind = FeatureKind::Latest {
            field: "tenure".into(),
        };
        let seeded = Accumulator::seeded(&kind, 40.0).unwrap();
        let e = event(0, "profile", serde_json::json!({"tenure": 41}));
        let next = fold(Some(&seeded), &kind, &e, 1).unwrap();
        assert!(matches!(next, Accumulator::Latest { value, .. } if value == 41.0));
    }
}
