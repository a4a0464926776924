//! Partition-scoped windowed feature aggregator.
//!
//! One `PartitionAggregator` owns the state of every entity hashed to its
//! partition and is driven by a single worker, so nothing here is locked.
//! Each entity keeps a short timeline of windows: the newest is open, the
//! older ones are closed but still able to absorb events within the lateness
//! bound.
//!
//! An entity silent for `dormant_after` of partition event time is dormant:
//! its existing windows are sealed and later events for them count as late.
//! Dormant entities are compacted down to their retained accumulators, so
//! checkpoint state per quiet customer stays a handful of values.

use crate::state::{Accumulator, EntityState};
use crate::window::WindowAssigner;
use chrono::{DateTime, Duration, Utc};
use churn_core::features::FeatureSpec;
use churn_core::types::{Event, FeatureVector, Offset, PartitionId, WindowId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use tracing::debug;

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Applied. Carries the snapshots of every closed window the event
    /// closed or amended.
    Accepted(Vec<FeatureVector>),
    /// Already applied (offset or event key seen before).
    Duplicate,
    /// Older than the entity's lateness bound; counted, never applied.
    LateDropped,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatorStats {
    pub applied: u64,
    pub duplicates: u64,
    pub late_drops: u64,
    pub windows_closed: u64,
}

#[derive(Debug, Clone, Default)]
struct EntityTimeline {
    windows: BTreeMap<WindowId, EntityState>,
    last_event_time: Option<DateTime<Utc>>,
    last_offset_applied: Offset,
    /// Windows at or before this one accept no more events.
    sealed_through: Option<WindowId>,
}

impl EntityTimeline {
    /// Newest window, if the entity has gone dormant by `watermark`.
    fn dormant_window(
        &self,
        watermark: Option<DateTime<Utc>>,
        dormant_after: Option<Duration>,
    ) -> Option<WindowId> {
        let quiet_until = self.last_event_time?.checked_add_signed(dormant_after?)?;
        if quiet_until > watermark? {
            return None;
        }
        self.windows.last_key_value().map(|(w, _)| *w)
    }
}

/// Serializable image of one entity's timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineSnapshot {
    pub entity_id: String,
    pub last_event_time: Option<DateTime<Utc>>,
    pub last_offset_applied: Offset,
    #[serde(default)]
    pub sealed_through: Option<WindowId>,
    pub windows: Vec<EntityState>,
}

/// Serializable image of a whole partition, stored inside the checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatorSnapshot {
    pub entities: Vec<TimelineSnapshot>,
    #[serde(default)]
    pub seeds: BTreeMap<String, BTreeMap<String, Accumulator>>,
    pub watermark: Option<DateTime<Utc>>,
    pub max_offset_applied: Offset,
    #[serde(default)]
    pub stats: AggregatorStats,
}

pub struct PartitionAggregator {
    partition: PartitionId,
    specs: Vec<FeatureSpec>,
    assigner: WindowAssigner,
    lateness: Duration,
    dormant_after: Option<Duration>,
    entities: HashMap<String, EntityTimeline>,
    /// Warehouse values for entities not yet seen in the stream.
    seeds: HashMap<String, BTreeMap<String, Accumulator>>,
    watermark: Option<DateTime<Utc>>,
    max_offset_applied: Offset,
    stats: AggregatorStats,
}

impl PartitionAggregator {
    pub fn new(
        partition: PartitionId,
        specs: Vec<FeatureSpec>,
        window_secs: i64,
        lateness_secs: i64,
    ) -> Self {
        Self {
            partition,
            specs,
            assigner: WindowAssigner::new(window_secs),
            lateness: Duration::seconds(lateness_secs.max(0)),
            dormant_after: None,
            entities: HashMap::new(),
            seeds: HashMap::new(),
            watermark: None,
            max_offset_applied: 0,
            stats: AggregatorStats::default(),
        }
    }

    /// Seal and compact entities silent for `secs` of partition event time.
    /// Clamped so a window is always past its lateness bound before sealing.
    pub fn with_dormancy(mut self, secs: i64) -> Self {
        let floor = self
            .assigner
            .size_secs()
            .saturating_add(self.lateness.num_seconds());
        self.dormant_after = Duration::try_seconds(secs.max(floor));
        self
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn assigner(&self) -> WindowAssigner {
        self.assigner
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    pub fn max_offset_applied(&self) -> Offset {
        self.max_offset_applied
    }

    pub fn stats(&self) -> &AggregatorStats {
        &self.stats
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Whether the aggregator holds any state or seed for the entity.
    pub fn knows(&self, entity_id: &str) -> bool {
        self.entities.contains_key(entity_id) || self.seeds.contains_key(entity_id)
    }

    /// Seed retained features of an entity new to the partition from the
    /// warehouse. Stream events always take precedence over seeded values.
    pub fn seed(&mut self, entity_id: &str, values: &BTreeMap<String, f64>) {
        if self.entities.contains_key(entity_id) {
            return;
        }
        let counters: BTreeMap<String, Accumulator> = self
            .specs
            .iter()
            .filter(|spec| spec.retain)
            .filter_map(|spec| {
                let value = values.get(&spec.name)?;
                let acc = Accumulator::seeded(&spec.kind, *value)?;
                Some((spec.name.clone(), acc))
            })
            .collect();
        if !counters.is_empty() {
            self.seeds.insert(entity_id.to_string(), counters);
        }
    }

    /// Apply one event at `offset`.
    pub fn apply(&mut self, offset: Offset, event: &Event) -> ApplyOutcome {
        let specs = &self.specs;
        let assigner = self.assigner;
        let timeline = self.entities.entry(event.entity_id.clone()).or_default();

        if offset <= timeline.last_offset_applied {
            self.stats.duplicates += 1;
            metrics::counter!("aggregator.duplicates").increment(1);
            return ApplyOutcome::Duplicate;
        }
        timeline.last_offset_applied = offset;
        self.max_offset_applied = self.max_offset_applied.max(offset);

        if let Some(bound) = timeline
            .last_event_time
            .and_then(|t| t.checked_sub_signed(self.lateness))
        {
            if event.event_time < bound {
                debug!(
                    partition = self.partition,
                    entity_id = %event.entity_id,
                    offset,
                    event_time = %event.event_time,
                    "Dropping event beyond lateness bound"
                );
                record_late_drop(&mut self.stats);
                return ApplyOutcome::LateDropped;
            }
        }

        let target = assigner.window_for(event.event_time);
        if let Some(newest) = timeline.dormant_window(self.watermark, self.dormant_after) {
            timeline.sealed_through = Some(newest);
        }
        if timeline.sealed_through.is_some_and(|sealed| target <= sealed) {
            debug!(
                partition = self.partition,
                entity_id = %event.entity_id,
                offset,
                window_id = %target,
                "Dropping event for a sealed window"
            );
            record_late_drop(&mut self.stats);
            return ApplyOutcome::LateDropped;
        }
        if timeline
            .windows
            .get(&target)
            .is_some_and(|state| state.has_seen(event))
        {
            self.stats.duplicates += 1;
            metrics::counter!("aggregator.duplicates").increment(1);
            return ApplyOutcome::Duplicate;
        }

        let seed = self.seeds.get(&event.entity_id);
        let fresh = |window: WindowId| {
            let mut state = EntityState::new(&event.entity_id, window);
            if let Some(counters) = seed {
                state.counters = counters.clone();
            }
            state
        };

        let mut emitted = Vec::new();
        let current = timeline.windows.last_key_value().map(|(w, _)| *w);
        match current {
            None => {
                let mut state = fresh(target);
                state.apply(specs, event, offset);
                timeline.windows.insert(target, state);
            }
            Some(cur) if target == cur => {
                if let Some(state) = timeline.windows.get_mut(&cur) {
                    state.apply(specs, event, offset);
                    // Already flushed as idle: the amendment is re-emitted.
                    if state.final_emitted {
                        emitted.push(state.snapshot(specs, assigner.end(cur)));
                    }
                }
            }
            Some(cur) if target > cur => {
                if let Some(closing) = timeline.windows.get_mut(&cur) {
                    if !closing.final_emitted {
                        closing.final_emitted = true;
                        self.stats.windows_closed += 1;
                        metrics::counter!("aggregator.windows_closed").increment(1);
                        emitted.push(closing.snapshot(specs, assigner.end(cur)));
                    }
                    let mut next = closing.roll(specs, target);
                    next.apply(specs, event, offset);
                    timeline.windows.insert(target, next);
                }
            }
            Some(_) => {
                let state = match timeline.windows.range(..target).next_back() {
                    _ if timeline.windows.contains_key(&target) => None,
                    Some((_, earlier)) => Some(earlier.roll(specs, target)),
                    None => Some(fresh(target)),
                };
                if let Some(state) = state {
                    timeline.windows.insert(target, state);
                }
                if let Some(state) = timeline.windows.get_mut(&target) {
                    state.apply(specs, event, offset);
                    if !state.final_emitted {
                        state.final_emitted = true;
                        self.stats.windows_closed += 1;
                        metrics::counter!("aggregator.windows_closed").increment(1);
                    }
                    emitted.push(state.snapshot(specs, assigner.end(target)));
                }
                let later = (Bound::Excluded(target), Bound::Unbounded);
                for (window, state) in timeline.windows.range_mut(later) {
                    let before = state.counters.clone();
                    state.apply_retained(specs, event, offset);
                    if state.final_emitted && state.counters != before {
                        emitted.push(state.snapshot(specs, assigner.end(*window)));
                    }
                }
            }
        }

        timeline.last_event_time = Some(match timeline.last_event_time {
            Some(t) => t.max(event.event_time),
            None => event.event_time,
        });
        self.watermark = Some(match self.watermark {
            Some(t) => t.max(event.event_time),
            None => event.event_time,
        });
        prune(timeline, assigner, self.lateness);
        self.stats.applied += 1;

        ApplyOutcome::Accepted(emitted)
    }

    /// On-demand snapshot of an entity's open window, if it has not been
    /// emitted as final yet.
    pub fn open_snapshot(&self, entity_id: &str) -> Option<FeatureVector> {
        let timeline = self.entities.get(entity_id)?;
        let (window, state) = timeline.windows.last_key_value()?;
        if state.final_emitted {
            return None;
        }
        let as_of = state
            .last_event_time
            .unwrap_or_else(|| self.assigner.start(*window));
        Some(state.snapshot(&self.specs, as_of))
    }

    /// Close open windows the partition watermark has moved past by more than
    /// the lateness bound. Output is ordered by entity id.
    pub fn flush_idle(&mut self) -> Vec<FeatureVector> {
        let Some(watermark) = self.watermark else {
            return Vec::new();
        };
        let mut flushed = Vec::new();
        for timeline in self.entities.values_mut() {
            let Some(mut entry) = timeline.windows.last_entry() else {
                continue;
            };
            let end = self.assigner.end(*entry.key());
            let state = entry.get_mut();
            if state.final_emitted {
                continue;
            }
            let idle = end
                .checked_add_signed(self.lateness)
                .is_some_and(|closes_at| closes_at <= watermark);
            if idle {
                state.final_emitted = true;
                flushed.push(state.snapshot(&self.specs, end));
            }
        }
        if !flushed.is_empty() {
            self.stats.windows_closed += flushed.len() as u64;
            metrics::counter!("aggregator.windows_closed").increment(flushed.len() as u64);
        }
        flushed.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        flushed
    }

    /// Seal dormant entities whose newest window was already emitted as
    /// final, keep only that window's retained accumulators, and forget
    /// their warehouse seed. Returns how many entities shrank.
    pub fn compact_dormant(&mut self) -> usize {
        let mut compacted = 0;
        for (entity_id, timeline) in self.entities.iter_mut() {
            let Some(newest) = timeline.dormant_window(self.watermark, self.dormant_after) else {
                continue;
            };
            if !timeline.windows.get(&newest).is_some_and(|s| s.final_emitted) {
                continue;
            }
            timeline.sealed_through = Some(newest);
            let before = timeline.windows.len();
            timeline.windows.retain(|window, _| *window == newest);
            let mut changed = timeline.windows.len() != before;
            if let Some(state) = timeline.windows.get_mut(&newest) {
                changed |= state.compact(&self.specs);
            }
            changed |= self.seeds.remove(entity_id).is_some();
            if changed {
                compacted += 1;
            }
        }
        if compacted > 0 {
            metrics::counter!("aggregator.entities_compacted").increment(compacted as u64);
            debug!(partition = self.partition, compacted, "Compacted dormant entities");
        }
        compacted
    }

    pub fn snapshot(&self) -> AggregatorSnapshot {
        let mut entities: Vec<TimelineSnapshot> = self
            .entities
            .iter()
            .map(|(entity_id, timeline)| TimelineSnapshot {
                entity_id: entity_id.clone(),
                last_event_time: timeline.last_event_time,
                last_offset_applied: timeline.last_offset_applied,
                sealed_through: timeline.sealed_through,
                windows: timeline.windows.values().cloned().collect(),
            })
            .collect();
        entities.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        AggregatorSnapshot {
            entities,
            seeds: self
                .seeds
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            watermark: self.watermark,
            max_offset_applied: self.max_offset_applied,
            stats: self.stats.clone(),
        }
    }

    /// Replace all state with a previously taken snapshot.
    pub fn restore(&mut self, snapshot: AggregatorSnapshot) {
        self.entities = snapshot
            .entities
            .into_iter()
            .map(|entity| {
                let timeline = EntityTimeline {
                    windows: entity
                        .windows
                        .into_iter()
                        .map(|state| (state.window_id, state))
                        .collect(),
                    last_event_time: entity.last_event_time,
                    last_offset_applied: entity.last_offset_applied,
                    sealed_through: entity.sealed_through,
                };
                (entity.entity_id, timeline)
            })
            .collect();
        self.seeds = snapshot.seeds.into_iter().collect();
        self.watermark = snapshot.watermark;
        self.max_offset_applied = snapshot.max_offset_applied;
        self.stats = snapshot.stats;
    }

    /// Drop all state, as on a partition with no checkpoint.
    pub fn reset(&mut self) {
        self.restore(AggregatorSnapshot::default());
    }
}

fn record_late_drop(stats: &mut AggregatorStats) {
    stats.late_drops += 1;
    metrics::counter!("aggregator.late_drops").increment(1);
}

/// Forget closed windows that can no longer receive an accepted event,
/// keeping the newest of them as the base for windows created later.
fn prune(timeline: &mut EntityTimeline, assigner: WindowAssigner, lateness: Duration) {
    let Some(bound) = timeline
        .last_event_time
        .and_then(|t| t.checked_sub_signed(lateness))
    else {
        return;
    };
    let Some(current) = timeline.windows.last_key_value().map(|(w, _)| *w) else {
        return;
    };
    let dead: Vec<WindowId> = timeline
        .windows
        .keys()
        .copied()
        .filter(|w| *w != current && assigner.end(*w) <= bound)
        .collect();
    if let Some((_floor, older)) = dead.split_last() {
        for window in older {
            timeline.windows.remove(window);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use churn_core::features::default_churn_features;
    use serde_json::json;

    const HOUR: i64 = 3600;

    fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, second)
            .unwrap()
    }

    fn event(entity: &str, time: DateTime<Utc>, event_type: &str, payload: serde_json::Value) -> Event {
        Event {
            entity_id: entity.into(),
            event_time: time,
            event_type: event_type.into(),
            payload: payload.as_object().cloned().unwrap_or_default(),
        }
    }

    fn aggregator() -> PartitionAggregator {
        // Hourly windows, 30 minute lateness.
        PartitionAggregator::new(0, default_churn_features(), HOUR, 1800)
    }

    fn accepted(outcome: ApplyOutcome) -> Vec<FeatureVector> {
        match outcome {
            ApplyOutcome::Accepted(emitted) => emitted,
            other => panic!("expected accepted, got {other:?}"),
        }
    }

    #[test]
    fn test_window_close_emits_and_rolls() {
        let mut agg = aggregator();
        let profile = json!({"tenure": 5, "contract_type": "Month-to-month"});
        assert!(accepted(agg.apply(1, &event("C1", at(10, 0, 0), "profile_update", profile))).is_empty());
        agg.apply(2, &event("C1", at(10, 10, 0), "support_ticket", json!({})));
        agg.apply(3, &event("C1", at(10, 20, 0), "support_ticket", json!({})));

        let open = agg.open_snapshot("C1").unwrap();
        assert_eq!(open.as_of_time, at(10, 20, 0));
        assert_eq!(open.features["tickets_30d"], 2.0);

        let closed = accepted(agg.apply(4, &event("C1", at(11, 5, 0), "login", json!({}))));
        assert_eq!(closed.len(), 1);
        let fv = &closed[0];
        assert_eq!(fv.as_of_time, at(11, 0, 0));
        assert_eq!(fv.features["tenure"], 5.0);
        assert_eq!(fv.features["is_mtm"], 1.0);
        assert_eq!(fv.features["tickets_30d"], 2.0);
        assert!(!fv.features.contains_key("last_login_days"));

        let next = agg.open_snapshot("C1").unwrap();
        assert_eq!(next.features["tickets_30d"], 0.0);
        assert_eq!(next.features["tenure"], 5.0);
        assert_eq!(next.features["last_login_days"], 0.0);
        assert_eq!(agg.stats().windows_closed, 1);
    }

    #[test]
    fn test_duplicate_offset_applied_once() {
        let mut agg = aggregator();
        let e = event("C1", at(10, 0, 0), "support_ticket", json!({}));
        accepted(agg.apply(7, &e));
        let before = agg.open_snapshot("C1").unwrap();
        assert_eq!(agg.apply(7, &e), ApplyOutcome::Duplicate);
        assert_eq!(agg.apply(3, &e), ApplyOutcome::Duplicate);
        assert_eq!(agg.open_snapshot("C1").unwrap(), before);
        assert_eq!(agg.stats().duplicates, 2);
    }

    #[test]
    fn test_redelivered_event_with_new_offset_is_duplicate() {
        let mut agg = aggregator();
        let e = event("C1", at(10, 0, 0), "support_ticket", json!({}));
        accepted(agg.apply(1, &e));
        assert_eq!(agg.apply(2, &e), ApplyOutcome::Duplicate);
        assert_eq!(agg.open_snapshot("C1").unwrap().features["tickets_30d"], 1.0);
    }

    #[test]
    fn test_lateness_boundary() {
        let mut agg = aggregator();
        accepted(agg.apply(1, &event("C1", at(11, 0, 0), "login", json!({}))));

        // Exactly at last_event_time - lateness.
        let on_bound = event("C1", at(10, 30, 0), "support_ticket", json!({}));
        let emitted = accepted(agg.apply(2, &on_bound));
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].window_id, WindowId(at(10, 0, 0).timestamp() / HOUR));
        assert_eq!(emitted[0].features["tickets_30d"], 1.0);

        // One second past the bound.
        let past = event("C1", at(10, 29, 59), "support_ticket", json!({}));
        assert_eq!(agg.apply(3, &past), ApplyOutcome::LateDropped);
        assert_eq!(agg.stats().late_drops, 1);
        assert_eq!(agg.max_offset_applied(), 3);
    }

    #[test]
    fn test_late_event_amends_closed_window_and_later_retained() {
        let mut agg = aggregator();
        let profile = |tenure: i64| json!({ "tenure": tenure });
        accepted(agg.apply(1, &event("C1", at(10, 0, 0), "profile_update", profile(5))));
        accepted(agg.apply(2, &event("C1", at(11, 10, 0), "support_ticket", json!({}))));

        let emitted = accepted(agg.apply(3, &event("C1", at(10, 50, 0), "profile_update", profile(6))));
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].features["tenure"], 6.0);
        assert_eq!(agg.open_snapshot("C1").unwrap().features["tenure"], 6.0);
    }

    #[test]
    fn test_order_invariance_within_lateness() {
        let events = vec![
            event("C1", at(10, 40, 0), "profile_update", json!({"tenure": 5, "contract_type": "Month-to-month"})),
            event("C1", at(10, 45, 0), "support_ticket", json!({})),
            event("C1", at(10, 50, 0), "login", json!({})),
            event("C1", at(11, 5, 0), "profile_update", json!({"tenure": 6})),
            event("C1", at(11, 10, 0), "support_ticket", json!({})),
        ];
        let final_rows = |order: &[usize]| {
            let mut agg = aggregator();
            let mut rows: BTreeMap<WindowId, FeatureVector> = BTreeMap::new();
            // Offsets follow arrival order.
            for (arrival, i) in order.iter().enumerate() {
                for fv in accepted(agg.apply(arrival as u64 + 1, &events[*i])) {
                    rows.insert(fv.window_id, fv);
                }
            }
            if let Some(fv) = agg.open_snapshot("C1") {
                rows.insert(fv.window_id, fv);
            }
            rows
        };

        let in_order = final_rows(&[0, 1, 2, 3, 4]);
        let shuffled = final_rows(&[3, 1, 4, 0, 2]);
        assert_eq!(in_order.len(), 2);
        assert_eq!(in_order, shuffled);
    }

    #[test]
    fn test_flush_idle_closes_quiet_entities() {
        let mut agg = aggregator();
        accepted(agg.apply(1, &event("C1", at(10, 0, 0), "support_ticket", json!({}))));
        accepted(agg.apply(2, &event("C2", at(11, 29, 0), "login", json!({}))));
        assert!(agg.flush_idle().is_empty());

        accepted(agg.apply(3, &event("C2", at(11, 30, 0), "login", json!({}))));
        let flushed = agg.flush_idle();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].entity_id, "C1");
        assert_eq!(flushed[0].as_of_time, at(11, 0, 0));
        assert!(agg.open_snapshot("C1").is_none());
        assert!(agg.flush_idle().is_empty());

        // A straggler for the flushed window re-emits it.
        let emitted = accepted(agg.apply(4, &event("C1", at(10, 5, 0), "support_ticket", json!({}))));
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].features["tickets_30d"], 2.0);
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut agg = aggregator();
        accepted(agg.apply(1, &event("C1", at(10, 0, 0), "profile_update", json!({"tenure": 3}))));
        accepted(agg.apply(2, &event("C2", at(10, 1, 0), "support_ticket", json!({}))));
        let snapshot = agg.snapshot();
        let json = serde_json::to_value(&snapshot).unwrap();

        let mut restored = aggregator();
        restored.restore(serde_json::from_value(json).unwrap());
        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.max_offset_applied(), 2);
        assert_eq!(
            restored.apply(2, &event("C2", at(10, 2, 0), "login", json!({}))),
            ApplyOutcome::Duplicate
        );
    }

    #[test]
    fn test_seeded_entity_uses_warehouse_values_until_overridden() {
        let mut agg = aggregator();
        let mut values = BTreeMap::new();
        values.insert("tenure".to_string(), 40.0);
        values.insert("is_mtm".to_string(), 1.0);
        values.insert("tickets_30d".to_string(), 9.0);
        agg.seed("C1", &values);
        assert!(agg.knows("C1"));

        accepted(agg.apply(1, &event("C1", at(10, 0, 0), "support_ticket", json!({}))));
        let fv = agg.open_snapshot("C1").unwrap();
        assert_eq!(fv.features["tenure"], 40.0);
        assert_eq!(fv.features["is_mtm"], 1.0);
        assert_eq!(fv.features["tickets_30d"], 1.0);

        accepted(agg.apply(2, &event("C1", at(10, 1, 0), "profile_update", json!({"tenure": 41}))));
        assert_eq!(agg.open_snapshot("C1").unwrap().features["tenure"], 41.0);
    }

    #[test]
    fn test_dormant_entity_compacts_to_retained_state() {
        let history = [
            event("C1", at(10, 0, 0), "profile_update", json!({"tenure": 5, "contract_type": "Month-to-month"})),
            event("C1", at(10, 10, 0), "support_ticket", json!({})),
            event("C2", at(12, 10, 0), "login", json!({})),
        ];
        let mut dormant = aggregator().with_dormancy(2 * HOUR);
        let mut plain = aggregator();
        for (i, e) in history.iter().enumerate() {
            accepted(dormant.apply(i as u64 + 1, e));
            accepted(plain.apply(i as u64 + 1, e));
        }

        let flushed = dormant.flush_idle();
        assert_eq!(flushed.len(), 1);
        assert_eq!(dormant.compact_dormant(), 1);
        assert_eq!(dormant.compact_dormant(), 0);

        let snapshot = dormant.snapshot();
        let c1 = &snapshot.entities[0];
        assert_eq!(c1.entity_id, "C1");
        assert_eq!(c1.sealed_through, Some(WindowId(at(10, 0, 0).timestamp() / HOUR)));
        assert_eq!(c1.windows.len(), 1);
        assert!(c1.windows[0].seen.is_empty());
        assert_eq!(
            c1.windows[0].counters.keys().collect::<Vec<_>>(),
            vec!["is_mtm", "tenure"]
        );

        // The sealed window refuses stragglers the plain timeline would take.
        let straggler = event("C1", at(10, 40, 0), "support_ticket", json!({}));
        assert_eq!(dormant.apply(4, &straggler), ApplyOutcome::LateDropped);
        assert_eq!(dormant.stats().late_drops, 1);

        // Later windows roll from the compacted state unchanged.
        let comeback = event("C1", at(13, 5, 0), "login", json!({}));
        assert!(accepted(dormant.apply(5, &comeback)).is_empty());
        plain.flush_idle();
        accepted(plain.apply(5, &comeback));
        assert_eq!(dormant.open_snapshot("C1"), plain.open_snapshot("C1"));
    }

    #[test]
    fn test_dormancy_seals_without_compaction() {
        let mut agg = aggregator().with_dormancy(2 * HOUR);
        accepted(agg.apply(1, &event("C1", at(10, 10, 0), "login", json!({}))));
        accepted(agg.apply(2, &event("C2", at(12, 10, 0), "login", json!({}))));

        // Same outcome whether or not a compaction pass ran in between.
        let straggler = event("C1", at(10, 40, 0), "support_ticket", json!({}));
        assert_eq!(agg.apply(3, &straggler), ApplyOutcome::LateDropped);
        let restored = {
            let mut copy = aggregator().with_dormancy(2 * HOUR);
            copy.restore(agg.snapshot());
            copy
        };
        assert_eq!(restored.snapshot().entities[0].sealed_through, Some(WindowId(at(10, 0, 0).timestamp() / HOUR)));
    }

    #[test]
    fn test_closed_windows_are_pruned() {
        let mut agg = aggregator();
        for (i, hour) in [8, 9, 10, 11, 12].iter().enumerate() {
            accepted(agg.apply(i as u64 + 1, &event("C1", at(*hour, 0, 0), "login", json!({}))));
        }
        let snapshot = agg.snapshot();
        let windows: Vec<_> = snapshot.entities[0].windows.iter().map(|s| s.window_id).collect();
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0], WindowId(at(10, 0, 0).timestamp() / HOUR));
        assert_eq!(windows[2], WindowId(at(12, 0, 0).timestamp() / HOUR));
    }
}
