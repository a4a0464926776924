//! Per-partition orchestrator.
//!
//! One worker owns one partition end to end:
//!
//! `IDLE → CONSUMING → AGGREGATING → SCORING → EXPLAINING → WRITING → CHECKPOINTING → IDLE`
//!
//! A cycle only checkpoints after every prediction it produced has been
//! committed by the writer. The checkpoint carries the aggregator snapshot
//! taken at the committed offset, so a crash anywhere in the cycle replays
//! the uncommitted tail against the exact state it was first applied to and
//! re-writes the same rows.

use crate::batcher::TriggerPolicy;
use crate::manager::PipelineDeps;
use crate::status::PartitionState;
use chrono::{DateTime, Utc};
use churn_aggregator::{AggregatorSnapshot, ApplyOutcome, PartitionAggregator};
use churn_analytics::{RetryPolicy, RetryQueue, WriteOutcome};
use churn_core::config::{AggregatorConfig, OrchestratorConfig};
use churn_core::dead_letter::DeadLetterRecord;
use churn_core::error::{ChurnError, ChurnResult};
use churn_core::inference::ScoringError;
use churn_core::types::{
    Checkpoint, Event, FeatureVector, Offset, PartitionId, Prediction, PredictionKey, Score,
    SourceRecord,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CHECKPOINT_ATTEMPTS: u32 = 3;

/// A window whose scoring failed, kept for the next trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DegradedEntry {
    vector: FeatureVector,
    failures: u32,
}

/// Everything a partition needs to resume exactly where it committed.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WorkerSnapshot {
    aggregator: AggregatorSnapshot,
    #[serde(default)]
    degraded: Vec<DegradedEntry>,
}

/// Counters for one trigger cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub records: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub late_drops: usize,
    pub malformed: usize,
    /// Feature vectors sent to scoring, degraded retries included.
    pub vectors: usize,
    pub written: usize,
    pub degraded: usize,
    /// Times the write stage held back new writes behind a full retry queue.
    pub backpressure_waits: usize,
    pub committed_offset: Offset,
}

pub struct PartitionWorker {
    partition: PartitionId,
    deps: PipelineDeps,
    config: OrchestratorConfig,
    trigger: TriggerPolicy,
    aggregator: PartitionAggregator,
    degraded: BTreeMap<PredictionKey, DegradedEntry>,
    committed: Offset,
    transport_retry: RetryPolicy,
    transport_errors: u32,
    retries: Arc<RetryQueue>,
    recovery_attempts: u32,
    shutdown: CancellationToken,
}

impl PartitionWorker {
    pub fn new(
        partition: PartitionId,
        aggregator: &AggregatorConfig,
        config: OrchestratorConfig,
        deps: PipelineDeps,
        shutdown: CancellationToken,
    ) -> Self {
        deps.status.register(partition);
        Self {
            partition,
            trigger: TriggerPolicy::from_config(&config),
            aggregator: PartitionAggregator::new(
                partition,
                aggregator.features.clone(),
                aggregator.window_secs,
                aggregator.lateness_secs,
            )
            .with_dormancy(aggregator.dormant_after_secs),
            degraded: BTreeMap::new(),
            committed: 0,
            transport_retry: RetryPolicy {
                max_attempts: u32::MAX,
                initial_backoff_ms: 50,
                max_backoff_ms: config.failure_backoff_ms.max(50),
                backoff_multiplier: 2.0,
                jitter: true,
            },
            transport_errors: 0,
            retries: Arc::new(RetryQueue::new(partition)),
            recovery_attempts: 0,
            config,
            deps,
            shutdown,
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn committed_offset(&self) -> Offset {
        self.committed
    }

    pub fn degraded_windows(&self) -> usize {
        self.degraded.len()
    }

    pub fn aggregator(&self) -> &PartitionAggregator {
        &self.aggregator
    }

    fn set_state(&self, state: PartitionState) {
        self.deps.status.update(self.partition, |s| s.state = state);
    }

    /// Reload partition state from the last durable checkpoint.
    pub async fn recover(&mut self) -> ChurnResult<()> {
        self.set_state(PartitionState::Recovering);
        let checkpoint = self.deps.checkpoints.get_committed(self.partition).await?;

        match checkpoint {
            Some(checkpoint) => {
                let snapshot = self.decode_state(&checkpoint)?;
                if snapshot.aggregator.max_offset_applied > checkpoint.committed_offset {
                    return Err(ChurnError::StateCorruption {
                        partition: self.partition,
                        detail: format!(
                            "snapshot applied offset {} beyond committed offset {}",
                            snapshot.aggregator.max_offset_applied, checkpoint.committed_offset
                        ),
                    });
                }
                self.aggregator.restore(snapshot.aggregator);
                self.degraded = snapshot
                    .degraded
                    .into_iter()
                    .map(|entry| (entry.vector.key(), entry))
                    .collect();
                self.committed = checkpoint.committed_offset;
                info!(
                    partition = self.partition,
                    committed_offset = self.committed,
                    entities = self.aggregator.entity_count(),
                    degraded = self.degraded.len(),
                    "Partition restored from checkpoint"
                );
            }
            None => {
                self.aggregator.reset();
                self.degraded.clear();
                self.committed = 0;
                info!(partition = self.partition, "No checkpoint, starting from the beginning");
            }
        }

        let committed = self.committed;
        let watermark = self.aggregator.watermark();
        let stats = self.aggregator.stats().clone();
        let degraded = self.degraded.len();
        let entities = self.aggregator.entity_count();
        self.deps.status.update(self.partition, |s| {
            s.entities = entities;
            s.committed_offset = committed;
            s.last_event_time = watermark;
            s.late_drops = stats.late_drops;
            s.duplicates = stats.duplicates;
            s.degraded_windows = degraded;
        });
        self.set_state(PartitionState::Idle);
        Ok(())
    }

    fn decode_state(&self, checkpoint: &Checkpoint) -> ChurnResult<WorkerSnapshot> {
        match &checkpoint.state {
            Some(state) => serde_json::from_value(state.clone()).map_err(|e| {
                ChurnError::StateCorruption {
                    partition: self.partition,
                    detail: format!("undecodable checkpoint state: {e}"),
                }
            }),
            None if checkpoint.committed_offset == 0 => Ok(WorkerSnapshot::default()),
            None => Err(ChurnError::StateCorruption {
                partition: self.partition,
                detail: format!(
                    "checkpoint at offset {} carries no state",
                    checkpoint.committed_offset
                ),
            }),
        }
    }

    /// Run one trigger cycle: consume a batch, aggregate, score, explain,
    /// write, checkpoint.
    pub async fn run_cycle(&mut self) -> ChurnResult<CycleReport> {
        let mut report = CycleReport {
            committed_offset: self.committed,
            ..Default::default()
        };

        self.set_state(PartitionState::Consuming);
        let records = self.consume().await;
        report.records = records.len();
        if records.is_empty() && self.degraded.is_empty() {
            self.set_state(PartitionState::Idle);
            return Ok(report);
        }
        if let Some(first) = records.first() {
            self.check_contiguous(first.offset)?;
        }

        self.set_state(PartitionState::Aggregating);
        let vectors = self.aggregate(&records, &mut report).await;

        // Degraded windows not superseded by this batch are retried as-is.
        let mut work: Vec<(FeatureVector, u32)> = Vec::with_capacity(vectors.len());
        let mut superseded = BTreeMap::new();
        for (key, entry) in &self.degraded {
            if !vectors.contains_key(key) {
                work.push((entry.vector.clone(), entry.failures));
            } else {
                superseded.insert(key.clone(), entry.failures);
            }
        }
        for (key, vector) in vectors {
            let failures = superseded.get(&key).copied().unwrap_or(0);
            work.push((vector, failures));
        }
        report.vectors = work.len();

        self.set_state(PartitionState::Scoring);
        let mut degraded = BTreeMap::new();
        let mut scored: Vec<(FeatureVector, Score, u32)> = Vec::with_capacity(work.len());
        for (vector, failures) in work {
            match self.deps.processor.score(&vector).await {
                Ok(score) => scored.push((vector, score, failures)),
                Err(e) => self.degrade(&mut degraded, vector, failures, &e),
            }
        }

        self.set_state(PartitionState::Explaining);
        let mut predictions = Vec::with_capacity(scored.len());
        for (vector, score, failures) in scored {
            match self.deps.processor.explain(&vector, &score).await {
                Ok(explanation) => predictions.push(Prediction::new(
                    &vector,
                    &score,
                    explanation.factors,
                    Utc::now(),
                )),
                Err(e) => self.degrade(&mut degraded, vector, failures, &e),
            }
        }
        report.degraded = degraded.len();

        self.set_state(PartitionState::Writing);
        self.write_all(predictions, &mut report).await?;

        self.set_state(PartitionState::Checkpointing);
        let offset = last_offset(&records).unwrap_or(self.committed);
        self.checkpoint(offset, degraded).await?;
        report.committed_offset = offset;

        debug!(
            partition = self.partition,
            records = report.records,
            applied = report.applied,
            written = report.written,
            degraded = report.degraded,
            committed_offset = offset,
            "Cycle complete"
        );
        self.set_state(PartitionState::Idle);
        Ok(report)
    }

    /// Upsert the cycle's predictions with up to `max_in_flight` open at
    /// once. While this partition's retry queue is full nothing new is
    /// dispatched, and the next batch is not consumed until every write
    /// settles.
    async fn write_all(
        &self,
        predictions: Vec<Prediction>,
        report: &mut CycleReport,
    ) -> ChurnResult<()> {
        let writer = &self.deps.writer;
        let mut queued = predictions.into_iter();
        let mut in_flight = JoinSet::new();
        let mut throttled = false;

        loop {
            while in_flight.len() < writer.max_in_flight() && queued.len() > 0 {
                if writer.is_saturated(&self.retries) {
                    if !throttled {
                        throttled = true;
                        report.backpressure_waits += 1;
                        metrics::counter!(
                            "partition.backpressure_waits",
                            "partition" => self.partition.to_string()
                        )
                        .increment(1);
                        debug!(
                            partition = self.partition,
                            retrying = self.retries.depth(),
                            queued = queued.len(),
                            "Retry queue full, holding back writes"
                        );
                    }
                    break;
                }
                let Some(prediction) = queued.next() else {
                    break;
                };
                throttled = false;
                let (writer, retries) = (writer.clone(), self.retries.clone());
                in_flight.spawn(async move {
                    let outcome = writer.write(&prediction, &retries).await;
                    (prediction, outcome)
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                return Ok(());
            };
            let (prediction, outcome) =
                joined.map_err(|e| ChurnError::WriteFailure(format!("write task: {e}")))?;
            if let WriteOutcome::Failed { attempts, error } = outcome {
                // Dropping the set aborts the remaining writes; the cycle replays.
                return Err(ChurnError::WriteFailure(format!(
                    "{}/{} after {attempts} attempts: {error}",
                    prediction.entity_id, prediction.window_id
                )));
            }
            report.written += 1;
        }
    }

    /// Fill one batch. Transport errors are absorbed with backoff; the
    /// partition keeps whatever was collected before the error.
    async fn consume(&mut self) -> Vec<SourceRecord> {
        let mut batch = self.trigger.open();
        let mut records: Vec<SourceRecord> = Vec::new();
        while !batch.is_due() && !self.shutdown.is_cancelled() {
            let after = last_offset(&records).unwrap_or(self.committed);
            let polled = self
                .deps
                .source
                .poll(self.partition, after, batch.room(), batch.next_wait())
                .await;
            match polled {
                Ok(polled) => {
                    self.transport_errors = 0;
                    batch.record(polled.len());
                    records.extend(polled.into_iter().filter(|r| r.offset > after));
                }
                Err(e) => {
                    metrics::counter!("source.transport_errors").increment(1);
                    let backoff = self.transport_retry.backoff_for_attempt(self.transport_errors);
                    self.transport_errors = self.transport_errors.saturating_add(1);
                    warn!(
                        partition = self.partition,
                        source = self.deps.source.name(),
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Event source poll failed"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    if !records.is_empty() {
                        break;
                    }
                }
            }
        }
        records
    }

    fn check_contiguous(&self, first: Offset) -> ChurnResult<()> {
        if self.config.strict_offsets
            && self.deps.source.contiguous_offsets()
            && first != self.committed + 1
        {
            return Err(ChurnError::StateCorruption {
                partition: self.partition,
                detail: format!(
                    "first offset after checkpoint {} is {first}",
                    self.committed
                ),
            });
        }
        Ok(())
    }

    /// Apply the batch and collect the vectors to score, one per
    /// entity-window (the most recent snapshot wins).
    async fn aggregate(
        &mut self,
        records: &[SourceRecord],
        report: &mut CycleReport,
    ) -> BTreeMap<PredictionKey, FeatureVector> {
        let mut vectors = BTreeMap::new();
        let mut touched = BTreeSet::new();

        for record in records {
            let event = match Event::from_slice(&record.payload) {
                Ok(event) => event,
                Err(e) => {
                    report.malformed += 1;
                    self.deps.dead_letters.route(DeadLetterRecord::new(
                        self.partition,
                        record.offset,
                        &record.payload,
                        e.to_string(),
                    ));
                    continue;
                }
            };
            self.seed_if_new(&event.entity_id).await;

            match self.aggregator.apply(record.offset, &event) {
                ApplyOutcome::Accepted(emitted) => {
                    report.applied += 1;
                    touched.insert(event.entity_id);
                    for vector in emitted {
                        vectors.insert(vector.key(), vector);
                    }
                }
                ApplyOutcome::Duplicate => report.duplicates += 1,
                ApplyOutcome::LateDropped => report.late_drops += 1,
            }
        }

        if self.config.score_open_windows {
            for entity_id in &touched {
                if let Some(vector) = self.aggregator.open_snapshot(entity_id) {
                    vectors.insert(vector.key(), vector);
                }
            }
        }
        for vector in self.aggregator.flush_idle() {
            vectors.insert(vector.key(), vector);
        }
        self.aggregator.compact_dormant();
        vectors
    }

    /// Cold start: seed retained features of an entity the partition has
    /// never seen from the warehouse feature table.
    async fn seed_if_new(&mut self, entity_id: &str) {
        let Some(store) = self.deps.features.as_ref() else {
            return;
        };
        if self.aggregator.knows(entity_id) {
            return;
        }
        match store.get_features(entity_id).await {
            Ok(Some(values)) => {
                debug!(partition = self.partition, entity_id, "Seeding entity from feature store");
                self.aggregator.seed(entity_id, &values);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    partition = self.partition,
                    entity_id,
                    error = %e,
                    "Feature store lookup failed, starting entity cold"
                );
            }
        }
    }

    fn degrade(
        &self,
        degraded: &mut BTreeMap<PredictionKey, DegradedEntry>,
        vector: FeatureVector,
        failures: u32,
        error: &ScoringError,
    ) {
        let failures = failures + 1;
        if failures > self.config.max_scoring_failures {
            metrics::counter!("scoring.escalations").increment(1);
            error!(
                partition = self.partition,
                entity_id = %vector.entity_id,
                window_id = %vector.window_id,
                failures,
                error = %error,
                "Window failed scoring repeatedly, giving up on it"
            );
            return;
        }
        metrics::counter!("scoring.degraded").increment(1);
        warn!(
            partition = self.partition,
            entity_id = %vector.entity_id,
            window_id = %vector.window_id,
            failures,
            error = %error,
            "Window degraded, will retry on next trigger"
        );
        degraded.insert(vector.key(), DegradedEntry { vector, failures });
    }

    async fn checkpoint(
        &mut self,
        offset: Offset,
        degraded: BTreeMap<PredictionKey, DegradedEntry>,
    ) -> ChurnResult<()> {
        let snapshot = WorkerSnapshot {
            aggregator: self.aggregator.snapshot(),
            degraded: degraded.values().cloned().collect(),
        };
        let checkpoint = Checkpoint {
            partition_id: self.partition,
            committed_offset: offset,
            committed_at: Utc::now(),
            state: Some(serde_json::to_value(&snapshot)?),
        };

        let mut attempt = 0;
        loop {
            match self.deps.checkpoints.set_committed(&checkpoint).await {
                Ok(()) => break,
                Err(e) if e.is_transient() && attempt + 1 < CHECKPOINT_ATTEMPTS => {
                    let backoff = self.transport_retry.backoff_for_attempt(attempt);
                    attempt += 1;
                    warn!(
                        partition = self.partition,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Checkpoint write failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }

        self.committed = offset;
        self.degraded = degraded;
        if let Err(e) = self.deps.source.commit(self.partition, offset).await {
            warn!(partition = self.partition, offset, error = %e, "Source acknowledgement failed");
        }

        let watermark = self.aggregator.watermark();
        let lag = watermark.map(lag_seconds);
        metrics::counter!("checkpoint.committed").increment(1);
        metrics::gauge!("partition.committed_offset", "partition" => self.partition.to_string())
            .set(offset as f64);
        if let Some(lag) = lag {
            metrics::gauge!("partition.lag_seconds", "partition" => self.partition.to_string())
                .set(lag);
        }
        let entities = self.aggregator.entity_count();
        metrics::gauge!("partition.entities", "partition" => self.partition.to_string())
            .set(entities as f64);

        let stats = self.aggregator.stats().clone();
        let degraded_windows = self.degraded.len();
        let dead_letters = self.deps.dead_letters.total_routed();
        self.deps.status.update(self.partition, |s| {
            s.committed_offset = offset;
            s.last_committed_at = Some(checkpoint.committed_at);
            s.last_event_time = watermark;
            s.lag_seconds = lag;
            s.late_drops = stats.late_drops;
            s.duplicates = stats.duplicates;
            s.dead_letters = dead_letters;
            s.degraded_windows = degraded_windows;
            s.entities = entities;
            s.last_error = None;
        });
        Ok(())
    }

    /// Run until cancelled or the partition fails permanently.
    pub async fn run(mut self) {
        info!(partition = self.partition, source = self.deps.source.name(), "Partition worker starting");
        if !self.recover_with_retry().await {
            return;
        }

        while !self.shutdown.is_cancelled() {
            match self.run_cycle().await {
                Ok(report) => {
                    if report.records > 0 {
                        self.recovery_attempts = 0;
                    }
                }
                Err(e) => {
                    if !self.handle_failure(e).await || !self.recover_with_retry().await {
                        return;
                    }
                }
            }
        }
        self.set_state(PartitionState::Idle);
        info!(partition = self.partition, committed_offset = self.committed, "Partition worker stopped");
    }

    /// Record a failed cycle and back off. Returns false when the worker
    /// should stop.
    async fn handle_failure(&mut self, e: ChurnError) -> bool {
        let corruption = matches!(e, ChurnError::StateCorruption { .. });
        if corruption {
            self.recovery_attempts += 1;
        }
        let attempts = self.recovery_attempts;
        let message = e.to_string();
        self.deps.status.update(self.partition, |s| {
            s.state = PartitionState::Failed;
            s.last_error = Some(message);
            s.recovery_attempts = attempts;
        });

        if corruption && attempts > self.config.max_recovery_attempts {
            error!(
                partition = self.partition,
                attempts,
                error = %e,
                "Partition state unrecoverable, partition halted"
            );
            return false;
        }
        error!(partition = self.partition, error = %e, "Partition cycle failed, reloading from checkpoint");

        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(Duration::from_millis(self.config.failure_backoff_ms)) => true,
        }
    }

    async fn recover_with_retry(&mut self) -> bool {
        loop {
            match self.recover().await {
                Ok(()) => return true,
                Err(e) => {
                    if !self.handle_failure(e).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Run cycles until one finds the source drained. Errors are returned
    /// instead of triggering recovery.
    pub async fn run_until_idle(&mut self) -> ChurnResult<Vec<CycleReport>> {
        let mut reports = Vec::new();
        loop {
            let report = self.run_cycle().await?;
            let idle = report.records == 0 && self.transport_errors == 0;
            reports.push(report);
            if idle || self.shutdown.is_cancelled() {
                return Ok(reports);
            }
        }
    }
}

/// Highest offset in a batch. Redelivered records may repeat lower ones.
fn last_offset(records: &[SourceRecord]) -> Option<Offset> {
    records.iter().map(|r| r.offset).max()
}

fn lag_seconds(event_time: DateTime<Utc>) -> f64 {
    ((Utc::now() - event_time).num_milliseconds().max(0) as f64) / 1000.0
}
