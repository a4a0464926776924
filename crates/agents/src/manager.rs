//! Partition manager: spawns and supervises one worker per assigned partition.

use crate::processor::WindowProcessor;
use crate::status::StatusRegistry;
use crate::worker::PartitionWorker;
use churn_analytics::PredictionWriter;
use churn_core::config::AppConfig;
use churn_core::dead_letter::DeadLetterSink;
use churn_core::sink::{CheckpointStore, FeatureStore};
use churn_core::source::EventSource;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shared collaborators handed to every partition worker.
#[derive(Clone)]
pub struct PipelineDeps {
    pub source: Arc<dyn EventSource>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub writer: Arc<PredictionWriter>,
    pub processor: Arc<WindowProcessor>,
    /// Warehouse feature table for cold-start seeding.
    pub features: Option<Arc<dyn FeatureStore>>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub status: Arc<StatusRegistry>,
}

pub struct PartitionManager {
    config: AppConfig,
    deps: PipelineDeps,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl PartitionManager {
    pub fn new(config: AppConfig, deps: PipelineDeps) -> Self {
        Self {
            config,
            deps,
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn status(&self) -> Arc<StatusRegistry> {
        self.deps.status.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn a worker for every partition assigned to this node.
    pub fn start(&mut self) {
        let partitions = self.config.assigned_partitions();
        for &partition in &partitions {
            let worker = PartitionWorker::new(
                partition,
                &self.config.aggregator,
                self.config.orchestrator.clone(),
                self.deps.clone(),
                self.shutdown.child_token(),
            );
            self.handles.push(tokio::spawn(worker.run()));
            info!(partition, node = %self.config.node_id, "Partition worker spawned");
        }
        info!(
            count = partitions.len(),
            node = %self.config.node_id,
            source = self.deps.source.name(),
            "All partition workers started"
        );
    }

    /// Stop every worker after its current cycle and wait for them.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        self.wait().await;
    }

    /// Wait for all workers to exit.
    pub async fn wait(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Partition worker panicked");
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }
}
