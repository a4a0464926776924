//! Ops HTTP server and Prometheus exporter.

use crate::rest::{self, AppState};
use axum::routing::get;
use axum::Router;
use churn_agents::StatusRegistry;
use churn_core::config::AppConfig;
use churn_core::dead_letter::DeadLetterQueue;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct ApiServer {
    config: AppConfig,
    status: Arc<StatusRegistry>,
    dead_letters: Arc<DeadLetterQueue>,
}

impl ApiServer {
    pub fn new(
        config: AppConfig,
        status: Arc<StatusRegistry>,
        dead_letters: Arc<DeadLetterQueue>,
    ) -> Self {
        Self {
            config,
            status,
            dead_letters,
        }
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            status: self.status.clone(),
            dead_letters: self.dead_letters.clone(),
            node_id: self.config.node_id.clone(),
            start_time: Instant::now(),
        };

        Router::new()
            .route("/health", get(rest::health_check))
            .route("/ready", get(rest::readiness))
            .route("/live", get(rest::liveness))
            .route("/v1/partitions", get(rest::list_partitions))
            .route("/v1/partitions/:id", get(rest::get_partition))
            .route("/v1/dead-letters", get(rest::list_dead_letters))
            .layer(CompressionLayer::new())
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn start_http(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);
        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }

    /// Install the Prometheus recorder with its own HTTP listener.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
