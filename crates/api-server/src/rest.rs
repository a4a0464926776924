//! REST handlers for operational endpoints and partition status.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use churn_agents::{PartitionStatus, StatusRegistry};
use churn_core::dead_letter::{DeadLetterQueue, DeadLetterRecord, DeadLetterSink};
use churn_core::types::PartitionId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Upper bound on dead letters returned by one request.
const MAX_DEAD_LETTERS: usize = 500;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub status: Arc<StatusRegistry>,
    pub dead_letters: Arc<DeadLetterQueue>,
    pub node_id: String,
    pub start_time: Instant,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let partitions = state.status.all();
    let failed = partitions
        .iter()
        .filter(|p| p.state == churn_agents::PartitionState::Failed)
        .count();
    Json(HealthResponse {
        status: if failed == 0 { "healthy" } else { "degraded" }.to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        partitions: partitions.len(),
        failed_partitions: failed,
    })
}

/// GET /ready: 503 while any partition is FAILED or none are registered yet.
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.status.is_empty() || state.status.any_failed() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

/// GET /live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// GET /v1/partitions
pub async fn list_partitions(State(state): State<AppState>) -> Json<PartitionsResponse> {
    Json(PartitionsResponse {
        node_id: state.node_id.clone(),
        partitions: state.status.all(),
    })
}

/// GET /v1/partitions/:id
pub async fn get_partition(
    State(state): State<AppState>,
    Path(partition): Path<PartitionId>,
) -> Result<Json<PartitionStatus>, ErrorResponse> {
    state.status.get(partition).map(Json).ok_or_else(|| ErrorResponse {
        error: "partition_not_found".to_string(),
        message: format!("partition {partition} is not assigned to this node"),
    })
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

/// GET /v1/dead-letters?limit=N: oldest quarantined records, not removed.
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> Json<DeadLettersResponse> {
    let limit = query.limit.unwrap_or(50).min(MAX_DEAD_LETTERS);
    Json(DeadLettersResponse {
        depth: state.dead_letters.depth(),
        total_routed: state.dead_letters.total_routed(),
        records: state.dead_letters.peek(limit),
    })
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> axum::response::Response {
        (StatusCode::NOT_FOUND, Json(self)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub partitions: usize,
    pub failed_partitions: usize,
}

#[derive(Debug, Serialize)]
pub struct PartitionsResponse {
    pub node_id: String,
    pub partitions: Vec<PartitionStatus>,
}

#[derive(Debug, Serialize)]
pub struct DeadLettersResponse {
    pub depth: usize,
    pub total_routed: u64,
    pub records: Vec<DeadLetterRecord>,
}
