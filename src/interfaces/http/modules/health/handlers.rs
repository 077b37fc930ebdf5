//! Health check endpoint

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::domain::ids::NodeId;
use crate::interfaces::http::AdminState;

/// Service health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub node_id: NodeId,
    pub uptime_seconds: u64,
    pub connections: usize,
    pub pending_requests: usize,
}

/// `GET /health`
pub async fn health_check(State(state): State<AdminState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node_id: state.router.local_id().clone(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        connections: state.router.connections().len(),
        pending_requests: state.router.pending_count(),
    })
}
