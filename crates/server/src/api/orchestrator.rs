//! Orchestrator API handlers.

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crawlforge_core::scheduler::PoolStatus;
use crawlforge_core::OrchestratorStatus;

use crate::state::AppState;

/// Orchestrator status response
#[derive(Debug, Serialize)]
pub struct OrchestratorStatusResponse {
    /// Whether the orchestrator is available (a worker endpoint is configured)
    pub available: bool,
    /// Job/chunk counts and resource readings, when available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<OrchestratorStatus>,
    /// Local worker pool state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStatus>,
}

/// Get orchestrator status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<OrchestratorStatusResponse> {
    let status = state.orchestrator().map(|orch| orch.status());
    Json(OrchestratorStatusResponse {
        available: status.is_some(),
        status,
        pool: state.pool_status(),
    })
}
