//! Run API handlers: start, inspect and operator actions.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::engine::RunSnapshot;
use crate::error::AppResult;
use crate::state::AppState;
use crate::store::DataMap;

/// Request to start a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    pub workflow_id: Uuid,
    #[serde(default)]
    pub input_parameters: DataMap,
}

/// Start a run.
///
/// POST /api/runs
pub async fn start(
    State(state): State<AppState>,
    Json(request): Json<StartRunRequest>,
) -> AppResult<Json<RunSnapshot>> {
    info!(workflow_uid = %request.workflow_id, "Start run requested");
    let snapshot = state
        .runner
        .start_workflow(request.workflow_id, request.input_parameters, None, None)
        .await?;
    Ok(Json(snapshot))
}

/// GET /api/runs/{uid}
pub async fn get(State(state): State<AppState>, Path(uid): Path<Uuid>) -> AppResult<Json<RunSnapshot>> {
    Ok(Json(state.runner.get_current_execution_state(uid).await?))
}

/// POST /api/runs/{uid}/stop
pub async fn stop(State(state): State<AppState>, Path(uid): Path<Uuid>) -> AppResult<Json<RunSnapshot>> {
    Ok(Json(state.runner.stop(uid).await?))
}

/// POST /api/runs/{uid}/pause
pub async fn pause(State(state): State<AppState>, Path(uid): Path<Uuid>) -> AppResult<Json<RunSnapshot>> {
    Ok(Json(state.runner.pause(uid).await?))
}

/// POST /api/runs/{uid}/resume
pub async fn resume(State(state): State<AppState>, Path(uid): Path<Uuid>) -> AppResult<Json<RunSnapshot>> {
    Ok(Json(state.runner.resume(uid).await?))
}
