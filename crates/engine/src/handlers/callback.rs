//! Function result ingress.
//!
//! Functions invoked in push mode report back over HTTP. Results are not
//! processed inline; they are republished on the result channel so that
//! they take the same path as executor results.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::dispatch::{CallbackBody, StepResult};
use crate::error::AppResult;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    pub attempt: Option<i32>,
}

/// Accept a complete step result.
///
/// POST /api/callback
pub async fn accept_result(
    State(state): State<AppState>,
    Json(result): Json<StepResult>,
) -> AppResult<StatusCode> {
    debug!(
        step_instance_uid = %result.step_instance_id,
        status = %result.run_status,
        "Callback result received"
    );
    state.gateway().publish_result(&result).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Accept a result posted to the callback URL handed to a pushed function.
///
/// POST /api/callback/{workflow_instance_uid}/{step_instance_uid}?attempt=N
pub async fn accept_step_callback(
    State(state): State<AppState>,
    Path((workflow_instance_uid, step_instance_uid)): Path<(Uuid, Uuid)>,
    Query(query): Query<CallbackQuery>,
    Json(body): Json<CallbackBody>,
) -> AppResult<StatusCode> {
    let result = into_result(workflow_instance_uid, step_instance_uid, query.attempt, body);
    debug!(
        step_instance_uid = %step_instance_uid,
        status = %result.run_status,
        attempt = ?result.attempt,
        "Step callback received"
    );
    state.gateway().publish_result(&result).await?;
    Ok(StatusCode::ACCEPTED)
}

fn into_result(
    workflow_instance_uid: Uuid,
    step_instance_uid: Uuid,
    attempt: Option<i32>,
    body: CallbackBody,
) -> StepResult {
    StepResult {
        step_instance_id: step_instance_uid,
        workflow_instance_id: workflow_instance_uid,
        run_status: body.run_status,
        failure_reason: body.failure_reason,
        call_back_url: None,
        input_data: body.input_data,
        output_data: body.output_data,
        attempt,
    }
}
