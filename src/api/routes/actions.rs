//! Action endpoints
//!
//! Action ids look like `/action_id/<uuid>`; paths take the bare uuid.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

use super::prefixed_id;
use crate::api::{error::ApiResult, state::ApiState};
use crate::services::RunAction;
use crate::storage::schema::ActionResult;

const ACTION_ID_PREFIX: &str = "action_id";

/// POST /api/v1/actions
///
/// Starts the action and returns its pending result record.
pub async fn run_action(
    State(state): State<ApiState>,
    Json(run): Json<RunAction>,
) -> ApiResult<(StatusCode, Json<ActionResult>)> {
    let result = state.actions.run_action(run).await?;
    Ok((StatusCode::ACCEPTED, Json(result)))
}

/// GET /api/v1/actions/:id
pub async fn get_action(
    Path(id): Path<String>,
    State(state): State<ApiState>,
) -> ApiResult<Json<ActionResult>> {
    let id = prefixed_id(ACTION_ID_PREFIX, &id);
    Ok(Json(state.actions.action_result(&id).await?))
}

/// POST /api/v1/actions/:id/cancel
pub async fn cancel_action(
    Path(id): Path<String>,
    State(state): State<ApiState>,
) -> ApiResult<StatusCode> {
    let id = prefixed_id(ACTION_ID_PREFIX, &id);
    state.actions.cancel_action(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
