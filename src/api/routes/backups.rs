//! Backup and restore endpoints

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

use super::prefixed_id;
use crate::api::{
    error::ApiResult,
    state::ApiState,
    types::{BackupStarted, RestoreStarted},
};
use crate::services::{BackupParams, RestoreParams};
use crate::storage::schema::{Artifact, RestoreHistoryItem};

/// POST /api/v1/backups
pub async fn start_backup(
    State(state): State<ApiState>,
    Json(params): Json<BackupParams>,
) -> ApiResult<(StatusCode, Json<BackupStarted>)> {
    let artifact_id = state.backups.perform_backup(params).await?;
    Ok((StatusCode::ACCEPTED, Json(BackupStarted { artifact_id })))
}

/// GET /api/v1/artifacts/:id
pub async fn get_artifact(
    Path(id): Path<String>,
    State(state): State<ApiState>,
) -> ApiResult<Json<Artifact>> {
    let id = prefixed_id("artifact_id", &id);
    Ok(Json(state.store.find_artifact(&id).await?))
}

/// POST /api/v1/restores
pub async fn start_restore(
    State(state): State<ApiState>,
    Json(params): Json<RestoreParams>,
) -> ApiResult<(StatusCode, Json<RestoreStarted>)> {
    let restore_id = state.backups.restore_backup(params).await?;
    Ok((StatusCode::ACCEPTED, Json(RestoreStarted { restore_id })))
}

/// GET /api/v1/restores/:id
pub async fn get_restore(
    Path(id): Path<String>,
    State(state): State<ApiState>,
) -> ApiResult<Json<RestoreHistoryItem>> {
    let id = prefixed_id("restore_id", &id);
    Ok(Json(state.store.find_restore_item(&id).await?))
}
