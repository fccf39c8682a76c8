//! Prometheus exposition endpoint

use axum::{extract::State, http::header, response::IntoResponse};

use crate::api::{
    error::{ApiError, ApiResult},
    state::ApiState,
};

/// GET /metrics
pub async fn metrics(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let body = state
        .registry
        .metrics()
        .encode_text()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}
