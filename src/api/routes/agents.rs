//! Connected agent endpoints

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

use crate::api::{
    error::{ApiError, ApiResult},
    state::ApiState,
    types::{
        AgentsResponse, CheckConnectionBody, CheckConnectionResult, PingResponse, VersionsRequest,
        VersionsResponse,
    },
};

/// GET /api/v1/agents
pub async fn list_agents(State(state): State<ApiState>) -> Json<AgentsResponse> {
    let agents = state.registry.connected();
    Json(AgentsResponse {
        count: agents.len(),
        agents,
    })
}

/// POST /api/v1/agents/:id/kick
///
/// Drops the agent's connection; the agent is free to reconnect.
pub async fn kick_agent(
    Path(agent_id): Path<String>,
    State(state): State<ApiState>,
) -> ApiResult<StatusCode> {
    if state.registry.kick(&agent_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!(
            "agent {agent_id} is not connected"
        )))
    }
}

/// POST /api/v1/agents/:id/ping
pub async fn ping_agent(
    Path(agent_id): Path<String>,
    State(state): State<ApiState>,
) -> ApiResult<Json<PingResponse>> {
    let outcome = state.registry.ping(&agent_id).await?;
    Ok(Json(PingResponse {
        agent_id,
        roundtrip_ms: outcome.roundtrip.as_secs_f64() * 1000.0,
        clock_drift_secs: outcome.clock_drift,
    }))
}

/// POST /api/v1/agents/:id/versions
pub async fn software_versions(
    Path(agent_id): Path<String>,
    State(state): State<ApiState>,
    Json(request): Json<VersionsRequest>,
) -> ApiResult<Json<VersionsResponse>> {
    let versions = state
        .checks
        .software_versions(&agent_id, request.softwares)
        .await?;
    Ok(Json(VersionsResponse { versions }))
}

/// POST /api/v1/services/:id/check
pub async fn check_service_connection(
    Path(service_id): Path<String>,
    State(state): State<ApiState>,
    body: Option<Json<CheckConnectionBody>>,
) -> ApiResult<Json<CheckConnectionResult>> {
    let Json(body) = body.unwrap_or_default();
    let stats = state
        .checks
        .check_connection_to_service(&service_id, body.pmm_agent_id.as_deref())
        .await?;
    Ok(Json(CheckConnectionResult { service_id, stats }))
}
