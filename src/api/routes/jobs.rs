//! Job endpoints

use std::time::Duration;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::warn;

use super::prefixed_id;
use crate::api::{
    error::ApiResult,
    state::ApiState,
    types::{EchoJobRequest, JobResponse, JobStatusResponse},
};
use crate::services::jobs::RetryPolicy;
use crate::storage::schema::{Job, JobData};

const JOB_ID_PREFIX: &str = "job_id";

/// POST /api/v1/jobs/echo
///
/// Echo jobs exercise the job pipeline without touching a database.
pub async fn start_echo_job(
    State(state): State<ApiState>,
    Json(request): Json<EchoJobRequest>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    let delay = Duration::from_millis(request.delay_ms);
    let timeout = Duration::from_secs(request.timeout_secs);
    let retry = RetryPolicy {
        retries: request.retries,
        interval: Duration::from_secs(request.retry_interval_secs),
    };

    let mut job = state
        .jobs
        .create_job(
            &request.pmm_agent_id,
            JobData::Echo {
                message: request.message.clone(),
                delay,
            },
            timeout,
            retry,
        )
        .await?;

    if let Err(e) = state
        .jobs
        .start_echo_job(&job.id, &request.pmm_agent_id, timeout, &request.message, delay)
        .await
    {
        job.done = true;
        job.error = e.to_string();
        job.updated_at = chrono::Utc::now();
        if let Err(save) = state.store.save_job(&job).await {
            warn!("failed to record start failure of {}: {save}", job.id);
        }
        return Err(e.into());
    }

    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// GET /api/v1/jobs/:id
pub async fn get_job(
    Path(id): Path<String>,
    State(state): State<ApiState>,
) -> ApiResult<Json<JobResponse>> {
    let id = prefixed_id(JOB_ID_PREFIX, &id);
    let job = state.store.find_job(&id).await?;
    let logs = state.store.job_logs(&id).await?;
    Ok(Json(JobResponse { job, logs }))
}

/// GET /api/v1/jobs/:id/status
///
/// Asks the agent whether the job is still running.
pub async fn job_status(
    Path(id): Path<String>,
    State(state): State<ApiState>,
) -> ApiResult<Json<JobStatusResponse>> {
    let job_id = prefixed_id(JOB_ID_PREFIX, &id);
    let alive = state.jobs.job_status(&job_id).await?;
    Ok(Json(JobStatusResponse { job_id, alive }))
}

/// POST /api/v1/jobs/:id/stop
pub async fn stop_job(
    Path(id): Path<String>,
    State(state): State<ApiState>,
) -> ApiResult<StatusCode> {
    let id = prefixed_id(JOB_ID_PREFIX, &id);
    state.jobs.stop_job(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
