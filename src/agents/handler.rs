//! Per-agent request dispatch and outbound commands.
//!
//! [`Handler`] answers every request an agent initiates and is the only
//! place that issues typed commands to agents. Each command runs through the
//! agent's channel with a deadline: the protocol timeout carried in the
//! request plus [`COMMAND_GRACE`], or the configured command deadline when
//! the request has none.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, instrument, trace, warn};

use super::channel::{AgentRequest, ServerResponse};
use super::proto::{
    ActionParams, ActionResultRequest, ActionResultResponse, AgentRequestPayload,
    AgentResponsePayload, CheckConnectionRequest, CheckConnectionResponse, Code, CollectResponse,
    GetVersionsRequest, GetVersionsResponse, JobOutcome, JobProgressRequest, JobProgressResponse,
    JobResultRequest, JobResultResponse, JobSpec, JobStatusRequest, JobStatusResponse,
    PongResponse, ServerRequestPayload, Software, StartActionRequest, StartActionResponse,
    StartJobRequest, StartJobResponse, StateChangedRequest, StateChangedResponse, Status,
    StopActionRequest, StopActionResponse, StopJobRequest, StopJobResponse,
};
use super::registry::{AgentConnection, Registry, RequestHandler};
use super::state;
use crate::error::{Error, Result};
use crate::events::{EventBus, HubEvent, TelemetryCollector};
use crate::storage::Store;
use crate::storage::schema::{
    ActionResult, AgentStatus, AgentType, BackupStatus, JobData, JobLog, RestoreStatus,
};

/// Added to a request's own timeout so the agent can report it expired.
pub const COMMAND_GRACE: Duration = Duration::from_secs(5);

/// State pushes slower than this are logged.
const SLOW_STATE_PUSH: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct HandlerSettings {
    /// Deadline for one state push.
    pub state_change_timeout: Duration,

    /// Deadline for commands that carry no timeout of their own.
    pub command_deadline: Duration,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            state_change_timeout: Duration::from_secs(5),
            command_deadline: Duration::from_secs(30),
        }
    }
}

macro_rules! expect_response {
    ($response:expr, $variant:ident, $expected:literal) => {
        match $response {
            AgentResponsePayload::$variant(response) => Ok(response),
            other => Err(Error::UnexpectedResponse {
                expected: $expected,
                got: other.kind(),
            }),
        }
    };
}

pub struct Handler {
    registry: Arc<Registry>,
    store: Store,
    collector: Arc<dyn TelemetryCollector>,
    events: EventBus,
    settings: HandlerSettings,
}

impl Handler {
    pub fn new(
        registry: Arc<Registry>,
        store: Store,
        collector: Arc<dyn TelemetryCollector>,
        events: EventBus,
        settings: HandlerSettings,
    ) -> Self {
        Self {
            registry,
            store,
            collector,
            events,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn settings(&self) -> HandlerSettings {
        self.settings
    }

    /// Mark every agent supervised by a disconnected agent as unknown.
    ///
    /// Run once at startup, before agents reconnect.
    pub async fn set_all_agents_status_unknown(&self) -> Result<()> {
        for agent in self.store.list_agents().await? {
            let connected = self.registry.is_connected(&agent.agent_id);
            if agent.agent_type != AgentType::PmmAgent || connected {
                continue;
            }
            for child in self.store.find_child_agents(&agent.agent_id).await? {
                self.store
                    .update_agent_status(&child.agent_id, AgentStatus::Unknown, None)
                    .await?;
            }
        }
        Ok(())
    }

    // ---- inbound ----

    async fn state_changed(&self, request: &StateChangedRequest) -> Result<()> {
        let listen_port = (request.listen_port != 0).then_some(request.listen_port);
        let agent = self
            .store
            .update_agent_status(&request.agent_id, request.status, listen_port)
            .await?;

        self.events.publish(HubEvent::AgentStatus {
            agent_id: agent.agent_id.clone(),
            pmm_agent_id: agent.pmm_agent_id.clone(),
            status: request.status,
            timestamp: Utc::now(),
        });

        if let Some(pmm_agent_id) = &agent.pmm_agent_id {
            self.registry.request_state_update(pmm_agent_id);
        }
        Ok(())
    }

    async fn record_action_result(
        &self,
        agent_id: &str,
        request: &ActionResultRequest,
    ) -> Result<()> {
        let now = Utc::now();
        let created_at = match self.store.find_action_result(&request.action_id).await {
            Ok(existing) => existing.created_at,
            Err(e) if e.is_not_found() => now,
            Err(e) => return Err(e.into()),
        };

        self.store
            .record_action_result(&ActionResult {
                id: request.action_id.clone(),
                pmm_agent_id: agent_id.to_string(),
                done: request.done,
                error: request.error.clone(),
                output: request.output.clone(),
                created_at,
                updated_at: now,
            })
            .await?;
        Ok(())
    }

    /// Persist a job's final outcome.
    ///
    /// A failed job marks its artifact or restore as failed and publishes
    /// [`HubEvent::JobFailed`] so the jobs service can retry it.
    async fn record_job_result(&self, request: &JobResultRequest) -> Result<()> {
        let mut job = self.store.find_job(&request.job_id).await?;
        let job_type = job.job_type();
        let mismatch = |kind: &str| {
            Error::InvalidArgument(format!(
                "result type {kind} doesn't match job type {job_type}"
            ))
        };

        let mut failure = None;
        match (&request.result, &job.data) {
            (JobOutcome::Error { message }, _) => {
                if let Err(e) = self.mark_job_data_failed(&job.data).await {
                    error!(job = %job.id, "failed to handle job error: {e}");
                }
                failure = Some(message.clone());
            }
            (JobOutcome::Echo { message }, JobData::Echo { .. }) => {
                job.output = Some(message.clone());
            }
            (JobOutcome::MysqlBackup, JobData::MysqlBackup { artifact_id, .. })
            | (JobOutcome::MongodbBackup, JobData::MongodbBackup { artifact_id, .. }) => {
                self.store
                    .update_artifact_status(artifact_id, BackupStatus::Success)
                    .await?;
            }
            (JobOutcome::MysqlRestoreBackup, JobData::MysqlRestoreBackup { restore_id, .. })
            | (
                JobOutcome::MongodbRestoreBackup,
                JobData::MongodbRestoreBackup { restore_id, .. },
            ) => {
                self.store
                    .update_restore_status(restore_id, RestoreStatus::Success)
                    .await?;
            }
            (JobOutcome::Echo { .. }, _) => return Err(mismatch("echo")),
            (JobOutcome::MysqlBackup, _) => return Err(mismatch("mysql_backup")),
            (JobOutcome::MongodbBackup, _) => return Err(mismatch("mongodb_backup")),
            (JobOutcome::MysqlRestoreBackup, _) => return Err(mismatch("mysql_restore_backup")),
            (JobOutcome::MongodbRestoreBackup, _) => {
                return Err(mismatch("mongodb_restore_backup"));
            }
        }

        job.done = true;
        job.updated_at = Utc::now();
        if let Some(message) = &failure {
            job.error = message.clone();
        }
        self.store.save_job(&job).await?;

        if let Some(message) = failure {
            self.events.publish(HubEvent::JobFailed {
                job_id: job.id,
                message,
                timestamp: request.timestamp,
            });
        }
        Ok(())
    }

    async fn mark_job_data_failed(&self, data: &JobData) -> Result<()> {
        match data {
            JobData::Echo { .. } => {}
            JobData::MysqlBackup { artifact_id, .. }
            | JobData::MongodbBackup { artifact_id, .. } => {
                self.store
                    .update_artifact_status(artifact_id, BackupStatus::Error)
                    .await?;
            }
            JobData::MysqlRestoreBackup { restore_id, .. }
            | JobData::MongodbRestoreBackup { restore_id, .. } => {
                self.store
                    .update_restore_status(restore_id, RestoreStatus::Error)
                    .await?;
            }
        }
        Ok(())
    }

    async fn record_job_progress(&self, request: &JobProgressRequest) -> Result<()> {
        self.store
            .append_job_log(&JobLog {
                job_id: request.job_id.clone(),
                chunk_id: request.chunk_id,
                data: request.data.clone(),
                last_chunk: request.done,
            })
            .await?;
        Ok(())
    }

    // ---- outbound ----

    async fn call(
        &self,
        agent_id: &str,
        payload: impl Into<ServerRequestPayload>,
        timeout: Option<Duration>,
    ) -> Result<AgentResponsePayload> {
        let conn = self.registry.get(agent_id)?;
        let deadline = timeout.map_or(self.settings.command_deadline, |t| t + COMMAND_GRACE);
        Ok(conn
            .channel()
            .send_and_wait_response_timeout(payload, deadline)
            .await?)
    }

    #[instrument(skip(self, params))]
    pub async fn start_action(
        &self,
        agent_id: &str,
        action_id: &str,
        params: ActionParams,
        timeout: Option<Duration>,
    ) -> Result<StartActionResponse> {
        let request = StartActionRequest {
            action_id: action_id.to_string(),
            timeout,
            params,
        };
        let response = self.call(agent_id, request, timeout).await?;
        expect_response!(response, StartAction, "start_action")
    }

    #[instrument(skip(self))]
    pub async fn stop_action(&self, agent_id: &str, action_id: &str) -> Result<StopActionResponse> {
        let request = StopActionRequest {
            action_id: action_id.to_string(),
        };
        let response = self.call(agent_id, request, None).await?;
        expect_response!(response, StopAction, "stop_action")
    }

    #[instrument(skip(self, job))]
    pub async fn start_job(
        &self,
        agent_id: &str,
        job_id: &str,
        job: JobSpec,
        timeout: Option<Duration>,
    ) -> Result<StartJobResponse> {
        let request = StartJobRequest {
            job_id: job_id.to_string(),
            timeout,
            job,
        };
        // the timeout bounds the job's run time, not the start acknowledgement
        let response = self.call(agent_id, request, None).await?;
        expect_response!(response, StartJob, "start_job")
    }

    #[instrument(skip(self))]
    pub async fn stop_job(&self, agent_id: &str, job_id: &str) -> Result<StopJobResponse> {
        let request = StopJobRequest {
            job_id: job_id.to_string(),
        };
        let response = self.call(agent_id, request, None).await?;
        expect_response!(response, StopJob, "stop_job")
    }

    #[instrument(skip(self))]
    pub async fn job_status(&self, agent_id: &str, job_id: &str) -> Result<JobStatusResponse> {
        let request = JobStatusRequest {
            job_id: job_id.to_string(),
        };
        let response = self.call(agent_id, request, None).await?;
        expect_response!(response, JobStatus, "job_status")
    }

    #[instrument(skip(self, request), fields(service_type = %request.service_type))]
    pub async fn check_connection(
        &self,
        agent_id: &str,
        request: CheckConnectionRequest,
    ) -> Result<CheckConnectionResponse> {
        let timeout = request.timeout;
        let response = self.call(agent_id, request, timeout).await?;
        expect_response!(response, CheckConnection, "check_connection")
    }

    #[instrument(skip(self))]
    pub async fn get_versions(
        &self,
        agent_id: &str,
        softwares: Vec<Software>,
    ) -> Result<GetVersionsResponse> {
        let response = self
            .call(agent_id, GetVersionsRequest { softwares }, None)
            .await?;
        expect_response!(response, GetVersions, "get_versions")
    }
}

#[async_trait]
impl RequestHandler for Handler {
    async fn handle_request(&self, conn: &AgentConnection, request: AgentRequest) {
        let AgentRequest { id, payload } = request;
        trace!(agent = %conn.id(), id, "request {payload:?}");

        let response = match payload {
            AgentRequestPayload::Ping(_) => ServerResponse::new(
                id,
                PongResponse {
                    current_time: Utc::now(),
                },
            ),

            AgentRequestPayload::StateChanged(request) => {
                if let Err(e) = self.state_changed(&request).await {
                    error!(
                        agent = %conn.id(),
                        "failed to record state of {}: {e}", request.agent_id
                    );
                }
                ServerResponse::new(id, StateChangedResponse {})
            }

            AgentRequestPayload::Collect(request) => {
                if let Err(e) = self.collector.collect(conn.id(), request.buckets).await {
                    error!(agent = %conn.id(), "failed to collect telemetry: {e:#}");
                }
                ServerResponse::new(id, CollectResponse {})
            }

            AgentRequestPayload::ActionResult(request) => {
                if let Err(e) = self.record_action_result(conn.id(), &request).await {
                    warn!(agent = %conn.id(), "failed to change action {}: {e}", request.action_id);
                }
                if !request.done && !request.error.is_empty() {
                    warn!(
                        agent = %conn.id(),
                        "action {} failed: {}", request.action_id, request.error
                    );
                }
                ServerResponse::new(id, ActionResultResponse {})
            }

            AgentRequestPayload::JobResult(request) => {
                if let Err(e) = self.record_job_result(&request).await {
                    error!(
                        agent = %conn.id(),
                        "failed to save result of job {}: {e}", request.job_id
                    );
                }
                ServerResponse::new(id, JobResultResponse {})
            }

            AgentRequestPayload::JobProgress(request) => {
                if let Err(e) = self.record_job_progress(&request).await {
                    warn!(
                        agent = %conn.id(),
                        "failed to save output of job {}: {e}", request.job_id
                    );
                }
                ServerResponse::new(id, JobProgressResponse {})
            }

            AgentRequestPayload::Unknown => {
                warn!(agent = %conn.id(), id, "unsupported request");
                ServerResponse::with_status(
                    id,
                    Status::new(Code::Unimplemented, "unsupported request"),
                )
            }
        };

        conn.channel().send(response).await;
    }

    async fn push_state(&self, conn: &AgentConnection) -> Result<()> {
        let desired = state::desired_state(&self.store, conn.id()).await?;
        debug!(agent = %conn.id(), "pushing state {:?}", state::redacted(&desired));

        let start = Instant::now();
        let response = conn
            .channel()
            .send_and_wait_response_timeout(desired, self.settings.state_change_timeout)
            .await?;
        expect_response!(response, SetState, "set_state")?;

        let elapsed = start.elapsed();
        if elapsed > SLOW_STATE_PUSH {
            warn!(agent = %conn.id(), "state push took {elapsed:?}");
        }
        Ok(())
    }
}
