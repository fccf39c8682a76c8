//! Wire types exchanged between the hub and its agents.
//!
//! Every frame is an envelope carrying a request id, a status and an
//! optional payload. Payloads are internally tagged by `type`; a tag this
//! build does not know decodes to `Unknown` instead of failing the frame.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ServerMetrics;
use crate::storage::schema::{AgentStatus, AgentType, ServiceType};

pub type RequestId = u32;

/// Status codes shared by both directions of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    #[default]
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    FailedPrecondition,
    Aborted,
    Unimplemented,
    Internal,
    Unavailable,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "ok",
            Code::Cancelled => "cancelled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid_argument",
            Code::DeadlineExceeded => "deadline_exceeded",
            Code::NotFound => "not_found",
            Code::AlreadyExists => "already_exists",
            Code::PermissionDenied => "permission_denied",
            Code::FailedPrecondition => "failed_precondition",
            Code::Aborted => "aborted",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Status {
    #[serde(default)]
    pub code: Code,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code.as_str())
        } else {
            write!(f, "{}: {}", self.code.as_str(), self.message)
        }
    }
}

/// Envelope sent by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: RequestId,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub payload: Option<AgentPayload>,
}

/// Envelope sent by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub id: RequestId,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub payload: Option<ServerPayload>,
}

/// Metadata the hub hands to an agent right after accepting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConnectMetadata {
    pub agent_runs_on_node_id: String,
    pub server_version: String,
}

/// Metadata an agent presents when connecting.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AgentConnectMetadata {
    pub id: String,
    pub version: String,
}

/// Everything the hub writes to an agent stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerFrame {
    Handshake(ServerConnectMetadata),
    Message(ServerMessage),
}

/// Payloads an agent may put on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentPayload {
    // requests
    Ping(PingRequest),
    StateChanged(StateChangedRequest),
    Collect(CollectRequest),
    ActionResult(ActionResultRequest),
    JobResult(JobResultRequest),
    JobProgress(JobProgressRequest),

    // responses
    Pong(PongResponse),
    SetState(SetStateResponse),
    StartAction(StartActionResponse),
    StopAction(StopActionResponse),
    StartJob(StartJobResponse),
    StopJob(StopJobResponse),
    JobStatus(JobStatusResponse),
    CheckConnection(CheckConnectionResponse),
    GetVersions(GetVersionsResponse),

    #[serde(other)]
    Unknown,
}

/// Payloads the hub may put on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerPayload {
    // responses
    Pong(PongResponse),
    StateChanged(StateChangedResponse),
    Collect(CollectResponse),
    ActionResult(ActionResultResponse),
    JobResult(JobResultResponse),
    JobProgress(JobProgressResponse),

    // requests
    Ping(PingRequest),
    SetState(SetStateRequest),
    StartAction(StartActionRequest),
    StopAction(StopActionRequest),
    StartJob(StartJobRequest),
    StopJob(StopJobRequest),
    JobStatus(JobStatusRequest),
    CheckConnection(CheckConnectionRequest),
    GetVersions(GetVersionsRequest),

    #[serde(other)]
    Unknown,
}

/// Requests initiated by an agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentRequestPayload {
    Ping(PingRequest),
    StateChanged(StateChangedRequest),
    Collect(CollectRequest),
    ActionResult(ActionResultRequest),
    JobResult(JobResultRequest),
    JobProgress(JobProgressRequest),
    /// A tag this build does not understand.
    Unknown,
}

/// Agent answers to hub requests.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentResponsePayload {
    Pong(PongResponse),
    SetState(SetStateResponse),
    StartAction(StartActionResponse),
    StopAction(StopActionResponse),
    StartJob(StartJobResponse),
    StopJob(StopJobResponse),
    JobStatus(JobStatusResponse),
    CheckConnection(CheckConnectionResponse),
    GetVersions(GetVersionsResponse),
}

impl AgentResponsePayload {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentResponsePayload::Pong(_) => "pong",
            AgentResponsePayload::SetState(_) => "set_state",
            AgentResponsePayload::StartAction(_) => "start_action",
            AgentResponsePayload::StopAction(_) => "stop_action",
            AgentResponsePayload::StartJob(_) => "start_job",
            AgentResponsePayload::StopJob(_) => "stop_job",
            AgentResponsePayload::JobStatus(_) => "job_status",
            AgentResponsePayload::CheckConnection(_) => "check_connection",
            AgentResponsePayload::GetVersions(_) => "get_versions",
        }
    }
}

/// Requests initiated by the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerRequestPayload {
    Ping(PingRequest),
    SetState(SetStateRequest),
    StartAction(StartActionRequest),
    StopAction(StopActionRequest),
    StartJob(StartJobRequest),
    StopJob(StopJobRequest),
    JobStatus(JobStatusRequest),
    CheckConnection(CheckConnectionRequest),
    GetVersions(GetVersionsRequest),
}

/// Hub answers to agent requests.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerResponsePayload {
    Pong(PongResponse),
    StateChanged(StateChangedResponse),
    Collect(CollectResponse),
    ActionResult(ActionResultResponse),
    JobResult(JobResultResponse),
    JobProgress(JobProgressResponse),
}

/// Routing decision for an inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Request(AgentRequestPayload),
    Response(AgentResponsePayload),
}

impl AgentPayload {
    pub fn classify(self) -> Inbound {
        use AgentPayload as P;
        match self {
            P::Ping(p) => Inbound::Request(AgentRequestPayload::Ping(p)),
            P::StateChanged(p) => Inbound::Request(AgentRequestPayload::StateChanged(p)),
            P::Collect(p) => Inbound::Request(AgentRequestPayload::Collect(p)),
            P::ActionResult(p) => Inbound::Request(AgentRequestPayload::ActionResult(p)),
            P::JobResult(p) => Inbound::Request(AgentRequestPayload::JobResult(p)),
            P::JobProgress(p) => Inbound::Request(AgentRequestPayload::JobProgress(p)),
            P::Unknown => Inbound::Request(AgentRequestPayload::Unknown),

            P::Pong(p) => Inbound::Response(AgentResponsePayload::Pong(p)),
            P::SetState(p) => Inbound::Response(AgentResponsePayload::SetState(p)),
            P::StartAction(p) => Inbound::Response(AgentResponsePayload::StartAction(p)),
            P::StopAction(p) => Inbound::Response(AgentResponsePayload::StopAction(p)),
            P::StartJob(p) => Inbound::Response(AgentResponsePayload::StartJob(p)),
            P::StopJob(p) => Inbound::Response(AgentResponsePayload::StopJob(p)),
            P::JobStatus(p) => Inbound::Response(AgentResponsePayload::JobStatus(p)),
            P::CheckConnection(p) => Inbound::Response(AgentResponsePayload::CheckConnection(p)),
            P::GetVersions(p) => Inbound::Response(AgentResponsePayload::GetVersions(p)),
        }
    }
}

impl From<ServerRequestPayload> for ServerPayload {
    fn from(payload: ServerRequestPayload) -> Self {
        use ServerRequestPayload as R;
        match payload {
            R::Ping(p) => ServerPayload::Ping(p),
            R::SetState(p) => ServerPayload::SetState(p),
            R::StartAction(p) => ServerPayload::StartAction(p),
            R::StopAction(p) => ServerPayload::StopAction(p),
            R::StartJob(p) => ServerPayload::StartJob(p),
            R::StopJob(p) => ServerPayload::StopJob(p),
            R::JobStatus(p) => ServerPayload::JobStatus(p),
            R::CheckConnection(p) => ServerPayload::CheckConnection(p),
            R::GetVersions(p) => ServerPayload::GetVersions(p),
        }
    }
}

impl From<ServerResponsePayload> for ServerPayload {
    fn from(payload: ServerResponsePayload) -> Self {
        use ServerResponsePayload as R;
        match payload {
            R::Pong(p) => ServerPayload::Pong(p),
            R::StateChanged(p) => ServerPayload::StateChanged(p),
            R::Collect(p) => ServerPayload::Collect(p),
            R::ActionResult(p) => ServerPayload::ActionResult(p),
            R::JobResult(p) => ServerPayload::JobResult(p),
            R::JobProgress(p) => ServerPayload::JobProgress(p),
        }
    }
}

macro_rules! into_payload {
    ($target:ident { $($variant:ident($ty:ty)),* $(,)? }) => {
        $(
            impl From<$ty> for $target {
                fn from(payload: $ty) -> Self {
                    $target::$variant(payload)
                }
            }
        )*
    };
}

into_payload!(ServerRequestPayload {
    Ping(PingRequest),
    SetState(SetStateRequest),
    StartAction(StartActionRequest),
    StopAction(StopActionRequest),
    StartJob(StartJobRequest),
    StopJob(StopJobRequest),
    JobStatus(JobStatusRequest),
    CheckConnection(CheckConnectionRequest),
    GetVersions(GetVersionsRequest),
});

into_payload!(ServerResponsePayload {
    Pong(PongResponse),
    StateChanged(StateChangedResponse),
    Collect(CollectResponse),
    ActionResult(ActionResultResponse),
    JobResult(JobResultResponse),
    JobProgress(JobProgressResponse),
});

into_payload!(AgentPayload {
    Ping(PingRequest),
    StateChanged(StateChangedRequest),
    Collect(CollectRequest),
    ActionResult(ActionResultRequest),
    JobResult(JobResultRequest),
    JobProgress(JobProgressRequest),
    Pong(PongResponse),
    SetState(SetStateResponse),
    StartAction(StartActionResponse),
    StopAction(StopActionResponse),
    StartJob(StartJobResponse),
    StopJob(StopJobResponse),
    JobStatus(JobStatusResponse),
    CheckConnection(CheckConnectionResponse),
    GetVersions(GetVersionsResponse),
});

// ---- heartbeat ----

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PingRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongResponse {
    pub current_time: DateTime<Utc>,
}

// ---- agent state ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangedRequest {
    pub agent_id: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub listen_port: u16,
    #[serde(default)]
    pub process_exec_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateChangedResponse {}

/// An exporter process the agent supervises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProcess {
    pub kind: AgentType,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub text_files: BTreeMap<String, String>,
    #[serde(default)]
    pub redact_words: Vec<String>,
}

/// A collector running inside the agent process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltinAgent {
    pub kind: AgentType,
    pub dsn: String,
    #[serde(default)]
    pub text_files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SetStateRequest {
    #[serde(default)]
    pub agent_processes: BTreeMap<String, AgentProcess>,
    #[serde(default)]
    pub builtin_agents: BTreeMap<String, BuiltinAgent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SetStateResponse {}

// ---- telemetry ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryBucket {
    pub agent_id: String,
    pub collected_at: DateTime<Utc>,
    pub metrics: ServerMetrics,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CollectRequest {
    #[serde(default)]
    pub buckets: Vec<TelemetryBucket>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CollectResponse {}

// ---- actions ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionParams {
    ProcessSummary {
        #[serde(default)]
        args: Vec<String>,
    },
    MysqlSummary {
        #[serde(default)]
        args: Vec<String>,
    },
    MysqlExplain {
        dsn: String,
        query: String,
    },
    MysqlShowCreateTable {
        dsn: String,
        table: String,
    },
    MysqlShowTableStatus {
        dsn: String,
        table: String,
    },
    PostgresqlShowCreateTable {
        dsn: String,
        table: String,
    },
    MongodbExplain {
        dsn: String,
        query: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartActionRequest {
    pub action_id: String,
    #[serde(default)]
    pub timeout: Option<Duration>,
    pub params: ActionParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StartActionResponse {
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopActionRequest {
    pub action_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StopActionResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResultRequest {
    pub action_id: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActionResultResponse {}

// ---- jobs ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbConnection {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub socket: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3LocationConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket_name: String,
    #[serde(default)]
    pub bucket_region: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocationConfig {
    S3(S3LocationConfig),
    Filesystem { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSpec {
    Echo {
        message: String,
        delay: Duration,
    },
    MysqlBackup {
        name: String,
        db: DbConnection,
        location: LocationConfig,
    },
    MongodbBackup {
        name: String,
        db: DbConnection,
        location: LocationConfig,
    },
    MysqlRestoreBackup {
        service_id: String,
        name: String,
        location: LocationConfig,
    },
    MongodbRestoreBackup {
        name: String,
        db: DbConnection,
        location: LocationConfig,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartJobRequest {
    pub job_id: String,
    #[serde(default)]
    pub timeout: Option<Duration>,
    pub job: JobSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StartJobResponse {
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopJobRequest {
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StopJobResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusRequest {
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub alive: bool,
}

/// Final outcome of a job as reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOutcome {
    Error { message: String },
    Echo { message: String },
    MysqlBackup,
    MongodbBackup,
    MysqlRestoreBackup,
    MongodbRestoreBackup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResultRequest {
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
    pub result: JobOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobResultResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgressRequest {
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
    pub chunk_id: u32,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobProgressResponse {}

// ---- connection checks ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckConnectionRequest {
    pub service_type: ServiceType,
    pub dsn: String,
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub tls_skip_verify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckConnectionStats {
    pub table_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckConnectionResponse {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub stats: Option<CheckConnectionStats>,
}

// ---- version discovery ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Software {
    Mysqld,
    Xtrabackup,
    Xbcloud,
    Qpress,
    Mongod,
    Pbm,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GetVersionsRequest {
    pub softwares: Vec<Software>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SoftwareVersion {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GetVersionsResponse {
    #[serde(default)]
    pub versions: Vec<SoftwareVersion>,
}
