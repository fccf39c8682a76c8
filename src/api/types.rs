//! API request and response bodies
//!
//! Records that already serialize well (action results, jobs, artifacts) are
//! returned as they are stored; the types here cover everything else.

use serde::{Deserialize, Serialize};

use crate::agents::proto::{CheckConnectionStats, Software, SoftwareVersion};
use crate::agents::registry::ConnectionInfo;
use crate::storage::schema::{Job, JobLog};

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// "ok" or "degraded"
    pub status: String,
    pub timestamp: String,
    pub storage: StorageHealth,
    pub connected_agents: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageHealth {
    pub healthy: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentsResponse {
    pub agents: Vec<ConnectionInfo>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub agent_id: String,
    pub roundtrip_ms: f64,
    /// Agent clock minus hub clock
    pub clock_drift_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionsRequest {
    pub softwares: Vec<Software>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionsResponse {
    pub versions: Vec<SoftwareVersion>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckConnectionBody {
    #[serde(default)]
    pub pmm_agent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConnectionResult {
    pub service_id: String,
    pub stats: Option<CheckConnectionStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoJobRequest {
    pub pmm_agent_id: String,
    pub message: String,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub retry_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResponse {
    #[serde(flatten)]
    pub job: Job,
    pub logs: Vec<JobLog>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub alive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupStarted {
    pub artifact_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreStarted {
    pub restore_id: String,
}
