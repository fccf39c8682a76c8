//! Typed access to the inventory on top of a [`StorageBackend`]

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use super::backend::{Collection, HealthStatus, StorageBackend};
use super::error::{StoreError, StoreResult};
use super::memory::MemoryBackend;
use super::schema::{
    ActionResult, AgentRecord, AgentStatus, AgentType, Artifact, BackupLocation, BackupStatus, Job,
    JobLog, RestoreHistoryItem, RestoreStatus, ServiceCredentials, ServiceRecord,
};

/// The narrow store interface used by the control plane
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn StorageBackend>,
}

impl Store {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    async fn put<T: Serialize + Sync>(
        &self,
        collection: Collection,
        id: &str,
        record: &T,
    ) -> StoreResult<()> {
        let body = serde_json::to_string(record)?;
        self.backend.put(collection, id, body).await
    }

    async fn get<T: DeserializeOwned>(
        &self,
        collection: Collection,
        kind: &'static str,
        id: &str,
    ) -> StoreResult<T> {
        match self.backend.get(collection, id).await? {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Err(StoreError::not_found(kind, id)),
        }
    }

    async fn list<T: DeserializeOwned>(&self, collection: Collection) -> StoreResult<Vec<T>> {
        self.backend
            .list(collection)
            .await?
            .iter()
            .map(|body| serde_json::from_str(body).map_err(StoreError::from))
            .collect()
    }

    pub async fn health_check(&self) -> StoreResult<HealthStatus> {
        self.backend.health_check().await
    }

    pub async fn close(&self) -> StoreResult<()> {
        self.backend.close().await
    }

    // ---- agents ----

    pub async fn save_agent(&self, agent: &AgentRecord) -> StoreResult<()> {
        self.put(Collection::Agents, &agent.agent_id, agent).await
    }

    pub async fn find_agent(&self, agent_id: &str) -> StoreResult<AgentRecord> {
        self.get(Collection::Agents, "Agent", agent_id).await
    }

    pub async fn list_agents(&self) -> StoreResult<Vec<AgentRecord>> {
        self.list(Collection::Agents).await
    }

    #[instrument(skip(self))]
    pub async fn update_agent_version(&self, agent_id: &str, version: &str) -> StoreResult<()> {
        let mut agent = self.find_agent(agent_id).await?;
        if agent.version.as_deref() == Some(version) {
            return Ok(());
        }
        debug!("updating version of {agent_id} to {version}");
        agent.version = Some(version.to_string());
        self.save_agent(&agent).await
    }

    pub async fn update_agent_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        listen_port: Option<u16>,
    ) -> StoreResult<AgentRecord> {
        let mut agent = self.find_agent(agent_id).await?;
        agent.status = Some(status);
        agent.listen_port = listen_port;
        self.save_agent(&agent).await?;
        Ok(agent)
    }

    /// Agents supervised by the given agent.
    pub async fn find_child_agents(&self, pmm_agent_id: &str) -> StoreResult<Vec<AgentRecord>> {
        Ok(self
            .list_agents()
            .await?
            .into_iter()
            .filter(|a| a.pmm_agent_id.as_deref() == Some(pmm_agent_id))
            .collect())
    }

    /// Supervising agents running on a node.
    pub async fn find_pmm_agents_for_node(&self, node_id: &str) -> StoreResult<Vec<AgentRecord>> {
        Ok(self
            .list_agents()
            .await?
            .into_iter()
            .filter(|a| {
                a.agent_type == AgentType::PmmAgent && a.runs_on_node_id.as_deref() == Some(node_id)
            })
            .collect())
    }

    /// Supervising agents that run at least one agent for the service.
    pub async fn find_pmm_agents_for_service(
        &self,
        service_id: &str,
    ) -> StoreResult<Vec<AgentRecord>> {
        let agents = self.list_agents().await?;
        let mut owners: Vec<&str> = agents
            .iter()
            .filter(|a| a.service_id.as_deref() == Some(service_id))
            .filter_map(|a| a.pmm_agent_id.as_deref())
            .collect();
        owners.sort_unstable();
        owners.dedup();

        Ok(agents
            .iter()
            .filter(|a| {
                a.agent_type == AgentType::PmmAgent && owners.contains(&a.agent_id.as_str())
            })
            .cloned()
            .collect())
    }

    // ---- services ----

    pub async fn save_service(&self, service: &ServiceRecord) -> StoreResult<()> {
        self.put(Collection::Services, &service.service_id, service)
            .await
    }

    pub async fn find_service(&self, service_id: &str) -> StoreResult<ServiceRecord> {
        self.get(Collection::Services, "Service", service_id).await
    }

    pub async fn save_credentials(
        &self,
        service_id: &str,
        credentials: &ServiceCredentials,
    ) -> StoreResult<()> {
        self.put(Collection::Credentials, service_id, credentials)
            .await
    }

    /// Credentials are optional; a service without any gets empty ones.
    pub async fn find_credentials_for_service(
        &self,
        service_id: &str,
    ) -> StoreResult<ServiceCredentials> {
        match self
            .get(Collection::Credentials, "Credentials", service_id)
            .await
        {
            Err(e) if e.is_not_found() => Ok(ServiceCredentials::default()),
            res => res,
        }
    }

    // ---- actions ----

    pub async fn record_action_result(&self, result: &ActionResult) -> StoreResult<()> {
        self.put(Collection::ActionResults, &result.id, result).await
    }

    pub async fn find_action_result(&self, action_id: &str) -> StoreResult<ActionResult> {
        self.get(Collection::ActionResults, "Action", action_id)
            .await
    }

    // ---- jobs ----

    pub async fn save_job(&self, job: &Job) -> StoreResult<()> {
        self.put(Collection::Jobs, &job.id, job).await
    }

    pub async fn find_job(&self, job_id: &str) -> StoreResult<Job> {
        self.get(Collection::Jobs, "Job", job_id).await
    }

    pub async fn append_job_log(&self, log: &JobLog) -> StoreResult<()> {
        let id = format!("{}/{:010}", log.job_id, log.chunk_id);
        self.put(Collection::JobLogs, &id, log).await
    }

    pub async fn job_logs(&self, job_id: &str) -> StoreResult<Vec<JobLog>> {
        let logs: Vec<JobLog> = self.list(Collection::JobLogs).await?;
        Ok(logs.into_iter().filter(|l| l.job_id == job_id).collect())
    }

    // ---- backups ----

    pub async fn save_artifact(&self, artifact: &Artifact) -> StoreResult<()> {
        self.put(Collection::Artifacts, &artifact.id, artifact).await
    }

    pub async fn find_artifact(&self, artifact_id: &str) -> StoreResult<Artifact> {
        self.get(Collection::Artifacts, "Artifact", artifact_id)
            .await
    }

    pub async fn update_artifact_status(
        &self,
        artifact_id: &str,
        status: BackupStatus,
    ) -> StoreResult<Artifact> {
        let mut artifact = self.find_artifact(artifact_id).await?;
        artifact.status = status;
        self.save_artifact(&artifact).await?;
        Ok(artifact)
    }

    pub async fn save_backup_location(&self, location: &BackupLocation) -> StoreResult<()> {
        self.put(Collection::BackupLocations, &location.id, location)
            .await
    }

    pub async fn find_backup_location(&self, location_id: &str) -> StoreResult<BackupLocation> {
        self.get(Collection::BackupLocations, "Backup location", location_id)
            .await
    }

    pub async fn save_restore_item(&self, item: &RestoreHistoryItem) -> StoreResult<()> {
        self.put(Collection::RestoreHistory, &item.id, item).await
    }

    pub async fn find_restore_item(&self, restore_id: &str) -> StoreResult<RestoreHistoryItem> {
        self.get(Collection::RestoreHistory, "Restore", restore_id)
            .await
    }

    pub async fn update_restore_status(
        &self,
        restore_id: &str,
        status: RestoreStatus,
    ) -> StoreResult<RestoreHistoryItem> {
        let mut item = self.find_restore_item(restore_id).await?;
        item.status = status;
        if status != RestoreStatus::InProgress {
            item.finished_at = Some(chrono::Utc::now());
        }
        self.save_restore_item(&item).await?;
        Ok(item)
    }
}
