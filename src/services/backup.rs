//! Backup and restore orchestration.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tracing::{error, info, instrument};
use uuid::Uuid;

use super::jobs::{JobsService, RetryPolicy};
use super::pick_pmm_agent;
use crate::error::{Error, Result};
use crate::storage::Store;
use crate::storage::schema::{
    Artifact, BackupStatus, Job, JobData, RestoreHistoryItem, RestoreStatus, ServiceType,
};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackupParams {
    pub service_id: String,
    pub location_id: String,
    pub name: String,
    #[serde(default)]
    pub pmm_agent_id: Option<String>,
    #[serde(default)]
    pub timeout: Duration,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub retry_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RestoreParams {
    pub service_id: String,
    pub artifact_id: String,
    #[serde(default)]
    pub pmm_agent_id: Option<String>,
    #[serde(default)]
    pub timeout: Duration,
}

pub struct BackupService {
    jobs: Arc<JobsService>,
    store: Store,
}

impl BackupService {
    pub fn new(jobs: Arc<JobsService>, store: Store) -> Self {
        Self { jobs, store }
    }

    /// Create an artifact and start the job producing it.
    ///
    /// Returns the artifact id. If the job cannot be started the artifact is
    /// marked failed.
    #[instrument(skip(self), fields(service = %params.service_id))]
    pub async fn perform_backup(&self, params: BackupParams) -> Result<String> {
        let service = self.store.find_service(&params.service_id).await?;
        let location = self.store.find_backup_location(&params.location_id).await?;
        if !matches!(service.service_type, ServiceType::Mysql | ServiceType::Mongodb) {
            return Err(Error::InvalidArgument(format!(
                "backups are not supported for {} services",
                service.service_type
            )));
        }

        let candidates = self
            .store
            .find_pmm_agents_for_service(&params.service_id)
            .await?;
        let pmm_agent_id = pick_pmm_agent(&candidates, params.pmm_agent_id.as_deref())?;
        let credentials = self
            .store
            .find_credentials_for_service(&params.service_id)
            .await?;

        let artifact = Artifact {
            id: format!("/artifact_id/{}", Uuid::new_v4()),
            name: params.name.clone(),
            service_id: service.service_id.clone(),
            location_id: location.id.clone(),
            vendor: service.service_type,
            status: BackupStatus::Pending,
            created_at: Utc::now(),
        };
        self.store.save_artifact(&artifact).await?;

        let data = match service.service_type {
            ServiceType::Mongodb => JobData::MongodbBackup {
                service_id: service.service_id.clone(),
                artifact_id: artifact.id.clone(),
            },
            _ => JobData::MysqlBackup {
                service_id: service.service_id.clone(),
                artifact_id: artifact.id.clone(),
            },
        };
        let retry = RetryPolicy {
            retries: params.retries,
            interval: params.retry_interval,
        };
        let job = self
            .jobs
            .create_job(&pmm_agent_id, data, params.timeout, retry)
            .await?;

        let db = service.db_connection(&credentials);
        let started = match service.service_type {
            ServiceType::Mongodb => {
                self.jobs
                    .start_mongodb_backup_job(
                        &job.id,
                        &pmm_agent_id,
                        params.timeout,
                        &artifact.name,
                        db,
                        location.config,
                    )
                    .await
            }
            _ => {
                self.jobs
                    .start_mysql_backup_job(
                        &job.id,
                        &pmm_agent_id,
                        params.timeout,
                        &artifact.name,
                        db,
                        location.config,
                    )
                    .await
            }
        };

        if let Err(e) = started {
            error!("failed to start backup: {e}");
            self.store
                .update_artifact_status(&artifact.id, BackupStatus::Error)
                .await?;
            self.fail_job(job, &e).await?;
            return Err(e);
        }

        self.store
            .update_artifact_status(&artifact.id, BackupStatus::InProgress)
            .await?;
        info!("backup {} started on {pmm_agent_id}", artifact.id);
        Ok(artifact.id)
    }

    /// Restore a successful artifact onto a service.
    ///
    /// Returns the restore history item id.
    #[instrument(skip(self), fields(artifact = %params.artifact_id))]
    pub async fn restore_backup(&self, params: RestoreParams) -> Result<String> {
        let artifact = self.store.find_artifact(&params.artifact_id).await?;
        if artifact.status != BackupStatus::Success {
            return Err(Error::FailedPrecondition(format!(
                "artifact {:?} is not ready for restore: {:?}",
                artifact.id, artifact.status
            )));
        }

        let service = self.store.find_service(&params.service_id).await?;
        if service.service_type != artifact.vendor {
            return Err(Error::InvalidArgument(format!(
                "artifact {:?} is a {} backup, service is {}",
                artifact.id, artifact.vendor, service.service_type
            )));
        }
        let location = self.store.find_backup_location(&artifact.location_id).await?;

        let candidates = self
            .store
            .find_pmm_agents_for_service(&params.service_id)
            .await?;
        let pmm_agent_id = pick_pmm_agent(&candidates, params.pmm_agent_id.as_deref())?;

        let item = RestoreHistoryItem {
            id: format!("/restore_id/{}", Uuid::new_v4()),
            artifact_id: artifact.id.clone(),
            service_id: service.service_id.clone(),
            status: RestoreStatus::InProgress,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.store.save_restore_item(&item).await?;

        let data = match service.service_type {
            ServiceType::Mongodb => JobData::MongodbRestoreBackup {
                service_id: service.service_id.clone(),
                restore_id: item.id.clone(),
            },
            _ => JobData::MysqlRestoreBackup {
                service_id: service.service_id.clone(),
                restore_id: item.id.clone(),
            },
        };
        let job = self
            .jobs
            .create_job(&pmm_agent_id, data, params.timeout, RetryPolicy::default())
            .await?;

        let started = match service.service_type {
            ServiceType::Mongodb => {
                let credentials = self
                    .store
                    .find_credentials_for_service(&service.service_id)
                    .await?;
                self.jobs
                    .start_mongodb_restore_backup_job(
                        &job.id,
                        &pmm_agent_id,
                        params.timeout,
                        &artifact.name,
                        service.db_connection(&credentials),
                        location.config,
                    )
                    .await
            }
            _ => {
                self.jobs
                    .start_mysql_restore_backup_job(
                        &job.id,
                        &pmm_agent_id,
                        &service.service_id,
                        params.timeout,
                        &artifact.name,
                        location.config,
                    )
                    .await
            }
        };

        if let Err(e) = started {
            error!("failed to start restore: {e}");
            self.store
                .update_restore_status(&item.id, RestoreStatus::Error)
                .await?;
            self.fail_job(job, &e).await?;
            return Err(e);
        }

        info!("restore {} started on {pmm_agent_id}", item.id);
        Ok(item.id)
    }

    async fn fail_job(&self, mut job: Job, e: &Error) -> Result<()> {
        job.done = true;
        job.error = e.to_string();
        job.updated_at = Utc::now();
        Ok(self.store.save_job(&job).await?)
    }
}
