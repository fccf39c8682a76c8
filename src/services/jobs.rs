//! Long-running jobs on agents and their retries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::agents::Handler;
use crate::agents::proto::{DbConnection, JobSpec, LocationConfig};
use crate::error::{Error, Result};
use crate::events::HubEvent;
use crate::storage::Store;
use crate::storage::schema::{BackupStatus, Job, JobData, JobType};

/// Retry policy for a new job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub interval: Duration,
}

pub struct JobsService {
    handler: Arc<Handler>,
    store: Store,
}

impl JobsService {
    pub fn new(handler: Arc<Handler>) -> Self {
        let store = handler.store().clone();
        Self { handler, store }
    }

    /// Record a new job before it is started.
    pub async fn create_job(
        &self,
        pmm_agent_id: &str,
        data: JobData,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Job> {
        let now = Utc::now();
        let job = Job {
            id: format!("/job_id/{}", Uuid::new_v4()),
            pmm_agent_id: pmm_agent_id.to_string(),
            data,
            timeout,
            retries_remaining: retry.retries,
            interval: retry.interval,
            done: false,
            error: String::new(),
            output: None,
            created_at: now,
            updated_at: now,
        };
        self.store.save_job(&job).await?;
        Ok(job)
    }

    pub async fn start_echo_job(
        &self,
        job_id: &str,
        pmm_agent_id: &str,
        timeout: Duration,
        message: &str,
        delay: Duration,
    ) -> Result<()> {
        let job = JobSpec::Echo {
            message: message.to_string(),
            delay,
        };
        self.start(JobType::Echo, job_id, pmm_agent_id, timeout, job)
            .await
    }

    pub async fn start_mysql_backup_job(
        &self,
        job_id: &str,
        pmm_agent_id: &str,
        timeout: Duration,
        name: &str,
        db: DbConnection,
        location: LocationConfig,
    ) -> Result<()> {
        if !matches!(location, LocationConfig::S3(_)) {
            return Err(Error::InvalidArgument("unsupported location config".to_string()));
        }
        let job = JobSpec::MysqlBackup {
            name: name.to_string(),
            db,
            location,
        };
        self.start(JobType::MysqlBackup, job_id, pmm_agent_id, timeout, job)
            .await
    }

    pub async fn start_mongodb_backup_job(
        &self,
        job_id: &str,
        pmm_agent_id: &str,
        timeout: Duration,
        name: &str,
        db: DbConnection,
        location: LocationConfig,
    ) -> Result<()> {
        let job = JobSpec::MongodbBackup {
            name: name.to_string(),
            db,
            location,
        };
        self.start(JobType::MongodbBackup, job_id, pmm_agent_id, timeout, job)
            .await
    }

    pub async fn start_mysql_restore_backup_job(
        &self,
        job_id: &str,
        pmm_agent_id: &str,
        service_id: &str,
        timeout: Duration,
        name: &str,
        location: LocationConfig,
    ) -> Result<()> {
        if !matches!(location, LocationConfig::S3(_)) {
            return Err(Error::InvalidArgument(
                "location config is not set for restore".to_string(),
            ));
        }
        let job = JobSpec::MysqlRestoreBackup {
            service_id: service_id.to_string(),
            name: name.to_string(),
            location,
        };
        self.start(JobType::MysqlRestoreBackup, job_id, pmm_agent_id, timeout, job)
            .await
    }

    pub async fn start_mongodb_restore_backup_job(
        &self,
        job_id: &str,
        pmm_agent_id: &str,
        timeout: Duration,
        name: &str,
        db: DbConnection,
        location: LocationConfig,
    ) -> Result<()> {
        let job = JobSpec::MongodbRestoreBackup {
            name: name.to_string(),
            db,
            location,
        };
        self.start(
            JobType::MongodbRestoreBackup,
            job_id,
            pmm_agent_id,
            timeout,
            job,
        )
        .await
    }

    async fn start(
        &self,
        job_type: JobType,
        job_id: &str,
        pmm_agent_id: &str,
        timeout: Duration,
        job: JobSpec,
    ) -> Result<()> {
        let timeout = (!timeout.is_zero()).then_some(timeout);
        let response = self
            .handler
            .start_job(pmm_agent_id, job_id, job, timeout)
            .await?;
        if !response.error.is_empty() {
            return Err(Error::Application(format!(
                "failed to start {job_type} job: {}",
                response.error
            )));
        }
        debug!("started {job_type} job {job_id} on {pmm_agent_id}");
        Ok(())
    }

    /// Stop a running job. Finished jobs are left alone.
    #[instrument(skip(self))]
    pub async fn stop_job(&self, job_id: &str) -> Result<()> {
        let job = self.store.find_job(job_id).await?;
        if job.done {
            return Ok(());
        }
        self.handler.stop_job(&job.pmm_agent_id, job_id).await?;
        Ok(())
    }

    /// Whether the agent still runs the job.
    pub async fn job_status(&self, job_id: &str) -> Result<bool> {
        let job = self.store.find_job(job_id).await?;
        let response = self.handler.job_status(&job.pmm_agent_id, job_id).await?;
        Ok(response.alive)
    }

    /// Start a failed job again, using up one retry.
    ///
    /// Waits the job's retry interval first. Restore jobs are never
    /// restarted; only the retry is consumed.
    #[instrument(skip(self))]
    pub async fn restart_job(&self, job_id: &str) -> Result<()> {
        let mut job = self.store.find_job(job_id).await?;
        if job.retries_remaining == 0 {
            return Err(Error::RetriesExhausted(job_id.to_string()));
        }
        job.retries_remaining -= 1;
        let restartable = !matches!(
            job.data,
            JobData::MysqlRestoreBackup { .. } | JobData::MongodbRestoreBackup { .. }
        );
        if restartable {
            job.done = false;
            job.error.clear();
        }
        job.updated_at = Utc::now();
        self.store.save_job(&job).await?;

        if !restartable {
            return Ok(());
        }

        if !job.interval.is_zero() {
            tokio::time::sleep(job.interval).await;
        }

        info!(
            "restarting {} job, {} retries left",
            job.job_type(),
            job.retries_remaining
        );
        if let Err(e) = self.start_again(&job).await {
            job.done = true;
            job.error = e.to_string();
            job.updated_at = Utc::now();
            if let Err(save) = self.store.save_job(&job).await {
                warn!("failed to save job {job_id}: {save}");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn start_again(&self, job: &Job) -> Result<()> {
        match &job.data {
            JobData::Echo { message, delay } => {
                self.start_echo_job(&job.id, &job.pmm_agent_id, job.timeout, message, *delay)
                    .await
            }
            JobData::MysqlBackup {
                service_id,
                artifact_id,
            }
            | JobData::MongodbBackup {
                service_id,
                artifact_id,
            } => {
                let artifact = self
                    .store
                    .update_artifact_status(artifact_id, BackupStatus::Pending)
                    .await?;
                let location = self.store.find_backup_location(&artifact.location_id).await?;
                let service = self.store.find_service(service_id).await?;
                let credentials = self.store.find_credentials_for_service(service_id).await?;
                let db = service.db_connection(&credentials);

                if job.job_type() == JobType::MysqlBackup {
                    self.start_mysql_backup_job(
                        &job.id,
                        &job.pmm_agent_id,
                        job.timeout,
                        &artifact.name,
                        db,
                        location.config,
                    )
                    .await
                } else {
                    self.start_mongodb_backup_job(
                        &job.id,
                        &job.pmm_agent_id,
                        job.timeout,
                        &artifact.name,
                        db,
                        location.config,
                    )
                    .await
                }
            }
            JobData::MysqlRestoreBackup { .. } | JobData::MongodbRestoreBackup { .. } => Ok(()),
        }
    }

    /// Restart jobs as their failures are published.
    ///
    /// Runs until the event bus is gone. Each restart runs in its own task so
    /// a long retry interval does not hold up other jobs.
    pub async fn run_retries(self: Arc<Self>, mut events: broadcast::Receiver<HubEvent>) {
        loop {
            let job_id = match events.recv().await {
                Ok(HubEvent::JobFailed {
                    job_id, message, ..
                }) => {
                    debug!("job {job_id} failed: {message}");
                    job_id
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("job retry listener skipped {skipped} events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };

            let jobs = self.clone();
            tokio::spawn(async move {
                match jobs.restart_job(&job_id).await {
                    Ok(()) => {}
                    Err(Error::RetriesExhausted(_)) => {
                        info!("job {job_id} failed with no retries left")
                    }
                    Err(e) => warn!("failed to restart job {job_id}: {e}"),
                }
            });
        }
    }
}
