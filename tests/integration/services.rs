//! Typed callers: actions, jobs, backups and connection checks.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use guardia_control::{
    Error,
    agents::proto::{
        ActionParams, AgentPayload, CheckConnectionResponse, CheckConnectionStats, Code,
        JobOutcome, JobResultRequest, JobSpec, LocationConfig, ServerPayload, Software,
        StartActionResponse, StartJobResponse,
    },
    services::{
        ActionKind, ActionsService, BackupParams, BackupService, ConnectionChecker, JobsService,
        RestoreParams, RunAction, jobs::RetryPolicy,
    },
    storage::schema::{BackupLocation, BackupStatus, JobData, RestoreStatus},
};

use crate::helpers::{
    MYSQL_SERVICE, NODE, PMM_AGENT, S3_LOCATION, connect, connect_with, default_reply,
    eventually, quiet_settings, test_hub,
};

fn echo(message: &str) -> JobData {
    JobData::Echo {
        message: message.to_string(),
        delay: Duration::ZERO,
    }
}

fn backup_params(location_id: &str) -> BackupParams {
    BackupParams {
        service_id: MYSQL_SERVICE.to_string(),
        location_id: location_id.to_string(),
        name: "nightly".to_string(),
        pmm_agent_id: None,
        timeout: Duration::from_secs(60),
        retries: 0,
        retry_interval: Duration::ZERO,
    }
}

#[tokio::test]
async fn test_run_action_resolves_agent_and_dsn() {
    let hub = test_hub(quiet_settings()).await;
    let actions = ActionsService::new(hub.handler.clone());
    let mut agent = connect(&hub, PMM_AGENT);
    assert!(eventually(|| hub.registry.is_connected(PMM_AGENT)).await);

    let result = actions
        .run_action(RunAction {
            pmm_agent_id: None,
            timeout: Some(Duration::from_secs(10)),
            action: ActionKind::MysqlExplain {
                service_id: MYSQL_SERVICE.to_string(),
                query: "SELECT 1".to_string(),
            },
        })
        .await
        .unwrap();

    assert!(result.id.starts_with("/action_id/"));
    assert_eq!(result.pmm_agent_id, PMM_AGENT);
    assert!(!result.done);

    let request = agent
        .expect(|p| match p {
            ServerPayload::StartAction(request) => Some(request),
            _ => None,
        })
        .await;
    assert_eq!(request.action_id, result.id);
    assert_eq!(request.timeout, Some(Duration::from_secs(10)));
    assert_matches!(
        request.params,
        ActionParams::MysqlExplain { dsn, query }
            if dsn.contains("127.0.0.1:3306") && query == "SELECT 1"
    );

    let stored = actions.action_result(&result.id).await.unwrap();
    assert_eq!(stored, result);
}

#[tokio::test]
async fn test_run_action_records_agent_refusal() {
    let hub = test_hub(quiet_settings()).await;
    let actions = ActionsService::new(hub.handler.clone());
    let _agent = connect_with(
        &hub,
        PMM_AGENT,
        Box::new(|payload| match payload {
            ServerPayload::StartAction(_) => Some(AgentPayload::StartAction(StartActionResponse {
                error: "boom".to_string(),
            })),
            other => default_reply(other),
        }),
    );
    assert!(eventually(|| hub.registry.is_connected(PMM_AGENT)).await);

    let result = actions
        .run_action(RunAction {
            pmm_agent_id: None,
            timeout: None,
            action: ActionKind::ProcessSummary {
                node_id: NODE.to_string(),
                args: vec![],
            },
        })
        .await;

    assert_matches!(result, Err(Error::Application(message)) if message == "boom");
    assert!(hub.registry.is_connected(PMM_AGENT));
}

#[tokio::test]
async fn test_run_action_rejects_wrong_service_type() {
    let hub = test_hub(quiet_settings()).await;
    let actions = ActionsService::new(hub.handler.clone());

    let result = actions
        .run_action(RunAction {
            pmm_agent_id: None,
            timeout: None,
            action: ActionKind::MongodbExplain {
                service_id: MYSQL_SERVICE.to_string(),
                query: "{}".to_string(),
            },
        })
        .await;

    assert_matches!(result, Err(Error::InvalidArgument(_)));
}

#[tokio::test]
async fn test_run_action_without_agent_on_node() {
    let hub = test_hub(quiet_settings()).await;
    let actions = ActionsService::new(hub.handler.clone());

    let result = actions
        .run_action(RunAction {
            pmm_agent_id: None,
            timeout: None,
            action: ActionKind::ProcessSummary {
                node_id: "node-elsewhere".to_string(),
                args: vec![],
            },
        })
        .await;

    let error = result.unwrap_err();
    assert_eq!(error.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn test_cancel_finished_action_is_noop() {
    let hub = test_hub(quiet_settings()).await;
    let actions = ActionsService::new(hub.handler.clone());
    let mut agent = connect(&hub, PMM_AGENT);
    assert!(eventually(|| hub.registry.is_connected(PMM_AGENT)).await);

    let result = actions
        .run_action(RunAction {
            pmm_agent_id: Some(PMM_AGENT.to_string()),
            timeout: None,
            action: ActionKind::ProcessSummary {
                node_id: NODE.to_string(),
                args: vec![],
            },
        })
        .await
        .unwrap();

    // running: the agent is asked to stop it
    actions.cancel_action(&result.id).await.unwrap();
    agent
        .expect(|p| matches!(p, ServerPayload::StopAction(_)).then_some(()))
        .await;

    let mut done = result.clone();
    done.done = true;
    hub.store.record_action_result(&done).await.unwrap();

    actions.cancel_action(&result.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        agent.drain_matching(|p| matches!(p, ServerPayload::StopAction(_))),
        0
    );
}

#[tokio::test]
async fn test_echo_job_start_and_stop() {
    let hub = test_hub(quiet_settings()).await;
    let jobs = JobsService::new(hub.handler.clone());
    let mut agent = connect(&hub, PMM_AGENT);
    assert!(eventually(|| hub.registry.is_connected(PMM_AGENT)).await);

    let job = jobs
        .create_job(PMM_AGENT, echo("hi"), Duration::ZERO, RetryPolicy::default())
        .await
        .unwrap();
    jobs.start_echo_job(&job.id, PMM_AGENT, Duration::ZERO, "hi", Duration::from_millis(5))
        .await
        .unwrap();

    let request = agent
        .expect(|p| match p {
            ServerPayload::StartJob(request) => Some(request),
            _ => None,
        })
        .await;
    assert_eq!(request.job_id, job.id);
    assert_eq!(request.timeout, None);
    assert_eq!(
        request.job,
        JobSpec::Echo {
            message: "hi".to_string(),
            delay: Duration::from_millis(5),
        }
    );

    assert!(jobs.job_status(&job.id).await.unwrap());
    jobs.stop_job(&job.id).await.unwrap();
    agent
        .expect(|p| matches!(p, ServerPayload::StopJob(_)).then_some(()))
        .await;
}

#[tokio::test]
async fn test_start_job_refused_by_agent() {
    let hub = test_hub(quiet_settings()).await;
    let jobs = JobsService::new(hub.handler.clone());
    let _agent = connect_with(
        &hub,
        PMM_AGENT,
        Box::new(|payload| match payload {
            ServerPayload::StartJob(_) => Some(AgentPayload::StartJob(StartJobResponse {
                error: "busy".to_string(),
            })),
            other => default_reply(other),
        }),
    );
    assert!(eventually(|| hub.registry.is_connected(PMM_AGENT)).await);

    let result = jobs
        .start_echo_job("/job_id/x", PMM_AGENT, Duration::ZERO, "hi", Duration::ZERO)
        .await;

    assert_matches!(result, Err(Error::Application(message)) if message.contains("busy"));
}

#[tokio::test]
async fn test_restart_job_uses_up_retries() {
    let hub = test_hub(quiet_settings()).await;
    let jobs = JobsService::new(hub.handler.clone());
    let mut agent = connect(&hub, PMM_AGENT);
    assert!(eventually(|| hub.registry.is_connected(PMM_AGENT)).await);

    let job = jobs
        .create_job(
            PMM_AGENT,
            echo("again"),
            Duration::ZERO,
            RetryPolicy {
                retries: 1,
                interval: Duration::from_millis(10),
            },
        )
        .await
        .unwrap();

    jobs.restart_job(&job.id).await.unwrap();
    let request = agent
        .expect(|p| match p {
            ServerPayload::StartJob(request) => Some(request),
            _ => None,
        })
        .await;
    assert_eq!(request.job_id, job.id);

    let stored = hub.store.find_job(&job.id).await.unwrap();
    assert_eq!(stored.retries_remaining, 0);
    assert!(!stored.done);

    let result = jobs.restart_job(&job.id).await;
    assert_matches!(result, Err(Error::RetriesExhausted(id)) if id == job.id);
}

#[tokio::test]
async fn test_restore_job_is_not_restarted() {
    let hub = test_hub(quiet_settings()).await;
    let jobs = JobsService::new(hub.handler.clone());
    let mut agent = connect(&hub, PMM_AGENT);
    assert!(eventually(|| hub.registry.is_connected(PMM_AGENT)).await);

    let job = jobs
        .create_job(
            PMM_AGENT,
            JobData::MysqlRestoreBackup {
                service_id: MYSQL_SERVICE.to_string(),
                restore_id: "/restore_id/1".to_string(),
            },
            Duration::ZERO,
            RetryPolicy {
                retries: 2,
                interval: Duration::ZERO,
            },
        )
        .await
        .unwrap();

    jobs.restart_job(&job.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        agent.drain_matching(|p| matches!(p, ServerPayload::StartJob(_))),
        0
    );
    assert_eq!(hub.store.find_job(&job.id).await.unwrap().retries_remaining, 1);
}

#[tokio::test]
async fn test_failed_job_is_retried_from_event() {
    let hub = test_hub(quiet_settings()).await;
    let jobs = Arc::new(JobsService::new(hub.handler.clone()));
    tokio::spawn(jobs.clone().run_retries(hub.events.subscribe()));

    let mut agent = connect(&hub, PMM_AGENT);
    assert!(eventually(|| hub.registry.is_connected(PMM_AGENT)).await);

    let job = jobs
        .create_job(
            PMM_AGENT,
            echo("flaky"),
            Duration::ZERO,
            RetryPolicy {
                retries: 1,
                interval: Duration::ZERO,
            },
        )
        .await
        .unwrap();

    agent
        .request(
            1,
            JobResultRequest {
                job_id: job.id.clone(),
                timestamp: Utc::now(),
                result: JobOutcome::Error {
                    message: "network".to_string(),
                },
            },
        )
        .await;

    let request = agent
        .expect(|p| match p {
            ServerPayload::StartJob(request) => Some(request),
            _ => None,
        })
        .await;
    assert_eq!(request.job_id, job.id);

    // the retry is persisted before the job is started again
    let stored = hub.store.find_job(&job.id).await.unwrap();
    assert_eq!(stored.retries_remaining, 0);
    assert!(!stored.done);
    assert!(stored.error.is_empty());
}

#[tokio::test]
async fn test_backup_runs_to_success() {
    let hub = test_hub(quiet_settings()).await;
    let jobs = Arc::new(JobsService::new(hub.handler.clone()));
    let backups = BackupService::new(jobs, hub.store.clone());
    let mut agent = connect(&hub, PMM_AGENT);
    assert!(eventually(|| hub.registry.is_connected(PMM_AGENT)).await);

    let artifact_id = backups
        .perform_backup(backup_params(S3_LOCATION))
        .await
        .unwrap();
    assert!(artifact_id.starts_with("/artifact_id/"));

    let request = agent
        .expect(|p| match p {
            ServerPayload::StartJob(request) => Some(request),
            _ => None,
        })
        .await;
    assert_eq!(request.timeout, Some(Duration::from_secs(60)));
    assert_matches!(
        &request.job,
        JobSpec::MysqlBackup { name, db, location: LocationConfig::S3(_) }
            if name == "nightly" && db.user == "pmm" && db.port == 3306
    );

    let artifact = hub.store.find_artifact(&artifact_id).await.unwrap();
    assert_eq!(artifact.status, BackupStatus::InProgress);

    agent
        .request(
            1,
            JobResultRequest {
                job_id: request.job_id.clone(),
                timestamp: Utc::now(),
                result: JobOutcome::MysqlBackup,
            },
        )
        .await;
    agent
        .expect(|p| matches!(p, ServerPayload::JobResult(_)).then_some(()))
        .await;

    let artifact = hub.store.find_artifact(&artifact_id).await.unwrap();
    assert_eq!(artifact.status, BackupStatus::Success);
    assert!(hub.store.find_job(&request.job_id).await.unwrap().done);

    // and the finished artifact can be restored
    let restore_id = backups
        .restore_backup(RestoreParams {
            service_id: MYSQL_SERVICE.to_string(),
            artifact_id: artifact_id.clone(),
            pmm_agent_id: None,
            timeout: Duration::ZERO,
        })
        .await
        .unwrap();
    let restore = agent
        .expect(|p| match p {
            ServerPayload::StartJob(request) => Some(request.job),
            _ => None,
        })
        .await;
    assert_matches!(
        restore,
        JobSpec::MysqlRestoreBackup { service_id, .. } if service_id == MYSQL_SERVICE
    );
    let item = hub.store.find_restore_item(&restore_id).await.unwrap();
    assert_eq!(item.status, RestoreStatus::InProgress);
}

#[tokio::test]
async fn test_mysql_backup_to_filesystem_fails() {
    let hub = test_hub(quiet_settings()).await;
    hub.store
        .save_backup_location(&BackupLocation {
            id: "loc-fs".to_string(),
            name: "local".to_string(),
            config: LocationConfig::Filesystem {
                path: "/srv/backups".to_string(),
            },
        })
        .await
        .unwrap();
    let jobs = Arc::new(JobsService::new(hub.handler.clone()));
    let backups = BackupService::new(jobs, hub.store.clone());
    let mut agent = connect(&hub, PMM_AGENT);
    assert!(eventually(|| hub.registry.is_connected(PMM_AGENT)).await);

    let result = backups.perform_backup(backup_params("loc-fs")).await;

    assert_matches!(result, Err(Error::InvalidArgument(_)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        agent.drain_matching(|p| matches!(p, ServerPayload::StartJob(_))),
        0
    );
}

#[tokio::test]
async fn test_backup_start_failure_marks_artifact_failed() {
    let hub = test_hub(quiet_settings()).await;
    let jobs = Arc::new(JobsService::new(hub.handler.clone()));
    let backups = BackupService::new(jobs, hub.store.clone());
    let _agent = connect_with(
        &hub,
        PMM_AGENT,
        Box::new(|payload| match payload {
            ServerPayload::StartJob(_) => Some(AgentPayload::StartJob(StartJobResponse {
                error: "xtrabackup not found".to_string(),
            })),
            other => default_reply(other),
        }),
    );
    assert!(eventually(|| hub.registry.is_connected(PMM_AGENT)).await);

    let error = backups
        .perform_backup(backup_params(S3_LOCATION))
        .await
        .unwrap_err();
    assert!(error.to_string().contains("xtrabackup not found"));
}

#[tokio::test]
async fn test_restore_requires_successful_artifact() {
    let hub = test_hub(quiet_settings()).await;
    let jobs = Arc::new(JobsService::new(hub.handler.clone()));
    let backups = BackupService::new(jobs, hub.store.clone());
    let _agent = connect(&hub, PMM_AGENT);
    assert!(eventually(|| hub.registry.is_connected(PMM_AGENT)).await);

    let artifact_id = backups
        .perform_backup(backup_params(S3_LOCATION))
        .await
        .unwrap();

    let result = backups
        .restore_backup(RestoreParams {
            service_id: MYSQL_SERVICE.to_string(),
            artifact_id,
            pmm_agent_id: None,
            timeout: Duration::ZERO,
        })
        .await;

    let error = result.unwrap_err();
    assert_eq!(error.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn test_check_connection_reports_stats() {
    let hub = test_hub(quiet_settings()).await;
    let checks = ConnectionChecker::new(hub.handler.clone());
    let mut agent = connect_with(
        &hub,
        PMM_AGENT,
        Box::new(|payload| match payload {
            ServerPayload::CheckConnection(_) => {
                Some(AgentPayload::CheckConnection(CheckConnectionResponse {
                    error: String::new(),
                    stats: Some(CheckConnectionStats { table_count: 12 }),
                }))
            }
            other => default_reply(other),
        }),
    );
    assert!(eventually(|| hub.registry.is_connected(PMM_AGENT)).await);

    let stats = checks
        .check_connection_to_service(MYSQL_SERVICE, None)
        .await
        .unwrap();
    assert_eq!(stats, Some(CheckConnectionStats { table_count: 12 }));

    let request = agent
        .expect(|p| match p {
            ServerPayload::CheckConnection(request) => Some(request),
            _ => None,
        })
        .await;
    assert_eq!(request.timeout, Some(Duration::from_secs(3)));
    assert!(request.dsn.contains("hunter2"));
}

#[tokio::test]
async fn test_check_connection_timeout_is_described() {
    let hub = test_hub(quiet_settings()).await;
    let checks = ConnectionChecker::new(hub.handler.clone());
    let _agent = connect_with(
        &hub,
        PMM_AGENT,
        Box::new(|payload| match payload {
            ServerPayload::CheckConnection(_) => {
                Some(AgentPayload::CheckConnection(CheckConnectionResponse {
                    error: "context deadline exceeded".to_string(),
                    stats: None,
                }))
            }
            other => default_reply(other),
        }),
    );
    assert!(eventually(|| hub.registry.is_connected(PMM_AGENT)).await);

    let result = checks.check_connection_to_service(MYSQL_SERVICE, None).await;

    assert_matches!(
        result,
        Err(Error::FailedPrecondition(message))
            if message == "Connection check failed: timeout (context deadline exceeded)."
    );
}

#[tokio::test]
async fn test_software_versions_in_request_order() {
    let hub = test_hub(quiet_settings()).await;
    let checks = ConnectionChecker::new(hub.handler.clone());
    let mut agent = connect(&hub, PMM_AGENT);
    assert!(eventually(|| hub.registry.is_connected(PMM_AGENT)).await);

    let versions = checks
        .software_versions(PMM_AGENT, vec![Software::Mysqld, Software::Xtrabackup])
        .await
        .unwrap();
    assert_eq!(versions.len(), 2);
    assert!(versions.iter().all(|v| v.version == "8.0.36"));

    let request = agent
        .expect(|p| match p {
            ServerPayload::GetVersions(request) => Some(request),
            _ => None,
        })
        .await;
    assert_eq!(request.softwares, vec![Software::Mysqld, Software::Xtrabackup]);
}
