//! Requests initiated by agents and typed commands sent to them.

use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use guardia_control::{
    ComponentOverview, CpuOverview, Error, MemoryInformation, ServerMetrics, SystemInformation,
    agents::{
        ChannelError,
        proto::{
            ActionParams, ActionResultRequest, AgentMessage, AgentPayload, Code, CollectRequest,
            JobOutcome, JobProgressRequest, JobResultRequest, PingRequest, ServerPayload,
            StateChangedRequest, StartActionResponse, Status, TelemetryBucket,
        },
    },
    events::HubEvent,
    services::{JobsService, jobs::RetryPolicy},
    storage::schema::{AgentStatus, JobData},
};
use tokio::sync::broadcast;

use crate::helpers::{
    MYSQLD_EXPORTER, PMM_AGENT, connect, connect_with, default_reply, eventually,
    quiet_settings, test_hub,
};

async fn next_event<T>(
    events: &mut broadcast::Receiver<HubEvent>,
    pick: impl Fn(HubEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(found) = pick(events.recv().await.unwrap()) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn empty_metrics() -> ServerMetrics {
    ServerMetrics {
        system: SystemInformation {
            name: Some("Linux".to_string()),
            kernel_version: None,
            os_version: None,
            host_name: Some("db-1".to_string()),
        },
        memory: MemoryInformation {
            total: 1024,
            used: 512,
            total_swap: 0,
            used_swap: 0,
        },
        cpus: CpuOverview {
            total: 0,
            arch: "x86_64".to_string(),
            average_usage: 0.0,
            cpus: vec![],
        },
        components: ComponentOverview {
            average_temperature: None,
            components: vec![],
        },
    }
}

#[tokio::test]
async fn test_agent_ping_is_answered_with_pong() {
    let hub = test_hub(quiet_settings()).await;
    let mut agent = connect(&hub, PMM_AGENT);

    let before = Utc::now();
    agent.request(1, PingRequest {}).await;
    let pong = agent
        .expect(|p| match p {
            ServerPayload::Pong(pong) => Some(pong),
            _ => None,
        })
        .await;

    assert!(pong.current_time >= before);
}

#[tokio::test]
async fn test_state_changed_updates_store_and_pushes_state() {
    let hub = test_hub(quiet_settings()).await;
    let mut events = hub.events.subscribe();
    let mut agent = connect(&hub, PMM_AGENT);
    agent
        .expect(|p| matches!(p, ServerPayload::SetState(_)).then_some(()))
        .await;

    agent
        .request(
            7,
            StateChangedRequest {
                agent_id: MYSQLD_EXPORTER.to_string(),
                status: AgentStatus::Running,
                listen_port: 42001,
                process_exec_path: Some("/usr/bin/mysqld_exporter".to_string()),
            },
        )
        .await;

    let ack_id = agent
        .expect_message(|m| {
            matches!(m.payload, Some(ServerPayload::StateChanged(_))).then_some(m.id)
        })
        .await;
    assert_eq!(ack_id, 7);

    let exporter = hub.store.find_agent(MYSQLD_EXPORTER).await.unwrap();
    assert_eq!(exporter.status, Some(AgentStatus::Running));
    assert_eq!(exporter.listen_port, Some(42001));

    let (agent_id, pmm_agent_id) = next_event(&mut events, |e| match e {
        HubEvent::AgentStatus {
            agent_id,
            pmm_agent_id,
            ..
        } => Some((agent_id, pmm_agent_id)),
        _ => None,
    })
    .await;
    assert_eq!(agent_id, MYSQLD_EXPORTER);
    assert_eq!(pmm_agent_id.as_deref(), Some(PMM_AGENT));

    // a status change schedules a fresh state push
    agent
        .expect(|p| matches!(p, ServerPayload::SetState(_)).then_some(()))
        .await;
}

#[tokio::test]
async fn test_unknown_payload_is_answered_unimplemented() {
    let hub = test_hub(quiet_settings()).await;
    let mut agent = connect(&hub, PMM_AGENT);

    assert!(
        agent
            .sender
            .send(AgentMessage {
                id: 42,
                status: Status::ok(),
                payload: Some(AgentPayload::Unknown),
            })
            .await
    );

    let status = agent
        .expect_message(|m| (m.id == 42 && m.payload.is_none()).then_some(m.status))
        .await;
    assert_eq!(status.code, Code::Unimplemented);

    // forward compatibility: the connection survives
    agent.request(43, PingRequest {}).await;
    agent
        .expect(|p| matches!(p, ServerPayload::Pong(_)).then_some(()))
        .await;
    assert!(hub.registry.is_connected(PMM_AGENT));
}

#[tokio::test]
async fn test_collect_forwards_telemetry() {
    let hub = test_hub(quiet_settings()).await;
    let mut events = hub.events.subscribe();
    let mut agent = connect(&hub, PMM_AGENT);

    agent
        .request(
            3,
            CollectRequest {
                buckets: vec![TelemetryBucket {
                    agent_id: PMM_AGENT.to_string(),
                    collected_at: Utc::now(),
                    metrics: empty_metrics(),
                }],
            },
        )
        .await;

    let bucket = next_event(&mut events, |e| match e {
        HubEvent::Telemetry(bucket) => Some(bucket),
        _ => None,
    })
    .await;
    assert_eq!(bucket.metrics, empty_metrics());

    agent
        .expect(|p| matches!(p, ServerPayload::Collect(_)).then_some(()))
        .await;
}

#[tokio::test]
async fn test_action_result_is_recorded() {
    let hub = test_hub(quiet_settings()).await;
    let mut agent = connect(&hub, PMM_AGENT);

    agent
        .request(
            5,
            ActionResultRequest {
                action_id: "/action_id/abc".to_string(),
                output: "42 rows".to_string(),
                done: true,
                error: String::new(),
            },
        )
        .await;
    agent
        .expect(|p| matches!(p, ServerPayload::ActionResult(_)).then_some(()))
        .await;

    let result = hub.store.find_action_result("/action_id/abc").await.unwrap();
    assert!(result.done);
    assert_eq!(result.output, "42 rows");
    assert_eq!(result.pmm_agent_id, PMM_AGENT);
}

#[tokio::test]
async fn test_failed_job_result_publishes_job_failed() {
    let hub = test_hub(quiet_settings()).await;
    let jobs = JobsService::new(hub.handler.clone());
    let mut events = hub.events.subscribe();
    let mut agent = connect(&hub, PMM_AGENT);

    let job = jobs
        .create_job(
            PMM_AGENT,
            JobData::Echo {
                message: "hello".to_string(),
                delay: Duration::ZERO,
            },
            Duration::from_secs(10),
            RetryPolicy::default(),
        )
        .await
        .unwrap();

    agent
        .request(
            9,
            JobResultRequest {
                job_id: job.id.clone(),
                timestamp: Utc::now(),
                result: JobOutcome::Error {
                    message: "disk full".to_string(),
                },
            },
        )
        .await;

    let (job_id, message) = next_event(&mut events, |e| match e {
        HubEvent::JobFailed {
            job_id, message, ..
        } => Some((job_id, message)),
        _ => None,
    })
    .await;
    assert_eq!(job_id, job.id);
    assert_eq!(message, "disk full");

    agent
        .expect(|p| matches!(p, ServerPayload::JobResult(_)).then_some(()))
        .await;
    let stored = hub.store.find_job(&job.id).await.unwrap();
    assert!(stored.done);
    assert_eq!(stored.error, "disk full");
}

#[tokio::test]
async fn test_mismatched_job_result_leaves_job_running() {
    let hub = test_hub(quiet_settings()).await;
    let jobs = JobsService::new(hub.handler.clone());
    let mut agent = connect(&hub, PMM_AGENT);

    let job = jobs
        .create_job(
            PMM_AGENT,
            JobData::Echo {
                message: "hello".to_string(),
                delay: Duration::ZERO,
            },
            Duration::ZERO,
            RetryPolicy::default(),
        )
        .await
        .unwrap();

    agent
        .request(
            11,
            JobResultRequest {
                job_id: job.id.clone(),
                timestamp: Utc::now(),
                result: JobOutcome::MysqlBackup,
            },
        )
        .await;
    agent
        .expect(|p| matches!(p, ServerPayload::JobResult(_)).then_some(()))
        .await;

    assert!(!hub.store.find_job(&job.id).await.unwrap().done);
}

#[tokio::test]
async fn test_job_progress_is_appended_to_logs() {
    let hub = test_hub(quiet_settings()).await;
    let mut agent = connect(&hub, PMM_AGENT);

    for (chunk_id, data) in ["copying", "done"].iter().enumerate() {
        agent
            .request(
                20 + chunk_id as u32,
                JobProgressRequest {
                    job_id: "/job_id/1".to_string(),
                    timestamp: Utc::now(),
                    chunk_id: chunk_id as u32,
                    data: data.to_string(),
                    done: chunk_id == 1,
                },
            )
            .await;
        agent
            .expect(|p| matches!(p, ServerPayload::JobProgress(_)).then_some(()))
            .await;
    }

    let logs = hub.store.job_logs("/job_id/1").await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].data, "copying");
    assert!(logs[1].last_chunk);
}

#[tokio::test]
async fn test_start_action_returns_embedded_error() {
    let hub = test_hub(quiet_settings()).await;
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

    let response = hub
        .handler
        .start_action(
            PMM_AGENT,
            "/action_id/1",
            ActionParams::ProcessSummary { args: vec![] },
            None,
        )
        .await
        .unwrap();

    assert_eq!(response.error, "boom");
    assert!(!hub.registry.get(PMM_AGENT).unwrap().channel().is_closed());
}

#[tokio::test]
async fn test_command_to_absent_agent_fails_fast() {
    let hub = test_hub(quiet_settings()).await;

    let result = hub.handler.stop_job("nobody", "/job_id/1").await;
    assert_matches!(result, Err(Error::NotConnected(id)) if id == "nobody");
}

#[tokio::test]
async fn test_silent_agent_hits_command_deadline() {
    let hub = test_hub(quiet_settings()).await;
    let _agent = connect_with(
        &hub,
        PMM_AGENT,
        Box::new(|payload| match payload {
            ServerPayload::JobStatus(_) => None,
            other => default_reply(other),
        }),
    );
    assert!(eventually(|| hub.registry.is_connected(PMM_AGENT)).await);

    let result = hub.handler.job_status(PMM_AGENT, "/job_id/1").await;
    assert_matches!(
        result,
        Err(Error::Channel(ChannelError::DeadlineExceeded(_)))
    );
    assert!(hub.registry.is_connected(PMM_AGENT));
}

#[tokio::test]
async fn test_remote_error_status_is_returned() {
    let hub = test_hub(quiet_settings()).await;
    let mut agent = connect_with(
        &hub,
        PMM_AGENT,
        Box::new(|payload| match payload {
            ServerPayload::StopJob(_) => None,
            other => default_reply(other),
        }),
    );
    assert!(eventually(|| hub.registry.is_connected(PMM_AGENT)).await);

    let call = {
        let handler = hub.handler.clone();
        tokio::spawn(async move { handler.stop_job(PMM_AGENT, "/job_id/1").await })
    };

    let id = agent
        .expect_message(|m| matches!(m.payload, Some(ServerPayload::StopJob(_))).then_some(m.id))
        .await;
    assert!(
        agent
            .sender
            .send(AgentMessage {
                id,
                status: Status::new(Code::NotFound, "no such job"),
                payload: None,
            })
            .await
    );

    let error = call.await.unwrap().unwrap_err();
    assert_eq!(error.code(), Code::NotFound);
    assert_matches!(
        error,
        Error::Channel(ChannelError::Remote(status)) if status.message == "no such job"
    );
}

#[tokio::test]
async fn test_startup_reset_skips_connected_agents() {
    let hub = test_hub(quiet_settings()).await;
    hub.store
        .update_agent_status(MYSQLD_EXPORTER, AgentStatus::Running, Some(42000))
        .await
        .unwrap();

    hub.handler.set_all_agents_status_unknown().await.unwrap();
    let exporter = hub.store.find_agent(MYSQLD_EXPORTER).await.unwrap();
    assert_eq!(exporter.status, Some(AgentStatus::Unknown));

    let _agent = connect(&hub, PMM_AGENT);
    assert!(eventually(|| hub.registry.is_connected(PMM_AGENT)).await);
    hub.store
        .update_agent_status(MYSQLD_EXPORTER, AgentStatus::Running, Some(42000))
        .await
        .unwrap();

    hub.handler.set_all_agents_status_unknown().await.unwrap();
    let exporter = hub.store.find_agent(MYSQLD_EXPORTER).await.unwrap();
    assert_eq!(exporter.status, Some(AgentStatus::Running));
}
