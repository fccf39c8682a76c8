//! Helper functions for integration tests

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use guardia_control::{
    agents::{
        Disconnect, Handler, HandlerSettings, Registry, RegistrySettings,
        metrics::AgentMetrics,
        proto::{
            AgentConnectMetadata, AgentMessage, AgentPayload, CheckConnectionResponse,
            GetVersionsResponse, JobStatusResponse, LocationConfig, PongResponse,
            S3LocationConfig, ServerMessage, ServerPayload, SetStateResponse, SoftwareVersion,
            StartActionResponse, StartJobResponse, Status, StopActionResponse, StopJobResponse,
        },
        transport::{AgentSender, memory_pair},
    },
    events::{BroadcastCollector, EventBus},
    storage::{
        Store,
        schema::{
            AgentRecord, AgentType, BackupLocation, ServiceCredentials, ServiceRecord, ServiceType,
        },
    },
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const PMM_AGENT: &str = "pmm-agent-1";
pub const NODE: &str = "node-1";
pub const MYSQL_SERVICE: &str = "svc-mysql";
pub const MYSQLD_EXPORTER: &str = "mysqld-exporter-1";
pub const S3_LOCATION: &str = "loc-s3";

/// Settings that keep timers out of the way unless a test wants them.
pub fn quiet_settings() -> RegistrySettings {
    RegistrySettings {
        heartbeat_interval: Duration::from_secs(3600),
        state_update_delay: Duration::from_millis(20),
    }
}

pub struct TestHub {
    pub store: Store,
    pub events: EventBus,
    pub registry: Arc<Registry>,
    pub handler: Arc<Handler>,
}

/// A hub with one pmm-agent running a mysqld exporter for one MySQL service.
pub async fn test_hub(settings: RegistrySettings) -> TestHub {
    let store = Store::in_memory();
    seed_inventory(&store).await;
    test_hub_on(store, settings)
}

/// A hub on top of an already seeded store.
pub fn test_hub_on(store: Store, settings: RegistrySettings) -> TestHub {
    let events = EventBus::new();
    let metrics = AgentMetrics::unregistered().unwrap();
    let registry = Arc::new(Registry::new(
        store.clone(),
        metrics,
        events.clone(),
        settings,
    ));
    let handler = Arc::new(Handler::new(
        registry.clone(),
        store.clone(),
        Arc::new(BroadcastCollector::new(events.clone())),
        events.clone(),
        HandlerSettings {
            state_change_timeout: Duration::from_secs(2),
            command_deadline: Duration::from_secs(2),
        },
    ));

    TestHub {
        store,
        events,
        registry,
        handler,
    }
}

pub async fn seed_inventory(store: &Store) {
    let mut pmm_agent = AgentRecord::new(PMM_AGENT, AgentType::PmmAgent);
    pmm_agent.runs_on_node_id = Some(NODE.to_string());
    store.save_agent(&pmm_agent).await.unwrap();

    let mut exporter = AgentRecord::new(MYSQLD_EXPORTER, AgentType::MysqldExporter);
    exporter.pmm_agent_id = Some(PMM_AGENT.to_string());
    exporter.service_id = Some(MYSQL_SERVICE.to_string());
    store.save_agent(&exporter).await.unwrap();

    store
        .save_service(&ServiceRecord {
            service_id: MYSQL_SERVICE.to_string(),
            service_type: ServiceType::Mysql,
            name: "orders".to_string(),
            node_id: NODE.to_string(),
            address: Some("127.0.0.1".to_string()),
            port: Some(3306),
            socket: None,
        })
        .await
        .unwrap();
    store
        .save_credentials(
            MYSQL_SERVICE,
            &ServiceCredentials {
                username: "pmm".to_string(),
                password: "hunter2".to_string(),
                tls_skip_verify: false,
            },
        )
        .await
        .unwrap();

    store
        .save_backup_location(&BackupLocation {
            id: S3_LOCATION.to_string(),
            name: "backups".to_string(),
            config: LocationConfig::S3(S3LocationConfig {
                endpoint: "https://s3.example.com".to_string(),
                access_key: "access".to_string(),
                secret_key: "secret".to_string(),
                bucket_name: "bucket".to_string(),
                bucket_region: "eu-west-1".to_string(),
            }),
        })
        .await
        .unwrap();
}

pub fn metadata(agent_id: &str) -> AgentConnectMetadata {
    AgentConnectMetadata {
        id: agent_id.to_string(),
        version: "2.41.0".to_string(),
    }
}

type Responder = Box<dyn Fn(&ServerPayload) -> Option<AgentPayload> + Send>;

/// Agent side of a connection served by a background task.
pub struct FakeAgent {
    /// Every message the hub sent, in order
    pub seen: mpsc::UnboundedReceiver<ServerMessage>,
    pub sender: AgentSender,
    pub run: JoinHandle<guardia_control::Result<Disconnect>>,
    task: JoinHandle<()>,
}

impl FakeAgent {
    /// Send an agent-initiated request.
    pub async fn request(&self, id: u32, payload: impl Into<AgentPayload>) {
        assert!(
            self.sender
                .send(AgentMessage {
                    id,
                    status: Status::ok(),
                    payload: Some(payload.into()),
                })
                .await
        );
    }

    /// Wait for the next message matching `pick`, skipping others.
    pub async fn expect_message<T>(&mut self, pick: impl Fn(ServerMessage) -> Option<T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let message = self.seen.recv().await.expect("agent stream ended");
                if let Some(found) = pick(message) {
                    return found;
                }
            }
        })
        .await
        .expect("timed out waiting for message")
    }

    /// Wait for the next payload matching `pick`, skipping others.
    pub async fn expect<T>(&mut self, pick: impl Fn(ServerPayload) -> Option<T>) -> T {
        self.expect_message(|message| message.payload.and_then(&pick))
            .await
    }

    /// Payloads received so far that match `pick`, without waiting.
    pub fn drain_matching(&mut self, pick: impl Fn(&ServerPayload) -> bool) -> usize {
        let mut count = 0;
        while let Ok(message) = self.seen.try_recv() {
            if message.payload.as_ref().is_some_and(&pick) {
                count += 1;
            }
        }
        count
    }

    /// Close the agent's end of the stream.
    pub fn disconnect(self) -> JoinHandle<guardia_control::Result<Disconnect>> {
        self.task.abort();
        self.run
    }
}

/// Connect `agent_id` and answer hub requests with [`default_reply`].
pub fn connect(hub: &TestHub, agent_id: &str) -> FakeAgent {
    connect_with(hub, agent_id, Box::new(default_reply))
}

pub fn connect_with(hub: &TestHub, agent_id: &str, respond: Responder) -> FakeAgent {
    let (sink, source, mut end) = memory_pair();
    let sender = end.sender();

    let registry = hub.registry.clone();
    let handler = hub.handler.clone();
    let metadata = metadata(agent_id);
    let run = tokio::spawn(async move {
        registry
            .run(metadata, Box::new(sink), Box::new(source), handler)
            .await
    });

    let (seen_tx, seen) = mpsc::unbounded_channel();
    let replies = end.sender();
    let task = tokio::spawn(async move {
        while let Some(message) = end.recv_message().await {
            let id = message.id;
            let reply = message.payload.as_ref().and_then(|payload| respond(payload));
            let _ = seen_tx.send(message);
            if let Some(reply) = reply {
                replies
                    .send(AgentMessage {
                        id,
                        status: Status::ok(),
                        payload: Some(reply),
                    })
                    .await;
            }
        }
    });

    FakeAgent {
        seen,
        sender,
        run,
        task,
    }
}

/// A well-behaved agent: acknowledges everything, runs nothing.
pub fn default_reply(payload: &ServerPayload) -> Option<AgentPayload> {
    let reply = match payload {
        ServerPayload::Ping(_) => AgentPayload::Pong(PongResponse {
            current_time: Utc::now(),
        }),
        ServerPayload::SetState(_) => AgentPayload::SetState(SetStateResponse {}),
        ServerPayload::StartAction(_) => AgentPayload::StartAction(StartActionResponse::default()),
        ServerPayload::StopAction(_) => AgentPayload::StopAction(StopActionResponse {}),
        ServerPayload::StartJob(_) => AgentPayload::StartJob(StartJobResponse::default()),
        ServerPayload::StopJob(_) => AgentPayload::StopJob(StopJobResponse {}),
        ServerPayload::JobStatus(_) => AgentPayload::JobStatus(JobStatusResponse { alive: true }),
        ServerPayload::CheckConnection(_) => {
            AgentPayload::CheckConnection(CheckConnectionResponse::default())
        }
        ServerPayload::GetVersions(request) => AgentPayload::GetVersions(GetVersionsResponse {
            versions: request
                .softwares
                .iter()
                .map(|_| SoftwareVersion {
                    version: "8.0.36".to_string(),
                    error: String::new(),
                })
                .collect(),
        }),
        // answers to our own requests
        _ => return None,
    };
    Some(reply)
}

/// Poll until `check` holds or a second has passed.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
