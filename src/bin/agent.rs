//! Reference agent.
//!
//! Connects to the hub, answers its requests and pushes host telemetry.
//! Only echo jobs and process summaries are actually executed; everything
//! that needs a database reports an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use futures::{SinkExt, StreamExt};
use guardia_control::{
    ComponentInformation, ComponentOverview, CpuInformation, CpuOverview, MemoryInformation,
    ServerMetrics, SystemInformation,
    agents::proto::{
        ActionParams, ActionResultRequest, AgentMessage, AgentPayload, CheckConnectionResponse,
        Code, CollectRequest, GetVersionsResponse, JobOutcome, JobResultRequest, JobSpec,
        JobStatusResponse, PingRequest, PongResponse, ServerFrame, ServerMessage, ServerPayload,
        SetStateRequest, SetStateResponse, SoftwareVersion, StartActionRequest,
        StartActionResponse, StartJobRequest, StartJobResponse, StateChangedRequest, Status,
        StopActionResponse, StopJobResponse, TelemetryBucket,
    },
    storage::schema::AgentStatus,
    util::get_hub_url,
};
use parking_lot::Mutex;
use sysinfo::{Components, System};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::{
    Message,
    client::IntoClientRequest,
    http::HeaderValue,
};
use tracing::{debug, error, info, instrument, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

const OUTBOX_CAPACITY: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const FIRST_EXPORTER_PORT: u16 = 42000;

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Agent id registered in the hub inventory
    #[arg(short, long)]
    id: String,

    /// Hub agent endpoint, defaults to `HUB_URL`
    #[arg(short, long)]
    url: Option<String>,

    /// Seconds between telemetry pushes
    #[arg(long, default_value_t = 30)]
    interval: u64,
}

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![
        ("guardia_agent", tracing::metadata::LevelFilter::TRACE),
        ("guardia_control", tracing::metadata::LevelFilter::DEBUG),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(true),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    let url = args.url.clone().unwrap_or_else(get_hub_url);

    loop {
        match run(&args, &url).await {
            Ok(()) => info!("hub closed the connection"),
            Err(e) => error!("connection failed: {e:#}"),
        }
        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn run(args: &Args, url: &str) -> anyhow::Result<()> {
    let mut request = url.into_client_request()?;
    let headers = request.headers_mut();
    headers.insert("x-agent-id", HeaderValue::from_str(&args.id)?);
    headers.insert(
        "x-agent-version",
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );

    let (stream, _) = tokio_tungstenite::connect_async(request)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    let (mut write, mut read) = stream.split();

    let (tx, mut rx) = mpsc::channel::<AgentMessage>(OUTBOX_CAPACITY);
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    error!("failed to encode message: {e}");
                    continue;
                }
            };
            if write.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let agent = Arc::new(Agent::new(args.id.clone(), tx));
    let telemetry = tokio::spawn(agent.clone().push_telemetry(Duration::from_secs(args.interval)));

    let result = async {
        while let Some(message) = read.next().await {
            let text = match message? {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            match serde_json::from_str::<ServerFrame>(&text) {
                Ok(ServerFrame::Handshake(metadata)) => info!(
                    "connected to hub {} as agent on node {}",
                    metadata.server_version, metadata.agent_runs_on_node_id
                ),
                Ok(ServerFrame::Message(message)) => agent.clone().handle(message).await,
                Err(e) => warn!("malformed frame from hub: {e}"),
            }
        }
        anyhow::Ok(())
    }
    .await;

    telemetry.abort();
    agent.stop_all_jobs();
    writer.abort();
    result
}

struct Agent {
    id: String,
    tx: mpsc::Sender<AgentMessage>,
    next_id: AtomicU32,
    jobs: Mutex<HashMap<String, AbortHandle>>,
}

impl Agent {
    fn new(id: String, tx: mpsc::Sender<AgentMessage>) -> Self {
        Self {
            id,
            tx,
            next_id: AtomicU32::new(1),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    async fn reply(&self, id: u32, payload: impl Into<AgentPayload>) {
        self.write(AgentMessage {
            id,
            status: Status::ok(),
            payload: Some(payload.into()),
        })
        .await;
    }

    async fn request(&self, payload: impl Into<AgentPayload>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.write(AgentMessage {
            id,
            status: Status::ok(),
            payload: Some(payload.into()),
        })
        .await;
    }

    async fn write(&self, message: AgentMessage) {
        if self.tx.send(message).await.is_err() {
            debug!("connection gone, dropping message");
        }
    }

    #[instrument(skip_all, fields(id = message.id))]
    async fn handle(self: Arc<Self>, message: ServerMessage) {
        let id = message.id;
        let Some(payload) = message.payload else {
            if !message.status.is_ok() {
                warn!("hub answered request {id} with {}", message.status);
            }
            return;
        };

        match payload {
            ServerPayload::Ping(_) => {
                self.reply(
                    id,
                    PongResponse {
                        current_time: Utc::now(),
                    },
                )
                .await
            }
            ServerPayload::SetState(state) => self.set_state(id, state).await,
            ServerPayload::StartAction(request) => self.start_action(id, request).await,
            ServerPayload::StopAction(request) => {
                debug!("stop action {}", request.action_id);
                self.reply(id, StopActionResponse {}).await
            }
            ServerPayload::StartJob(request) => self.start_job(id, request).await,
            ServerPayload::StopJob(request) => {
                if let Some(job) = self.jobs.lock().remove(&request.job_id) {
                    job.abort();
                }
                self.reply(id, StopJobResponse {}).await
            }
            ServerPayload::JobStatus(request) => {
                let alive = self.jobs.lock().contains_key(&request.job_id);
                self.reply(id, JobStatusResponse { alive }).await
            }
            ServerPayload::CheckConnection(request) => {
                let response = CheckConnectionResponse {
                    error: format!(
                        "{} checks are not supported by this agent",
                        request.service_type
                    ),
                    stats: None,
                };
                self.reply(id, response).await
            }
            ServerPayload::GetVersions(request) => {
                let versions = request
                    .softwares
                    .iter()
                    .map(|software| SoftwareVersion {
                        version: String::new(),
                        error: format!("{software:?} is not installed"),
                    })
                    .collect();
                self.reply(id, GetVersionsResponse { versions }).await
            }
            ServerPayload::Unknown => {
                self.write(AgentMessage {
                    id,
                    status: Status::new(Code::Unimplemented, "unsupported request"),
                    payload: None,
                })
                .await
            }
            // answers to our own requests
            ServerPayload::Pong(pong) => trace!("hub time is {}", pong.current_time),
            ServerPayload::StateChanged(_)
            | ServerPayload::Collect(_)
            | ServerPayload::ActionResult(_)
            | ServerPayload::JobResult(_)
            | ServerPayload::JobProgress(_) => trace!("request {id} acknowledged"),
        }
    }

    /// Acknowledge the state and report every agent as running.
    async fn set_state(&self, id: u32, state: SetStateRequest) {
        info!(
            "received state: {} processes, {} builtin agents",
            state.agent_processes.len(),
            state.builtin_agents.len()
        );
        self.reply(id, SetStateResponse {}).await;

        let processes = state.agent_processes.keys().zip(FIRST_EXPORTER_PORT..);
        let builtins = state.builtin_agents.keys().map(|agent_id| (agent_id, 0));
        for (agent_id, listen_port) in processes.chain(builtins) {
            self.request(StateChangedRequest {
                agent_id: agent_id.clone(),
                status: AgentStatus::Running,
                listen_port,
                process_exec_path: None,
            })
            .await;
        }
    }

    async fn start_action(&self, id: u32, request: StartActionRequest) {
        let ActionParams::ProcessSummary { args } = request.params else {
            self.reply(
                id,
                StartActionResponse {
                    error: "action is not supported by this agent".to_string(),
                },
            )
            .await;
            return;
        };

        self.reply(id, StartActionResponse::default()).await;
        let output = process_summary(&args);
        self.request(ActionResultRequest {
            action_id: request.action_id,
            output,
            done: true,
            error: String::new(),
        })
        .await;
    }

    async fn start_job(self: Arc<Self>, id: u32, request: StartJobRequest) {
        let JobSpec::Echo { message, delay } = request.job else {
            self.reply(
                id,
                StartJobResponse {
                    error: "job is not supported by this agent".to_string(),
                },
            )
            .await;
            return;
        };

        let job_id = request.job_id.clone();
        let timeout = request.timeout;
        let agent = self.clone();
        let task = tokio::spawn(async move {
            let result = match timeout {
                Some(timeout) if timeout < delay => JobOutcome::Error {
                    message: "job timed out".to_string(),
                },
                _ => JobOutcome::Echo { message },
            };
            tokio::time::sleep(timeout.map_or(delay, |t| t.min(delay))).await;

            agent.jobs.lock().remove(&job_id);
            agent
                .request(JobResultRequest {
                    job_id,
                    timestamp: Utc::now(),
                    result,
                })
                .await;
        });

        self.jobs
            .lock()
            .insert(request.job_id, task.abort_handle());
        self.reply(id, StartJobResponse::default()).await;
    }

    fn stop_all_jobs(&self) {
        for (_, job) in self.jobs.lock().drain() {
            job.abort();
        }
    }

    async fn push_telemetry(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.request(PingRequest {}).await;

            let metrics = match tokio::task::spawn_blocking(collect_metrics).await {
                Ok(metrics) => metrics,
                Err(e) => {
                    error!("failed to collect metrics: {e}");
                    continue;
                }
            };
            self.request(CollectRequest {
                buckets: vec![TelemetryBucket {
                    agent_id: self.id.clone(),
                    collected_at: Utc::now(),
                    metrics,
                }],
            })
            .await;
        }
    }
}

fn process_summary(args: &[String]) -> String {
    let mut sys = System::new_all();
    sys.refresh_all();

    let mut lines = vec![format!(
        "host {} up {}s, {} processes",
        System::host_name().unwrap_or_default(),
        System::uptime(),
        sys.processes().len()
    )];
    if !args.is_empty() {
        lines.push(format!("args: {}", args.join(" ")));
    }
    lines.join("\n")
}

/// Blocks for the minimum CPU sampling interval.
fn collect_metrics() -> ServerMetrics {
    let mut sys = System::new_all();
    sys.refresh_all();
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_all();

    let cpus = sys.cpus();
    let components = Components::new_with_refreshed_list();

    ServerMetrics {
        system: SystemInformation {
            name: System::name(),
            kernel_version: System::kernel_version(),
            os_version: System::os_version(),
            host_name: System::host_name(),
        },
        memory: MemoryInformation {
            total: sys.total_memory(),
            used: sys.used_memory(),
            total_swap: sys.total_swap(),
            used_swap: sys.used_swap(),
        },
        cpus: {
            let cpu_usage_sum = cpus.iter().map(|cpu| cpu.cpu_usage()).sum::<f32>();

            CpuOverview {
                total: cpus.len(),
                arch: System::cpu_arch(),
                average_usage: cpu_usage_sum / cpus.len().max(1) as f32,
                cpus: cpus
                    .iter()
                    .map(|cpu| CpuInformation {
                        name: cpu.name().to_string(),
                        frequency: cpu.frequency(),
                        usage: cpu.cpu_usage(),
                    })
                    .collect(),
            }
        },
        components: {
            let temperatures: Vec<f32> = components
                .iter()
                .filter_map(|component| component.temperature())
                .collect();

            ComponentOverview {
                average_temperature: (!temperatures.is_empty())
                    .then(|| temperatures.iter().sum::<f32>() / temperatures.len() as f32),
                components: components
                    .iter()
                    .map(|component| ComponentInformation {
                        name: component.label().to_string(),
                        temperature: component.temperature(),
                    })
                    .collect(),
            }
        },
    }
}
