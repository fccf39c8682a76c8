//! Registry of connected agents.
//!
//! The registry owns the agent id → connection mapping and runs the
//! per-connection loop. At most one connection per agent id is live: a new
//! connection kicks the previous one.
//!
//! ## Per-connection tasks
//!
//! ```text
//! Registry::run ─┬─ Channel receiver task (inside Channel)
//!                ├─ dispatch loop (the run future itself)
//!                │    heartbeat tick → ping task (one in flight)
//!                │    kick / shutdown → exit
//!                │    agent request  → RequestHandler::handle_request
//!                └─ state coalescing task
//!                     dirty → sleep(delay) → RequestHandler::push_state
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::auth;
use super::channel::{AgentRequest, Channel, ChannelError};
use super::metrics::AgentMetrics;
use super::proto::{
    AgentConnectMetadata, AgentResponsePayload, PingRequest, ServerConnectMetadata,
};
use super::transport::{MessageSink, MessageSource};
use crate::error::{Error, Result};
use crate::events::{EventBus, HubEvent};
use crate::storage::Store;
use crate::storage::schema::AgentStatus;

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_STATE_UPDATE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    /// Interval between hub initiated pings. Also the ping deadline.
    pub heartbeat_interval: Duration,

    /// How long state update requests are collected before one push.
    pub state_update_delay: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            state_update_delay: DEFAULT_STATE_UPDATE_DELAY,
        }
    }
}

/// Lifecycle of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Registered,
    Running,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The agent ended the stream or the stream failed.
    Done,
    Kicked,
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Done => "done",
            DisconnectReason::Kicked => "kicked",
            DisconnectReason::Shutdown => "shutdown",
        }
    }
}

/// How a registered connection ended.
#[derive(Debug, Clone, PartialEq)]
pub struct Disconnect {
    pub reason: DisconnectReason,
    /// Channel failure, if the stream did not end cleanly.
    pub error: Option<ChannelError>,
}

/// Result of a hub initiated ping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingOutcome {
    pub roundtrip: Duration,
    /// Agent clock minus hub clock in seconds.
    pub clock_drift: f64,
}

/// Application side of a connection.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one agent request. Must answer it through the channel.
    async fn handle_request(&self, conn: &AgentConnection, request: AgentRequest);

    /// Send the desired state to the agent.
    async fn push_state(&self, conn: &AgentConnection) -> Result<()>;
}

pub struct AgentConnection {
    id: String,
    serial: u64,
    node_id: String,
    version: String,
    connected_at: DateTime<Utc>,
    channel: Arc<Channel>,
    kick: CancellationToken,
    state_dirty: mpsc::Sender<()>,
    state: Mutex<ConnectionState>,
}

impl AgentConnection {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// Mark the state dirty. A mark while one is pending is a no-op.
    pub fn request_state_update(&self) {
        if let Err(mpsc::error::TrySendError::Closed(_)) = self.state_dirty.try_send(()) {
            trace!(agent = %self.id, "state update loop is gone");
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        let metrics = self.channel.metrics();
        ConnectionInfo {
            agent_id: self.id.clone(),
            node_id: self.node_id.clone(),
            version: self.version.clone(),
            connected_at: self.connected_at,
            state: self.state(),
            messages_sent: metrics.sent,
            messages_received: metrics.received,
            pending_responses: metrics.responses,
            queued_requests: metrics.requests,
        }
    }
}

/// Point-in-time view of a connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub agent_id: String,
    pub node_id: String,
    pub version: String,
    pub connected_at: DateTime<Utc>,
    pub state: ConnectionState,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub pending_responses: usize,
    pub queued_requests: usize,
}

pub struct Registry {
    store: Store,
    metrics: AgentMetrics,
    events: EventBus,
    settings: RegistrySettings,
    agents: RwLock<HashMap<String, Arc<AgentConnection>>>,
    next_serial: AtomicU64,
    shutdown: CancellationToken,
}

impl Registry {
    pub fn new(
        store: Store,
        metrics: AgentMetrics,
        events: EventBus,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            store,
            metrics,
            events,
            settings,
            agents: RwLock::new(HashMap::new()),
            next_serial: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn metrics(&self) -> &AgentMetrics {
        &self.metrics
    }

    pub fn settings(&self) -> RegistrySettings {
        self.settings
    }

    /// Serve one accepted agent stream until it should end.
    ///
    /// Authentication failures return an error and leave nothing behind.
    /// Once registered, the entry is removed before this returns.
    #[instrument(skip_all, fields(agent = %metadata.id))]
    pub async fn run(
        &self,
        metadata: AgentConnectMetadata,
        mut sink: Box<dyn MessageSink>,
        source: Box<dyn MessageSource>,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Disconnect> {
        let node_id = match auth::authenticate(&self.store, &metadata).await {
            Ok(node_id) => node_id,
            Err(e) => {
                warn!("rejecting connection: {e}");
                self.metrics.disconnected("unauthenticated");
                return Err(e.into());
            }
        };

        let handshake = ServerConnectMetadata {
            agent_runs_on_node_id: node_id.clone(),
            server_version: SERVER_VERSION.to_string(),
        };
        sink.send_handshake(&handshake)
            .await
            .map_err(ChannelError::from)?;

        let (conn, dirty_rx) = self.register(&metadata, node_id, sink, source);
        let registration = Registration {
            registry: self,
            conn: conn.clone(),
        };
        info!("agent connected");
        self.events.publish(HubEvent::Connected {
            agent_id: conn.id.clone(),
            timestamp: Utc::now(),
        });

        let mut tasks = JoinSet::new();
        tasks.spawn(coalesce_state_updates(
            conn.clone(),
            dirty_rx,
            handler.clone(),
            self.settings.state_update_delay,
        ));
        conn.set_state(ConnectionState::Running);
        conn.request_state_update();

        let reason = self.dispatch(&conn, handler.as_ref(), &mut tasks).await;
        conn.set_state(ConnectionState::Terminated);
        if reason != DisconnectReason::Done {
            conn.channel.terminate(reason.as_str());
        }
        drop(registration);
        tasks.shutdown().await;
        self.release_metrics(&conn.id);

        let error = match reason {
            DisconnectReason::Done => conn.channel.wait().await.err(),
            DisconnectReason::Kicked | DisconnectReason::Shutdown => None,
        };

        match &error {
            Some(e) => warn!("agent disconnected: {e}"),
            None => info!("agent disconnected: {}", reason.as_str()),
        }
        self.metrics.disconnected(reason.as_str());
        self.events.publish(HubEvent::Disconnected {
            agent_id: conn.id.clone(),
            reason: reason.as_str().to_string(),
            timestamp: Utc::now(),
        });

        if reason == DisconnectReason::Done {
            self.mark_children_done(&conn.id).await;
        }

        Ok(Disconnect { reason, error })
    }

    fn register(
        &self,
        metadata: &AgentConnectMetadata,
        node_id: String,
        sink: Box<dyn MessageSink>,
        source: Box<dyn MessageSource>,
    ) -> (Arc<AgentConnection>, mpsc::Receiver<()>) {
        // counters are created under the lock, see release_metrics
        let mut agents = self.agents.write();
        let channel = Channel::new(
            metadata.id.clone(),
            sink,
            source,
            self.metrics.channel_counters(&metadata.id),
        );
        let (state_dirty, dirty_rx) = mpsc::channel(1);

        let conn = Arc::new(AgentConnection {
            id: metadata.id.clone(),
            serial: self.next_serial.fetch_add(1, Ordering::Relaxed),
            node_id,
            version: metadata.version.clone(),
            connected_at: Utc::now(),
            channel,
            kick: CancellationToken::new(),
            state_dirty,
            state: Mutex::new(ConnectionState::Registered),
        });

        if let Some(previous) = agents.insert(conn.id.clone(), conn.clone()) {
            warn!("another connection for this agent exists, kicking it");
            previous.kick.cancel();
        }
        self.metrics.set_connected(agents.len());

        (conn, dirty_rx)
    }

    fn unregister(&self, conn: &AgentConnection) {
        let mut agents = self.agents.write();
        if agents.get(&conn.id).is_some_and(|c| c.serial == conn.serial) {
            agents.remove(&conn.id);
            self.metrics.set_connected(agents.len());
        }
    }

    /// Drop the per-agent metric series unless the agent has reconnected.
    fn release_metrics(&self, agent_id: &str) {
        let agents = self.agents.read();
        if !agents.contains_key(agent_id) {
            self.metrics.forget_agent(agent_id);
        }
    }

    async fn dispatch(
        &self,
        conn: &Arc<AgentConnection>,
        handler: &dyn RequestHandler,
        tasks: &mut JoinSet<()>,
    ) -> DisconnectReason {
        let Some(mut requests) = conn.channel.requests() else {
            warn!("request sequence already taken");
            return DisconnectReason::Done;
        };

        let period = self.settings.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping: Option<AbortHandle> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    while tasks.try_join_next().is_some() {}

                    if ping.as_ref().is_some_and(|p| !p.is_finished()) {
                        debug!("previous ping still in flight");
                        continue;
                    }
                    let conn = conn.clone();
                    let metrics = self.metrics.clone();
                    ping = Some(tasks.spawn(async move {
                        if let Err(e) = ping_agent(&conn, &metrics, period).await {
                            warn!(agent = %conn.id, "ping failed: {e}");
                        }
                    }));
                }

                _ = conn.kick.cancelled() => {
                    warn!("kicked");
                    return DisconnectReason::Kicked;
                }

                _ = self.shutdown.cancelled() => return DisconnectReason::Shutdown,

                request = requests.recv() => match request {
                    Some(request) => handler.handle_request(conn, request).await,
                    None => return DisconnectReason::Done,
                },
            }
        }
    }

    async fn mark_children_done(&self, agent_id: &str) {
        let children = match self.store.find_child_agents(agent_id).await {
            Ok(children) => children,
            Err(e) => {
                warn!("failed to load agents of {agent_id}: {e}");
                return;
            }
        };

        for child in children {
            if let Err(e) = self
                .store
                .update_agent_status(&child.agent_id, AgentStatus::Done, None)
                .await
            {
                warn!("failed to update status of {}: {e}", child.agent_id);
            }
        }
    }

    /// The live connection for `agent_id`.
    pub fn get(&self, agent_id: &str) -> Result<Arc<AgentConnection>> {
        self.agents
            .read()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::NotConnected(agent_id.to_string()))
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.agents.read().contains_key(agent_id)
    }

    pub fn connected(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<_> = self.agents.read().values().map(|c| c.info()).collect();
        infos.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        infos
    }

    /// Remove the agent's connection and make its loop exit.
    ///
    /// Returns `false` if the agent was not connected.
    pub fn kick(&self, agent_id: &str) -> bool {
        let removed = {
            let mut agents = self.agents.write();
            let removed = agents.remove(agent_id);
            self.metrics.set_connected(agents.len());
            removed
        };

        match removed {
            Some(conn) => {
                info!(agent = %agent_id, "kicking agent");
                conn.kick.cancel();
                true
            }
            None => false,
        }
    }

    /// Ask for the agent's desired state to be pushed soon.
    pub fn request_state_update(&self, agent_id: &str) {
        match self.agents.read().get(agent_id) {
            Some(conn) => conn.request_state_update(),
            None => debug!("state update for {agent_id} skipped: not connected"),
        }
    }

    pub async fn ping(&self, agent_id: &str) -> Result<PingOutcome> {
        let conn = self.get(agent_id)?;
        ping_agent(&conn, &self.metrics, self.settings.heartbeat_interval).await
    }

    /// End every connection loop with reason `shutdown`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

struct Registration<'a> {
    registry: &'a Registry,
    conn: Arc<AgentConnection>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.unregister(&self.conn);
        // no-op if the loop already closed it
        self.conn.channel.terminate("connection ended");
        self.registry.release_metrics(&self.conn.id);
    }
}

async fn ping_agent(
    conn: &AgentConnection,
    metrics: &AgentMetrics,
    deadline: Duration,
) -> Result<PingOutcome> {
    let sent_at = Utc::now();
    let start = Instant::now();

    let response = conn
        .channel
        .send_and_wait_response_timeout(PingRequest {}, deadline)
        .await?;
    let roundtrip = start.elapsed();

    let AgentResponsePayload::Pong(pong) = response else {
        return Err(Error::UnexpectedResponse {
            expected: "pong",
            got: response.kind(),
        });
    };

    let half_roundtrip = chrono::Duration::from_std(roundtrip / 2).unwrap_or_default();
    let drift = pong.current_time - (sent_at + half_roundtrip);
    let clock_drift = drift
        .num_microseconds()
        .map_or(0.0, |us| us as f64 / 1_000_000.0);

    metrics.observe_ping(&conn.id, roundtrip.as_secs_f64(), clock_drift);
    debug!(agent = %conn.id, "roundtrip {roundtrip:?}, clock drift {clock_drift:.6}s");

    Ok(PingOutcome {
        roundtrip,
        clock_drift,
    })
}

async fn coalesce_state_updates(
    conn: Arc<AgentConnection>,
    mut dirty: mpsc::Receiver<()>,
    handler: Arc<dyn RequestHandler>,
    delay: Duration,
) {
    while dirty.recv().await.is_some() {
        tokio::time::sleep(delay).await;
        // requests made while sleeping are covered by this push
        while dirty.try_recv().is_ok() {}

        if let Err(e) = handler.push_state(&conn).await {
            warn!(agent = %conn.id, "failed to push state: {e}");
            conn.request_state_update();
        }
    }
}
