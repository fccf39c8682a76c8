//! Events published by the control plane
//!
//! Events are broadcast notifications. Subscribers that fall behind lose the
//! oldest events, which is fine for dashboards and for the job retry loop
//! (a dropped failure just means no automatic retry).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::agents::proto::TelemetryBucket;
use crate::storage::schema::AgentStatus;

const EVENT_BUS_CAPACITY: usize = 1024;

/// Something that happened to an agent or one of its jobs
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    /// An agent finished its handshake
    Connected {
        agent_id: String,
        timestamp: DateTime<Utc>,
    },

    /// An agent connection ended
    Disconnected {
        agent_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A supervised agent reported a new status
    AgentStatus {
        agent_id: String,
        pmm_agent_id: Option<String>,
        status: AgentStatus,
        timestamp: DateTime<Utc>,
    },

    /// Telemetry forwarded by an agent
    Telemetry(TelemetryBucket),

    /// A job reported an error and may be retried
    JobFailed {
        job_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

/// Fan-out of [`HubEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HubEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: HubEvent) {
        if self.tx.send(event).is_err() {
            trace!("no event subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Destination for telemetry agents push to the hub
#[async_trait]
pub trait TelemetryCollector: Send + Sync {
    async fn collect(&self, agent_id: &str, buckets: Vec<TelemetryBucket>) -> anyhow::Result<()>;
}

/// Collector that republishes every bucket on the event bus
pub struct BroadcastCollector {
    events: EventBus,
}

impl BroadcastCollector {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }
}

#[async_trait]
impl TelemetryCollector for BroadcastCollector {
    async fn collect(&self, agent_id: &str, buckets: Vec<TelemetryBucket>) -> anyhow::Result<()> {
        trace!("{agent_id} sent {} telemetry buckets", buckets.len());
        for bucket in buckets {
            self.events.publish(HubEvent::Telemetry(bucket));
        }
        Ok(())
    }
}
