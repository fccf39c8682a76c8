//! Prometheus metrics for agent connections.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `guardia_agents_connected` | Gauge | |
//! | `guardia_channel_messages_sent_total` | Counter | `agent_id` |
//! | `guardia_channel_messages_received_total` | Counter | `agent_id` |
//! | `guardia_agents_disconnects_total` | Counter | `reason` |
//! | `guardia_agents_roundtrip_seconds` | Histogram | `agent_id` |
//! | `guardia_agents_clock_drift_seconds` | Histogram | `agent_id` |

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use super::channel::ChannelCounters;

const ROUNDTRIP_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];
const DRIFT_BUCKETS: &[f64] = &[-10.0, -1.0, -0.1, -0.01, 0.0, 0.01, 0.1, 1.0, 10.0];

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

pub type MetricsResult<T> = Result<T, MetricsError>;

#[derive(Clone)]
pub struct AgentMetrics {
    registry: Registry,
    connected: IntGauge,
    messages_sent: IntCounterVec,
    messages_received: IntCounterVec,
    disconnects: IntCounterVec,
    roundtrip: HistogramVec,
    clock_drift: HistogramVec,
}

impl AgentMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let connected = IntGauge::new(
            "guardia_agents_connected",
            "Number of currently connected agents",
        )?;
        registry.register(Box::new(connected.clone()))?;

        let messages_sent = IntCounterVec::new(
            Opts::new(
                "guardia_channel_messages_sent_total",
                "Messages written to agent connections",
            ),
            &["agent_id"],
        )?;
        registry.register(Box::new(messages_sent.clone()))?;

        let messages_received = IntCounterVec::new(
            Opts::new(
                "guardia_channel_messages_received_total",
                "Messages read from agent connections",
            ),
            &["agent_id"],
        )?;
        registry.register(Box::new(messages_received.clone()))?;

        let disconnects = IntCounterVec::new(
            Opts::new(
                "guardia_agents_disconnects_total",
                "Agent disconnects by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(disconnects.clone()))?;

        let roundtrip = HistogramVec::new(
            HistogramOpts::new(
                "guardia_agents_roundtrip_seconds",
                "Round-trip time of hub initiated pings",
            )
            .buckets(ROUNDTRIP_BUCKETS.to_vec()),
            &["agent_id"],
        )?;
        registry.register(Box::new(roundtrip.clone()))?;

        let clock_drift = HistogramVec::new(
            HistogramOpts::new(
                "guardia_agents_clock_drift_seconds",
                "Agent clock minus hub clock, corrected for half the round trip",
            )
            .buckets(DRIFT_BUCKETS.to_vec()),
            &["agent_id"],
        )?;
        registry.register(Box::new(clock_drift.clone()))?;

        Ok(Self {
            registry: registry.clone(),
            connected,
            messages_sent,
            messages_received,
            disconnects,
            roundtrip,
            clock_drift,
        })
    }

    /// Metrics on a private registry, for tests and embedded use.
    pub fn unregistered() -> MetricsResult<Self> {
        Self::new(&Registry::new())
    }

    pub fn channel_counters(&self, agent_id: &str) -> ChannelCounters {
        ChannelCounters {
            sent: Some(self.messages_sent.with_label_values(&[agent_id])),
            received: Some(self.messages_received.with_label_values(&[agent_id])),
        }
    }

    /// Remove the series labelled with `agent_id`.
    pub fn forget_agent(&self, agent_id: &str) {
        for counters in [&self.messages_sent, &self.messages_received] {
            // missing series are fine
            let _ = counters.remove_label_values(&[agent_id]);
        }
        for histograms in [&self.roundtrip, &self.clock_drift] {
            let _ = histograms.remove_label_values(&[agent_id]);
        }
    }

    pub fn set_connected(&self, count: usize) {
        self.connected.set(count as i64);
    }

    pub fn connected(&self) -> i64 {
        self.connected.get()
    }

    pub fn disconnected(&self, reason: &str) {
        self.disconnects.with_label_values(&[reason]).inc();
    }

    pub fn disconnect_count(&self, reason: &str) -> u64 {
        self.disconnects.with_label_values(&[reason]).get()
    }

    pub fn observe_ping(&self, agent_id: &str, roundtrip_secs: f64, drift_secs: f64) {
        self.roundtrip
            .with_label_values(&[agent_id])
            .observe(roundtrip_secs);
        self.clock_drift
            .with_label_values(&[agent_id])
            .observe(drift_secs);
    }

    pub fn ping_count(&self, agent_id: &str) -> u64 {
        self.roundtrip.with_label_values(&[agent_id]).get_sample_count()
    }

    /// Prometheus text exposition of the whole registry.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}
