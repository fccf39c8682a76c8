//! Transport seam between a [`Channel`](super::channel::Channel) and the
//! wire.
//!
//! A transport is split into a write half ([`MessageSink`]) and a read half
//! ([`MessageSource`]) so the channel can write from caller tasks while its
//! receiver task owns the read side. The WebSocket implementation lives in
//! `api::agent_ws`; this module provides an in-memory pair.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::proto::{AgentMessage, ServerConnectMetadata, ServerFrame, ServerMessage};

const MEMORY_TRANSPORT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("failed to send message: {0}")]
    Send(String),

    #[error("failed to receive message: {0}")]
    Receive(String),

    #[error("malformed frame: {0}")]
    Decode(String),
}

/// Write half of an agent stream.
#[async_trait]
pub trait MessageSink: Send + 'static {
    async fn send(&mut self, message: &ServerMessage) -> Result<(), TransportError>;

    /// Sent exactly once, before any message.
    async fn send_handshake(&mut self, metadata: &ServerConnectMetadata)
    -> Result<(), TransportError>;
}

/// Read half of an agent stream. `None` means the peer ended the stream.
#[async_trait]
pub trait MessageSource: Send + 'static {
    async fn recv(&mut self) -> Option<Result<AgentMessage, TransportError>>;
}

/// Hub side write half of an in-memory stream.
pub struct MemorySink {
    tx: mpsc::Sender<ServerFrame>,
}

/// Hub side read half of an in-memory stream.
pub struct MemorySource {
    rx: mpsc::Receiver<Result<AgentMessage, TransportError>>,
}

/// The agent's end of an in-memory stream.
pub struct AgentEnd {
    tx: mpsc::Sender<Result<AgentMessage, TransportError>>,
    rx: mpsc::Receiver<ServerFrame>,
}

/// Create a connected in-memory stream.
pub fn memory_pair() -> (MemorySink, MemorySource, AgentEnd) {
    let (to_agent, from_hub) = mpsc::channel(MEMORY_TRANSPORT_CAPACITY);
    let (to_hub, from_agent) = mpsc::channel(MEMORY_TRANSPORT_CAPACITY);

    (
        MemorySink { tx: to_agent },
        MemorySource { rx: from_agent },
        AgentEnd {
            tx: to_hub,
            rx: from_hub,
        },
    )
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn send(&mut self, message: &ServerMessage) -> Result<(), TransportError> {
        self.tx
            .send(ServerFrame::Message(message.clone()))
            .await
            .map_err(|_| TransportError::Send("agent end dropped".to_string()))
    }

    async fn send_handshake(
        &mut self,
        metadata: &ServerConnectMetadata,
    ) -> Result<(), TransportError> {
        self.tx
            .send(ServerFrame::Handshake(metadata.clone()))
            .await
            .map_err(|_| TransportError::Send("agent end dropped".to_string()))
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn recv(&mut self) -> Option<Result<AgentMessage, TransportError>> {
        self.rx.recv().await
    }
}

impl AgentEnd {
    /// Send a message to the hub. Returns `false` if the hub side is gone.
    pub async fn send(&self, message: AgentMessage) -> bool {
        self.tx.send(Ok(message)).await.is_ok()
    }

    /// Make the hub's next read fail with `error`.
    pub async fn fail(&self, error: TransportError) -> bool {
        self.tx.send(Err(error)).await.is_ok()
    }

    pub async fn recv(&mut self) -> Option<ServerFrame> {
        self.rx.recv().await
    }

    /// Next envelope, skipping the handshake.
    pub async fn recv_message(&mut self) -> Option<ServerMessage> {
        loop {
            match self.rx.recv().await? {
                ServerFrame::Message(message) => return Some(message),
                ServerFrame::Handshake(_) => continue,
            }
        }
    }

    /// A cloneable writer for answering from several tasks.
    pub fn sender(&self) -> AgentSender {
        AgentSender {
            tx: self.tx.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AgentSender {
    tx: mpsc::Sender<Result<AgentMessage, TransportError>>,
}

impl AgentSender {
    pub async fn send(&self, message: AgentMessage) -> bool {
        self.tx.send(Ok(message)).await.is_ok()
    }
}
