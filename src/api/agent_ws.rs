//! Agent endpoint: WebSocket transport feeding the registry
//!
//! Agents identify themselves with the `x-agent-id` and `x-agent-version`
//! upgrade headers. Every frame is one JSON text message: the hub writes
//! [`ServerFrame`]s, the agent writes [`AgentMessage`]s.

use async_trait::async_trait;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::HeaderMap,
    response::Response,
};
use futures::{
    SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use tracing::{debug, info, warn};

use crate::agents::proto::{
    AgentConnectMetadata, AgentMessage, ServerConnectMetadata, ServerFrame, ServerMessage,
};
use crate::agents::transport::{MessageSink, MessageSource, TransportError};
use crate::api::state::ApiState;

pub const AGENT_ID_HEADER: &str = "x-agent-id";
pub const AGENT_VERSION_HEADER: &str = "x-agent-version";

/// GET /agent/connect
pub async fn agent_connect(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<ApiState>,
) -> Response {
    let metadata = connect_metadata(&headers);
    ws.on_upgrade(move |socket| serve_agent(socket, metadata, state))
}

fn connect_metadata(headers: &HeaderMap) -> AgentConnectMetadata {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .trim()
            .to_string()
    };
    AgentConnectMetadata {
        id: header(AGENT_ID_HEADER),
        version: header(AGENT_VERSION_HEADER),
    }
}

async fn serve_agent(socket: WebSocket, metadata: AgentConnectMetadata, state: ApiState) {
    let agent_id = metadata.id.clone();
    debug!("agent stream opened for {agent_id:?}");

    let (sender, receiver) = socket.split();
    let result = state
        .registry
        .run(
            metadata,
            Box::new(WsSink { sender }),
            Box::new(WsSource { receiver }),
            state.handler.clone(),
        )
        .await;

    match result {
        Ok(disconnect) => match disconnect.error {
            Some(e) => info!(
                "agent {agent_id} disconnected ({}): {e}",
                disconnect.reason.as_str()
            ),
            None => info!("agent {agent_id} disconnected ({})", disconnect.reason.as_str()),
        },
        Err(e) => warn!("agent {agent_id:?} rejected: {e}"),
    }
}

struct WsSink {
    sender: SplitSink<WebSocket, Message>,
}

impl WsSink {
    async fn send_frame(&mut self, frame: &ServerFrame) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(frame).map_err(|e| TransportError::Send(e.to_string()))?;
        self.sender
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

#[async_trait]
impl MessageSink for WsSink {
    async fn send(&mut self, message: &ServerMessage) -> Result<(), TransportError> {
        self.send_frame(&ServerFrame::Message(message.clone())).await
    }

    async fn send_handshake(
        &mut self,
        metadata: &ServerConnectMetadata,
    ) -> Result<(), TransportError> {
        self.send_frame(&ServerFrame::Handshake(metadata.clone()))
            .await
    }
}

struct WsSource {
    receiver: SplitStream<WebSocket>,
}

#[async_trait]
impl MessageSource for WsSource {
    async fn recv(&mut self) -> Option<Result<AgentMessage, TransportError>> {
        loop {
            let message = match self.receiver.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            };
            let decoded = match message {
                Message::Text(text) => serde_json::from_str(&text),
                Message::Binary(data) => serde_json::from_slice(&data),
                Message::Close(_) => return None,
                // answered by axum
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            return Some(decoded.map_err(|e| TransportError::Decode(e.to_string())));
        }
    }
}
