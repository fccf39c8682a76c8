//! WebSocket handler for real-time hub events

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, stream::StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::api::state::ApiState;

/// WebSocket upgrade handler
///
/// GET /api/v1/stream
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    ws.on_upgrade(|socket| handle_websocket(socket, state))
}

async fn handle_websocket(socket: WebSocket, state: ApiState) {
    info!("event stream client connected");

    let (mut sender, mut receiver) = socket.split();
    let mut events = state.events.subscribe();

    let mut send_task = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("event stream client lagging, skipped {skipped} events");
                    continue;
                }
                Err(RecvError::Closed) => {
                    debug!("event bus closed");
                    break;
                }
            };

            if let Ok(text) = serde_json::to_string(&event)
                && sender.send(Message::Text(text)).await.is_err()
            {
                debug!("WebSocket send failed, client disconnected");
                break;
            }
        }
    });

    // Clients only ever close the stream
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => {
            recv_task.abort();
        }
        _ = (&mut recv_task) => {
            send_task.abort();
        }
    }

    info!("event stream client disconnected");
}
