//! Integration tests for API endpoints
//!
//! Routes are driven through the router directly; the agent endpoint is
//! exercised over a real socket.

use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use futures::{SinkExt, StreamExt};
use guardia_control::{
    agents::proto::{
        AgentMessage, AgentPayload, ServerFrame, ServerPayload, SetStateResponse, Status,
    },
    api::{ApiConfig, ApiState, router, spawn_api_server},
};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{Message, client::IntoClientRequest, http::HeaderValue},
};
use tower::ServiceExt;

use crate::helpers::{PMM_AGENT, TestHub, connect, eventually, quiet_settings, test_hub};

const TOKEN: &str = "test-token";

type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config() -> ApiConfig {
    ApiConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        auth_token: Some(TOKEN.to_string()),
        enable_cors: false,
    }
}

fn test_router(hub: &TestHub) -> Router {
    router(&test_config(), ApiState::new(hub.handler.clone()))
}

fn authorized(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"));
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn test_health_endpoint() {
    let hub = test_hub(quiet_settings()).await;
    let app = test_router(&hub);
    let _agent = connect(&hub, PMM_AGENT);
    assert!(eventually(|| hub.registry.is_connected(PMM_AGENT)).await);

    let (status, body) = send(&app, authorized("GET", "/api/v1/health", None)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["storage"]["healthy"], true);
    assert_eq!(body["connected_agents"], 1);
}

#[tokio::test]
async fn test_auth_middleware() {
    let hub = test_hub(quiet_settings()).await;
    let app = test_router(&hub);

    let missing = Request::builder()
        .uri("/api/v1/agents")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, missing).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .uri("/api/v1/agents")
        .header(header::AUTHORIZATION, "Bearer nope")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, wrong).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // scraping does not need the token
    let metrics = Request::builder()
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(metrics).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&text).contains("guardia_agents_connected"));
}

#[tokio::test]
async fn test_agents_list_and_kick() {
    let hub = test_hub(quiet_settings()).await;
    let app = test_router(&hub);
    let agent = connect(&hub, PMM_AGENT);
    assert!(eventually(|| hub.registry.is_connected(PMM_AGENT)).await);

    let (status, body) = send(&app, authorized("GET", "/api/v1/agents", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["agents"][0]["agent_id"], PMM_AGENT);
    assert_eq!(body["agents"][0]["version"], "2.41.0");

    let uri = format!("/api/v1/agents/{PMM_AGENT}/kick");
    let (status, _) = send(&app, authorized("POST", &uri, None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    agent.run.await.unwrap().unwrap();

    let (status, body) = send(&app, authorized("POST", &uri, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains(PMM_AGENT));
}

#[tokio::test]
async fn test_ping_absent_agent_is_precondition_failure() {
    let hub = test_hub(quiet_settings()).await;
    let app = test_router(&hub);

    let (status, body) = send(&app, authorized("POST", "/api/v1/agents/nobody/ping", None)).await;

    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(body["code"], "failed_precondition");
}

#[tokio::test]
async fn test_echo_job_roundtrip() {
    let hub = test_hub(quiet_settings()).await;
    let app = test_router(&hub);
    let mut agent = connect(&hub, PMM_AGENT);
    assert!(eventually(|| hub.registry.is_connected(PMM_AGENT)).await);

    let (status, job) = send(
        &app,
        authorized(
            "POST",
            "/api/v1/jobs/echo",
            Some(json!({
                "pmm_agent_id": PMM_AGENT,
                "message": "hello",
                "delay_ms": 10,
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = job["id"].as_str().unwrap().to_string();
    assert!(job_id.starts_with("/job_id/"));

    agent
        .expect(|p| matches!(p, ServerPayload::StartJob(_)).then_some(()))
        .await;

    let bare = job_id.trim_start_matches("/job_id/");
    let (status, body) = send(&app, authorized("GET", &format!("/api/v1/jobs/{bare}"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], job_id.as_str());
    assert_eq!(body["done"], false);
    assert_eq!(body["logs"], json!([]));

    let (status, body) = send(
        &app,
        authorized("GET", &format!("/api/v1/jobs/{bare}/status"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["alive"], true);
}

#[tokio::test]
async fn test_unknown_artifact_is_not_found() {
    let hub = test_hub(quiet_settings()).await;
    let app = test_router(&hub);

    let (status, body) = send(
        &app,
        authorized("GET", "/api/v1/artifacts/00000000-0000-0000-0000-000000000000", None),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

async fn next_frame(ws: &mut AgentSocket) -> ServerFrame {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn test_agent_connects_over_websocket() {
    let hub = test_hub(quiet_settings()).await;
    let state = ApiState::new(hub.handler.clone());
    let addr = spawn_api_server(test_config(), state).await.unwrap();

    let mut request = format!("ws://{addr}/agent/connect")
        .into_client_request()
        .unwrap();
    let headers = request.headers_mut();
    headers.insert("x-agent-id", HeaderValue::from_static(PMM_AGENT));
    headers.insert("x-agent-version", HeaderValue::from_static("2.41.0"));
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let handshake = next_frame(&mut ws).await;
    assert!(
        matches!(
            &handshake,
            ServerFrame::Handshake(meta) if meta.agent_runs_on_node_id == "node-1"
        ),
        "unexpected first frame: {handshake:?}"
    );

    let set_state_id = loop {
        if let ServerFrame::Message(message) = next_frame(&mut ws).await {
            if matches!(message.payload, Some(ServerPayload::SetState(_))) {
                break message.id;
            }
        }
    };

    let reply = AgentMessage {
        id: set_state_id,
        status: Status::ok(),
        payload: Some(AgentPayload::SetState(SetStateResponse {})),
    };
    ws.send(Message::Text(serde_json::to_string(&reply).unwrap()))
        .await
        .unwrap();

    assert!(eventually(|| hub.registry.is_connected(PMM_AGENT)).await);

    ws.close(None).await.unwrap();
    assert!(eventually(|| !hub.registry.is_connected(PMM_AGENT)).await);
}

#[tokio::test]
async fn test_websocket_rejects_unknown_agent() {
    let hub = test_hub(quiet_settings()).await;
    let state = ApiState::new(hub.handler.clone());
    let addr = spawn_api_server(test_config(), state).await.unwrap();

    let mut request = format!("ws://{addr}/agent/connect")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("x-agent-id", HeaderValue::from_static("ghost"));
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    // no handshake, the hub just drops the stream
    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(message) = ws.next().await {
            match message {
                Ok(Message::Text(text)) => panic!("unexpected frame {text}"),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok());
    assert!(hub.registry.connected().is_empty());
}
