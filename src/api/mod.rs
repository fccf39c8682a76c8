//! HTTP and WebSocket surface of the hub
//!
//! ## Endpoints
//!
//! - `WS /agent/connect` - Agent stream (identified by `x-agent-id`)
//! - `GET /metrics` - Prometheus metrics
//! - `GET /api/v1/health` - Health check
//! - `GET /api/v1/agents` - Connected agents
//! - `POST /api/v1/agents/:id/kick` - Kick an agent
//! - `POST /api/v1/agents/:id/ping` - Round trip and clock drift
//! - `POST /api/v1/agents/:id/versions` - Installed software versions
//! - `POST /api/v1/services/:id/check` - Connection check through an agent
//! - `POST /api/v1/actions`, `GET /api/v1/actions/:id`, `POST /api/v1/actions/:id/cancel`
//! - `POST /api/v1/jobs/echo`, `GET /api/v1/jobs/:id`, `GET /api/v1/jobs/:id/status`,
//!   `POST /api/v1/jobs/:id/stop`
//! - `POST /api/v1/backups`, `GET /api/v1/artifacts/:id`
//! - `POST /api/v1/restores`, `GET /api/v1/restores/:id`
//! - `WS /api/v1/stream` - Hub events
//!
//! Everything under `/api/v1` sits behind the bearer token when one is
//! configured. Agents authenticate against the inventory instead.

pub mod agent_ws;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod types;
pub mod websocket;

pub use error::{ApiError, ApiResult};
pub use state::ApiState;

use std::net::SocketAddr;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::util::{get_default_addr, get_default_port};

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,

    /// Bearer token for `/api/v1/*`
    pub auth_token: Option<String>,

    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(get_default_addr(), get_default_port()),
            auth_token: None,
            enable_cors: false,
        }
    }
}

/// Build the full router without binding it.
pub fn router(config: &ApiConfig, state: ApiState) -> Router {
    let mut api = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/agents", get(routes::agents::list_agents))
        .route("/agents/:id/kick", post(routes::agents::kick_agent))
        .route("/agents/:id/ping", post(routes::agents::ping_agent))
        .route(
            "/agents/:id/versions",
            post(routes::agents::software_versions),
        )
        .route(
            "/services/:id/check",
            post(routes::agents::check_service_connection),
        )
        .route("/actions", post(routes::actions::run_action))
        .route("/actions/:id", get(routes::actions::get_action))
        .route("/actions/:id/cancel", post(routes::actions::cancel_action))
        .route("/jobs/echo", post(routes::jobs::start_echo_job))
        .route("/jobs/:id", get(routes::jobs::get_job))
        .route("/jobs/:id/status", get(routes::jobs::job_status))
        .route("/jobs/:id/stop", post(routes::jobs::stop_job))
        .route("/backups", post(routes::backups::start_backup))
        .route("/artifacts/:id", get(routes::backups::get_artifact))
        .route("/restores", post(routes::backups::start_restore))
        .route("/restores/:id", get(routes::backups::get_restore))
        .route("/stream", get(websocket::websocket_handler));

    if let Some(token) = config.auth_token.clone() {
        api = api.route_layer(axum::middleware::from_fn_with_state(
            token,
            middleware::auth::auth_middleware,
        ));
    }

    let mut app = Router::new()
        .route("/agent/connect", get(agent_ws::agent_connect))
        .route("/metrics", get(routes::metrics::metrics))
        .nest("/api/v1", api)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if config.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }

    app
}

/// Spawn the API server
///
/// Starts serving in a background task and returns the bound address.
pub async fn spawn_api_server(config: ApiConfig, state: ApiState) -> anyhow::Result<SocketAddr> {
    info!("starting API server on {}", config.bind_addr);

    let app = router(&config, state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let addr = listener.local_addr()?;

    info!("API server listening on {}", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok(addr)
}
