use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use guardia_control::{
    agents::{Handler, Registry, metrics::AgentMetrics},
    api::{ApiConfig, ApiState, spawn_api_server},
    config::{Config, read_config_file},
    events::{BroadcastCollector, EventBus},
    util::{get_addr, get_api_token, get_default_addr, get_default_port, get_port},
};
use tracing::{debug, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![
        ("guardia_control", LevelFilter::DEBUG),
        ("guardia_hub", LevelFilter::TRACE),
        ("tower_http", LevelFilter::INFO),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)
        .with_context(|| format!("failed to load config from {}", args.file))?;

    let store = config.storage.clone().unwrap_or_default().open().await?;
    config.inventory.seed(&store).await?;

    let prometheus = prometheus::Registry::new();
    let metrics = AgentMetrics::new(&prometheus)?;
    let events = EventBus::new();

    let registry = Arc::new(Registry::new(
        store.clone(),
        metrics,
        events.clone(),
        config.agents.registry_settings(),
    ));
    let handler = Arc::new(Handler::new(
        registry.clone(),
        store.clone(),
        Arc::new(BroadcastCollector::new(events.clone())),
        events.clone(),
        config.agents.handler_settings(),
    ));

    // nothing is connected yet, so nothing is known about supervised agents
    handler
        .set_all_agents_status_unknown()
        .await
        .context("failed to reset agent statuses")?;

    let state = ApiState::new(handler);
    tokio::spawn(state.jobs.clone().run_retries(events.subscribe()));

    let addr = spawn_api_server(api_config(&config), state).await?;
    info!("hub ready on {addr}");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    registry.shutdown();
    wait_for_disconnects(&registry).await;

    if let Err(e) = store.close().await {
        warn!("failed to close store: {e}");
    }
    Ok(())
}

/// Environment variables win over the config file.
fn api_config(config: &Config) -> ApiConfig {
    let addr = get_addr().or(config.listen).unwrap_or_else(get_default_addr);
    let port = get_port().or(config.port).unwrap_or_else(get_default_port);

    ApiConfig {
        bind_addr: SocketAddr::new(addr, port),
        auth_token: get_api_token().or_else(|| config.auth_token.clone()),
        enable_cors: config.enable_cors,
    }
}

async fn wait_for_disconnects(registry: &Registry) {
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while !registry.connected().is_empty() {
        if tokio::time::Instant::now() >= deadline {
            warn!(
                "{} agents still connected after {SHUTDOWN_GRACE:?}",
                registry.connected().len()
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    debug!("all agents disconnected");
}
