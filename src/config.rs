use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, trace};

use crate::agents::handler::HandlerSettings;
use crate::agents::registry::RegistrySettings;
use crate::storage::Store;
use crate::storage::schema::{AgentRecord, BackupLocation, ServiceCredentials, ServiceRecord};

/// Storage backend configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database file
    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
        }
    }
}

impl StorageConfig {
    pub async fn open(&self) -> anyhow::Result<Store> {
        match self {
            StorageConfig::None => Ok(Store::in_memory()),
            #[cfg(feature = "storage-sqlite")]
            StorageConfig::Sqlite { path } => {
                let backend = crate::storage::sqlite::SqliteBackend::new(path)
                    .await
                    .with_context(|| format!("failed to open {}", path.display()))?;
                Ok(Store::new(Arc::new(backend)))
            }
            #[cfg(not(feature = "storage-sqlite"))]
            StorageConfig::Sqlite { .. } => {
                anyhow::bail!("built without the storage-sqlite feature")
            }
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./hub.db")
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub listen: Option<IpAddr>,

    pub port: Option<u16>,

    /// Bearer token for `/api/v1/*`; unauthenticated if unset
    pub auth_token: Option<String>,

    #[serde(default)]
    pub enable_cors: bool,

    #[serde(default)]
    pub agents: AgentsConfig,

    /// Storage configuration (optional - defaults to SQLite)
    pub storage: Option<StorageConfig>,

    /// Records written to the store on startup
    #[serde(default)]
    pub inventory: Inventory,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_state_update_delay")]
    pub state_update_delay_ms: u64,

    #[serde(default = "default_state_change_timeout")]
    pub state_change_timeout_secs: u64,

    #[serde(default = "default_command_deadline")]
    pub command_deadline_secs: u64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            state_update_delay_ms: default_state_update_delay(),
            state_change_timeout_secs: default_state_change_timeout(),
            command_deadline_secs: default_command_deadline(),
        }
    }
}

impl AgentsConfig {
    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            state_update_delay: Duration::from_millis(self.state_update_delay_ms),
        }
    }

    pub fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings {
            state_change_timeout: Duration::from_secs(self.state_change_timeout_secs),
            command_deadline: Duration::from_secs(self.command_deadline_secs),
        }
    }
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_state_update_delay() -> u64 {
    1000
}

fn default_state_change_timeout() -> u64 {
    5
}

fn default_command_deadline() -> u64 {
    30
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub agents: Vec<AgentRecord>,

    #[serde(default)]
    pub services: Vec<ServiceSeed>,

    #[serde(default)]
    pub locations: Vec<BackupLocation>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ServiceSeed {
    #[serde(flatten)]
    pub service: ServiceRecord,

    pub credentials: Option<ServiceCredentials>,
}

impl Inventory {
    /// Write every configured record, replacing existing ones with the same id.
    pub async fn seed(&self, store: &Store) -> anyhow::Result<()> {
        for agent in &self.agents {
            store
                .save_agent(agent)
                .await
                .with_context(|| format!("failed to seed agent {}", agent.agent_id))?;
        }
        for seed in &self.services {
            let id = &seed.service.service_id;
            store
                .save_service(&seed.service)
                .await
                .with_context(|| format!("failed to seed service {id}"))?;
            if let Some(credentials) = &seed.credentials {
                store
                    .save_credentials(id, credentials)
                    .await
                    .with_context(|| format!("failed to seed credentials of {id}"))?;
            }
        }
        for location in &self.locations {
            store
                .save_backup_location(location)
                .await
                .with_context(|| format!("failed to seed location {}", location.id))?;
        }
        debug!(
            "seeded {} agents, {} services, {} locations",
            self.agents.len(),
            self.services.len(),
            self.locations.len()
        );
        Ok(())
    }
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .inspect(|config: &Config| {
            trace!("loaded config with {} agents", config.inventory.agents.len())
        })
}
