//! Authenticate-or-reject for incoming agent connections.

use tracing::{debug, instrument};

use super::proto::{AgentConnectMetadata, Code};
use crate::storage::Store;
use crate::storage::schema::AgentType;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Empty Agent ID.")]
    EmptyId,

    #[error("No Agent with ID {0:?}.")]
    UnknownAgent(String),

    #[error("No pmm-agent with ID {0:?}.")]
    NotPmmAgent(String),

    #[error("Can't get 'runs_on_node_id' for pmm-agent with ID {0:?}.")]
    NoNode(String),

    #[error("Can't parse 'version' metadata {0:?}.")]
    InvalidVersion(String),

    #[error("inventory lookup failed: {0}")]
    Store(String),
}

impl AuthError {
    pub fn code(&self) -> Code {
        match self {
            AuthError::InvalidVersion(_) => Code::InvalidArgument,
            AuthError::Store(_) => Code::Internal,
            _ => Code::PermissionDenied,
        }
    }
}

/// Check the agent against the inventory and record its version.
///
/// Returns the id of the node the agent runs on.
#[instrument(skip_all, fields(agent = %metadata.id))]
pub async fn authenticate(
    store: &Store,
    metadata: &AgentConnectMetadata,
) -> Result<String, AuthError> {
    if metadata.id.is_empty() {
        return Err(AuthError::EmptyId);
    }

    let agent = match store.find_agent(&metadata.id).await {
        Ok(agent) => agent,
        Err(e) if e.is_not_found() => return Err(AuthError::UnknownAgent(metadata.id.clone())),
        Err(e) => return Err(AuthError::Store(e.to_string())),
    };

    if agent.agent_type != AgentType::PmmAgent {
        return Err(AuthError::NotPmmAgent(metadata.id.clone()));
    }

    let Some(node_id) = agent.runs_on_node_id.filter(|n| !n.is_empty()) else {
        return Err(AuthError::NoNode(metadata.id.clone()));
    };

    if !is_valid_version(&metadata.version) {
        return Err(AuthError::InvalidVersion(metadata.version.clone()));
    }

    store
        .update_agent_version(&metadata.id, &metadata.version)
        .await
        .map_err(|e| AuthError::Store(e.to_string()))?;

    debug!("authenticated, runs on {node_id}");
    Ok(node_id)
}

/// Accepts `MAJOR[.MINOR[.PATCH]]` with an optional `-suffix`.
fn is_valid_version(version: &str) -> bool {
    let core = version.split_once('-').map_or(version, |(core, _)| core);
    let parts: Vec<&str> = core.split('.').collect();
    (1..=3).contains(&parts.len())
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}
