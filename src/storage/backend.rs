//! Storage backend trait definition
//!
//! Backends are deliberately dumb: they persist opaque JSON documents grouped
//! into collections. Typed access lives in [`Store`](super::Store).

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

use super::error::StoreResult;

/// Document collections the control plane uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Agents,
    Services,
    Credentials,
    ActionResults,
    Jobs,
    JobLogs,
    Artifacts,
    BackupLocations,
    RestoreHistory,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Agents => "agents",
            Collection::Services => "services",
            Collection::Credentials => "credentials",
            Collection::ActionResults => "action_results",
            Collection::Jobs => "jobs",
            Collection::JobLogs => "job_logs",
            Collection::Artifacts => "artifacts",
            Collection::BackupLocations => "backup_locations",
            Collection::RestoreHistory => "restore_history",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Trait for persistent storage backends
///
/// Implementations must be `Send + Sync` as they are shared by every
/// connection task. Writes replace the whole document.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Insert or replace a document
    async fn put(&self, collection: Collection, id: &str, body: String) -> StoreResult<()>;

    /// Fetch a document, `None` if it does not exist
    async fn get(&self, collection: Collection, id: &str) -> StoreResult<Option<String>>;

    /// All documents of a collection, ordered by id
    async fn list(&self, collection: Collection) -> StoreResult<Vec<String>>;

    /// Check backend health
    async fn health_check(&self) -> StoreResult<HealthStatus>;

    /// Close the backend and release resources
    async fn close(&self) -> StoreResult<()>;
}
