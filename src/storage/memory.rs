//! In-memory storage backend (no persistence)
//!
//! Useful for tests and for running the hub without a database file.
//! All data is lost on restart.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::backend::{Collection, HealthStatus, StorageBackend};
use super::error::StoreResult;

/// In-memory storage backend
#[derive(Default)]
pub struct MemoryBackend {
    documents: RwLock<BTreeMap<(Collection, String), String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn put(&self, collection: Collection, id: &str, body: String) -> StoreResult<()> {
        self.documents.write().insert((collection, id.to_string()), body);
        Ok(())
    }

    async fn get(&self, collection: Collection, id: &str) -> StoreResult<Option<String>> {
        Ok(self
            .documents
            .read()
            .get(&(collection, id.to_string()))
            .cloned())
    }

    async fn list(&self, collection: Collection) -> StoreResult<Vec<String>> {
        let documents = self.documents.read();
        Ok(documents
            .iter()
            .filter(|((c, _), _)| *c == collection)
            .map(|(_, body)| body.clone())
            .collect())
    }

    async fn health_check(&self) -> StoreResult<HealthStatus> {
        let total = self.documents.read().len();
        Ok(HealthStatus {
            healthy: true,
            message: "In-memory storage operational".to_string(),
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("total_documents".to_string(), total.to_string()),
            ]),
        })
    }

    async fn close(&self) -> StoreResult<()> {
        debug!("closing in-memory backend (no-op)");
        Ok(())
    }
}
