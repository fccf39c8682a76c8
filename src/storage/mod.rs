//! Inventory and result persistence
//!
//! The control plane talks to storage through [`Store`], a typed facade
//! over a [`StorageBackend`]. Backends only know how to keep JSON documents.
//!
//! ## Backends
//!
//! - **SQLite** (default): embedded database file
//! - **In-Memory**: no persistence, for tests and throwaway hubs
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use guardia_control::storage::{Store, sqlite::SqliteBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = SqliteBackend::new("./hub.db").await?;
//!     let store = Store::new(Arc::new(backend));
//!     let agents = store.list_agents().await?;
//!     println!("{} agents in inventory", agents.len());
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;
mod store;

pub use backend::{Collection, HealthStatus, StorageBackend};
pub use error::{StoreError, StoreResult};
pub use store::Store;
