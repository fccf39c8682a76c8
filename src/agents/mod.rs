//! Agent connections
//!
//! Each connected agent holds one bidirectional stream to the hub. The
//! [`Channel`](channel::Channel) multiplexes concurrent request/response
//! exchanges over that stream, the [`Registry`](registry::Registry) tracks
//! which agents are connected and runs their connection loops, and the
//! [`Handler`](handler::Handler) answers agent requests and issues commands.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use guardia_control::agents::handler::{Handler, HandlerSettings};
//! use guardia_control::agents::metrics::AgentMetrics;
//! use guardia_control::agents::registry::{Registry, RegistrySettings};
//! use guardia_control::events::{BroadcastCollector, EventBus};
//! use guardia_control::storage::Store;
//!
//! # fn main() -> anyhow::Result<()> {
//! let store = Store::in_memory();
//! let events = EventBus::new();
//! let registry = Arc::new(Registry::new(
//!     store.clone(),
//!     AgentMetrics::unregistered()?,
//!     events.clone(),
//!     RegistrySettings::default(),
//! ));
//! let handler = Arc::new(Handler::new(
//!     registry.clone(),
//!     store,
//!     Arc::new(BroadcastCollector::new(events.clone())),
//!     events,
//!     HandlerSettings::default(),
//! ));
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod channel;
pub mod handler;
pub mod metrics;
pub mod proto;
pub mod registry;
pub mod state;
pub mod transport;

pub use channel::{Channel, ChannelError};
pub use handler::{Handler, HandlerSettings};
pub use registry::{AgentConnection, Disconnect, DisconnectReason, Registry, RegistrySettings};
