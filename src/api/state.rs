//! Shared state for API handlers

use std::sync::Arc;

use crate::agents::{Handler, Registry};
use crate::events::EventBus;
use crate::services::{ActionsService, BackupService, ConnectionChecker, JobsService};
use crate::storage::Store;

/// Everything a route needs, cloned into each request
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<Registry>,
    pub handler: Arc<Handler>,
    pub actions: Arc<ActionsService>,
    pub jobs: Arc<JobsService>,
    pub backups: Arc<BackupService>,
    pub checks: Arc<ConnectionChecker>,
    pub events: EventBus,
    pub store: Store,
}

impl ApiState {
    /// Build the services on top of a handler.
    pub fn new(handler: Arc<Handler>) -> Self {
        let registry = handler.registry().clone();
        let store = handler.store().clone();
        let events = handler.events().clone();
        let jobs = Arc::new(JobsService::new(handler.clone()));

        Self {
            registry,
            actions: Arc::new(ActionsService::new(handler.clone())),
            backups: Arc::new(BackupService::new(jobs.clone(), store.clone())),
            checks: Arc::new(ConnectionChecker::new(handler.clone())),
            jobs,
            handler,
            events,
            store,
        }
    }
}
