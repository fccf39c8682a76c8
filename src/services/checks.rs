//! Connection checks and software version discovery through agents.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, instrument, warn};

use super::dsn::service_dsn;
use super::pick_pmm_agent;
use crate::agents::Handler;
use crate::agents::proto::{CheckConnectionRequest, CheckConnectionStats, Software, SoftwareVersion};
use crate::error::{Error, Result};
use crate::storage::Store;

const CHECK_TIMEOUT: Duration = Duration::from_secs(3);
const CHECK_DSN_TIMEOUT: Duration = Duration::from_secs(2);
const SLOW_CHECK: Duration = Duration::from_secs(4);

pub struct ConnectionChecker {
    handler: Arc<Handler>,
    store: Store,
}

impl ConnectionChecker {
    pub fn new(handler: Arc<Handler>) -> Self {
        let store = handler.store().clone();
        Self { handler, store }
    }

    /// Ask an agent serving `service_id` whether it can reach the service.
    #[instrument(skip(self))]
    pub async fn check_connection_to_service(
        &self,
        service_id: &str,
        pmm_agent_id: Option<&str>,
    ) -> Result<Option<CheckConnectionStats>> {
        let start = Instant::now();

        let service = self.store.find_service(service_id).await?;
        let credentials = self.store.find_credentials_for_service(service_id).await?;
        let candidates = self.store.find_pmm_agents_for_service(service_id).await?;
        let pmm_agent_id = pick_pmm_agent(&candidates, pmm_agent_id)?;

        let dsn = service_dsn(&service, &credentials, "", CHECK_DSN_TIMEOUT)?;
        let sanitized = if credentials.password.is_empty() {
            dsn.clone()
        } else {
            dsn.replace(&credentials.password, "****")
        };
        info!(
            "checking connection: type {}, DSN {sanitized}, timeout {CHECK_TIMEOUT:?}",
            service.service_type
        );

        let request = CheckConnectionRequest {
            service_type: service.service_type,
            dsn,
            timeout: Some(CHECK_TIMEOUT),
            tls_skip_verify: credentials.tls_skip_verify,
        };
        let response = self.handler.check_connection(&pmm_agent_id, request).await;

        let elapsed = start.elapsed();
        if elapsed > SLOW_CHECK {
            warn!("connection check took {elapsed:?}");
        }

        let response = response?;
        match response.error.as_str() {
            "" => Ok(response.stats),
            message => Err(Error::FailedPrecondition(format!(
                "Connection check failed: {}.",
                describe_check_error(message)
            ))),
        }
    }

    /// Versions of `softwares` installed next to the agent, in request order.
    #[instrument(skip(self))]
    pub async fn software_versions(
        &self,
        pmm_agent_id: &str,
        softwares: Vec<Software>,
    ) -> Result<Vec<SoftwareVersion>> {
        let expected = softwares.len();
        let response = self.handler.get_versions(pmm_agent_id, softwares).await?;
        if response.versions.len() != expected {
            return Err(Error::Application(format!(
                "response has {} versions, expected {expected}",
                response.versions.len()
            )));
        }
        Ok(response.versions)
    }
}

/// Context cancellation and deadline errors reported by agents are timeouts.
fn describe_check_error(message: &str) -> String {
    match message {
        "context canceled" | "context deadline exceeded" => format!("timeout ({message})"),
        other => other.to_string(),
    }
}
