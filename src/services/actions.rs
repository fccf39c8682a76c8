//! Ad-hoc actions run on agents.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, instrument};
use uuid::Uuid;

use super::dsn::service_dsn;
use super::pick_pmm_agent;
use crate::agents::Handler;
use crate::agents::proto::ActionParams;
use crate::error::{Error, Result};
use crate::storage::Store;
use crate::storage::schema::{ActionResult, ServiceType};

const ACTION_DSN_TIMEOUT: Duration = Duration::from_secs(1);

/// Action to run and what it targets.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    ProcessSummary {
        node_id: String,
        #[serde(default)]
        args: Vec<String>,
    },
    MysqlSummary {
        service_id: String,
        #[serde(default)]
        args: Vec<String>,
    },
    MysqlExplain {
        service_id: String,
        query: String,
    },
    MysqlShowCreateTable {
        service_id: String,
        table: String,
    },
    MysqlShowTableStatus {
        service_id: String,
        table: String,
    },
    PostgresqlShowCreateTable {
        service_id: String,
        table: String,
    },
    MongodbExplain {
        service_id: String,
        query: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunAction {
    /// Agent to run on; required only when several agents qualify.
    #[serde(default)]
    pub pmm_agent_id: Option<String>,

    #[serde(default)]
    pub timeout: Option<Duration>,

    #[serde(flatten)]
    pub action: ActionKind,
}

pub struct ActionsService {
    handler: Arc<Handler>,
    store: Store,
}

impl ActionsService {
    pub fn new(handler: Arc<Handler>) -> Self {
        let store = handler.store().clone();
        Self { handler, store }
    }

    /// Start an action and return its pending result.
    ///
    /// Fails with the agent's error if it refuses to start the action.
    #[instrument(skip_all)]
    pub async fn run_action(&self, run: RunAction) -> Result<ActionResult> {
        let (pmm_agent_id, params) = self.prepare(&run).await?;
        let action_id = format!("/action_id/{}", Uuid::new_v4());

        let now = Utc::now();
        let mut result = ActionResult {
            id: action_id.clone(),
            pmm_agent_id: pmm_agent_id.clone(),
            done: false,
            error: String::new(),
            output: String::new(),
            created_at: now,
            updated_at: now,
        };
        self.store.record_action_result(&result).await?;

        let response = self
            .handler
            .start_action(&pmm_agent_id, &action_id, params, run.timeout)
            .await;

        let failure = match response {
            Ok(response) if response.error.is_empty() => None,
            Ok(response) => Some(Error::Application(response.error)),
            Err(e) => Some(e),
        };
        if let Some(error) = failure {
            result.done = true;
            result.error = error.to_string();
            result.updated_at = Utc::now();
            self.store.record_action_result(&result).await?;
            return Err(error);
        }

        info!("started action {action_id} on {pmm_agent_id}");
        Ok(result)
    }

    /// Ask the agent running the action to stop it.
    #[instrument(skip(self))]
    pub async fn cancel_action(&self, action_id: &str) -> Result<()> {
        let result = self.store.find_action_result(action_id).await?;
        if result.done {
            return Ok(());
        }
        self.handler
            .stop_action(&result.pmm_agent_id, action_id)
            .await?;
        Ok(())
    }

    pub async fn action_result(&self, action_id: &str) -> Result<ActionResult> {
        Ok(self.store.find_action_result(action_id).await?)
    }

    async fn prepare(&self, run: &RunAction) -> Result<(String, ActionParams)> {
        let explicit = run.pmm_agent_id.as_deref();

        let (service_id, expected) = match &run.action {
            ActionKind::ProcessSummary { node_id, args } => {
                let candidates = self.store.find_pmm_agents_for_node(node_id).await?;
                let pmm_agent_id = pick_pmm_agent(&candidates, explicit)?;
                let params = ActionParams::ProcessSummary { args: args.clone() };
                return Ok((pmm_agent_id, params));
            }
            ActionKind::MysqlSummary { service_id, .. }
            | ActionKind::MysqlExplain { service_id, .. }
            | ActionKind::MysqlShowCreateTable { service_id, .. }
            | ActionKind::MysqlShowTableStatus { service_id, .. } => {
                (service_id, ServiceType::Mysql)
            }
            ActionKind::PostgresqlShowCreateTable { service_id, .. } => {
                (service_id, ServiceType::Postgresql)
            }
            ActionKind::MongodbExplain { service_id, .. } => (service_id, ServiceType::Mongodb),
        };

        let service = self.store.find_service(service_id).await?;
        if service.service_type != expected {
            return Err(Error::InvalidArgument(format!(
                "service {service_id:?} is {}, action needs {expected}",
                service.service_type
            )));
        }

        let candidates = self.store.find_pmm_agents_for_service(service_id).await?;
        let pmm_agent_id = pick_pmm_agent(&candidates, explicit)?;

        let credentials = self.store.find_credentials_for_service(service_id).await?;
        let dsn = service_dsn(&service, &credentials, "", ACTION_DSN_TIMEOUT)?;

        let params = match &run.action {
            ActionKind::ProcessSummary { args, .. } => {
                ActionParams::ProcessSummary { args: args.clone() }
            }
            ActionKind::MysqlSummary { args, .. } => {
                ActionParams::MysqlSummary { args: args.clone() }
            }
            ActionKind::MysqlExplain { query, .. } => ActionParams::MysqlExplain {
                dsn,
                query: query.clone(),
            },
            ActionKind::MysqlShowCreateTable { table, .. } => ActionParams::MysqlShowCreateTable {
                dsn,
                table: table.clone(),
            },
            ActionKind::MysqlShowTableStatus { table, .. } => ActionParams::MysqlShowTableStatus {
                dsn,
                table: table.clone(),
            },
            ActionKind::PostgresqlShowCreateTable { table, .. } => {
                ActionParams::PostgresqlShowCreateTable {
                    dsn,
                    table: table.clone(),
                }
            }
            ActionKind::MongodbExplain { query, .. } => ActionParams::MongodbExplain {
                dsn,
                query: query.clone(),
            },
        };

        Ok((pmm_agent_id, params))
    }
}
