//! Desired state pushed to a connected agent.

use std::collections::BTreeMap;
use std::time::Duration;

use super::proto::{AgentProcess, BuiltinAgent, SetStateRequest};
use crate::error::{Error, Result};
use crate::services::dsn::service_dsn;
use crate::storage::Store;
use crate::storage::schema::{
    AgentRecord, AgentType, ServiceCredentials, ServiceRecord, ServiceType,
};

/// Placeholder the agent replaces with the port it picked for the process.
pub const LISTEN_PORT_TEMPLATE: &str = "{{ .listen_port }}";

const REDACTED: &str = "***";

/// Connect timeout baked into exporter and collector DSNs.
const DSN_TIMEOUT: Duration = Duration::from_secs(1);

/// Build the state `pmm_agent_id` should run from the inventory.
///
/// Disabled agents are left out, so pushing the result stops them.
pub async fn desired_state(store: &Store, pmm_agent_id: &str) -> Result<SetStateRequest> {
    let mut state = SetStateRequest::default();

    for agent in store.find_child_agents(pmm_agent_id).await? {
        if agent.disabled || agent.agent_type == AgentType::PmmAgent {
            continue;
        }

        if agent.agent_type.is_builtin() {
            let builtin = builtin_agent(store, &agent).await?;
            state.builtin_agents.insert(agent.agent_id.clone(), builtin);
        } else {
            let process = agent_process(store, &agent).await?;
            state.agent_processes.insert(agent.agent_id.clone(), process);
        }
    }

    Ok(state)
}

async fn agent_process(store: &Store, agent: &AgentRecord) -> Result<AgentProcess> {
    let listen = format!("--web.listen-address=:{LISTEN_PORT_TEMPLATE}");
    let mut args: Vec<String> = match agent.agent_type {
        AgentType::NodeExporter => vec![
            "--collector.filesystem".to_string(),
            "--collector.meminfo".to_string(),
            "--collector.netdev".to_string(),
        ],
        AgentType::MysqldExporter => vec![
            "--collect.global_status".to_string(),
            "--collect.global_variables".to_string(),
            "--collect.info_schema.innodb_metrics".to_string(),
            "--collect.slave_status".to_string(),
        ],
        AgentType::MongodbExporter => vec![
            "--collect.collection".to_string(),
            "--collect.database".to_string(),
            "--collect.indexusage".to_string(),
            "--collect.topmetrics".to_string(),
        ],
        AgentType::PostgresExporter => vec!["--auto-discover-databases".to_string()],
        _ => Vec::new(),
    };
    args.push(listen);
    args.extend(agent.args.iter().cloned());
    args.sort();

    let mut process = AgentProcess {
        kind: agent.agent_type,
        args,
        env: Vec::new(),
        text_files: BTreeMap::new(),
        redact_words: Vec::new(),
    };

    if agent.agent_type == AgentType::NodeExporter {
        return Ok(process);
    }

    let (service, credentials) = service_for(store, agent).await?;
    let dsn = service_dsn(&service, &credentials, "", DSN_TIMEOUT)?;
    let variable = match service.service_type {
        ServiceType::Mongodb => "MONGODB_URI",
        ServiceType::Mysql | ServiceType::Postgresql => "DATA_SOURCE_NAME",
    };
    process.env.push(format!("{variable}={dsn}"));
    if !credentials.password.is_empty() {
        process.redact_words.push(credentials.password);
    }

    Ok(process)
}

async fn builtin_agent(store: &Store, agent: &AgentRecord) -> Result<BuiltinAgent> {
    let (service, credentials) = service_for(store, agent).await?;
    Ok(BuiltinAgent {
        kind: agent.agent_type,
        dsn: service_dsn(&service, &credentials, "", DSN_TIMEOUT)?,
        text_files: BTreeMap::new(),
    })
}

async fn service_for(
    store: &Store,
    agent: &AgentRecord,
) -> Result<(ServiceRecord, ServiceCredentials)> {
    let Some(service_id) = agent.service_id.as_deref() else {
        return Err(Error::FailedPrecondition(format!(
            "{} {:?} has no service",
            agent.agent_type, agent.agent_id
        )));
    };
    let service = store.find_service(service_id).await?;
    let credentials = store.find_credentials_for_service(service_id).await?;
    Ok((service, credentials))
}

/// Copy of `state` safe to log: redact words are masked everywhere, builtin
/// DSNs are masked entirely.
pub fn redacted(state: &SetStateRequest) -> SetStateRequest {
    let mut state = state.clone();

    for process in state.agent_processes.values_mut() {
        let words = std::mem::take(&mut process.redact_words);
        for value in process.args.iter_mut().chain(process.env.iter_mut()) {
            for word in &words {
                *value = value.replace(word.as_str(), REDACTED);
            }
        }
        process.redact_words = vec![REDACTED.to_string(); words.len()];
    }

    for builtin in state.builtin_agents.values_mut() {
        builtin.dsn = REDACTED.to_string();
    }

    state
}
