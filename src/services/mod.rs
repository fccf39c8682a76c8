//! Typed callers that run commands on agents
//!
//! Each service builds one kind of request, resolves which agent should run
//! it, and goes through the [`Handler`](crate::agents::Handler).

pub mod actions;
pub mod backup;
pub mod checks;
pub mod dsn;
pub mod jobs;

pub use actions::{ActionKind, ActionsService, RunAction};
pub use backup::{BackupParams, BackupService, RestoreParams};
pub use checks::ConnectionChecker;
pub use jobs::JobsService;

use crate::error::{Error, Result};
use crate::storage::schema::AgentRecord;

/// Pick the agent to run a command from the agents able to run it.
///
/// An explicit id must be one of the candidates. Without one, there must be
/// exactly one candidate.
pub(crate) fn pick_pmm_agent(candidates: &[AgentRecord], explicit: Option<&str>) -> Result<String> {
    let explicit = explicit.filter(|id| !id.is_empty());
    match (explicit, candidates) {
        (_, []) => Err(Error::FailedPrecondition(
            "No pmm-agent running on this Node or Service".to_string(),
        )),
        (None, [only]) => Ok(only.agent_id.clone()),
        (None, _) => Err(Error::InvalidArgument(
            "Couldn't find pmm-agent ID to run action: more than one agent, pass one explicitly"
                .to_string(),
        )),
        (Some(id), candidates) => candidates
            .iter()
            .find(|a| a.agent_id == id)
            .map(|a| a.agent_id.clone())
            .ok_or_else(|| {
                Error::InvalidArgument(format!("pmm-agent {id:?} can't run this action"))
            }),
    }
}
