//! Master and agent models
//!
//! Domain actions expressed as coordination transactions.

mod agent;
mod master;
mod registration;

pub use agent::{AgentModel, AgentRegistrar, AssignmentWatch};
pub use master::MasterModel;
pub use registration::EphemeralRegistration;

use std::collections::BTreeMap;

use helios_coordination::{AgentId, CoordinationError, CoordinationSession, PathLayout, TaskId};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::Result;
use crate::model::{Task, Versioned, decode};

/// Read and decode a record, `None` when the node does not exist.
pub(crate) async fn read_record<T: DeserializeOwned>(
    session: &CoordinationSession,
    path: &str,
) -> Result<Option<Versioned<T>>> {
    match session.read(path).await {
        Ok((data, version)) => Ok(Some(Versioned {
            value: decode(path, &data)?,
            version,
        })),
        Err(CoordinationError::NodeNotFound { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Children of `path`, empty when it does not exist.
pub(crate) async fn children_or_empty(
    session: &CoordinationSession,
    path: &str,
) -> Result<Vec<String>> {
    match session.children(path).await {
        Ok(children) => Ok(children),
        Err(CoordinationError::NodeNotFound { .. }) => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Desired task state of one agent.
pub(crate) async fn read_assignments(
    session: &CoordinationSession,
    agent: &AgentId,
) -> Result<BTreeMap<TaskId, Versioned<Task>>> {
    let mut tasks = BTreeMap::new();
    for name in children_or_empty(session, &PathLayout::agent_assignments(agent)).await? {
        let Ok(task) = TaskId::new(name.as_str()) else {
            warn!(agent = %agent, name = %name, "Ignoring malformed assignment name");
            continue;
        };
        // Removed between listing and reading
        if let Some(record) = read_record(session, &PathLayout::assignment(agent, &task)).await? {
            tasks.insert(task, record);
        }
    }
    Ok(tasks)
}
