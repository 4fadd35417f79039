//! Records stored in the coordination store
//!
//! Every payload is JSON. Records are decoded together with the path they
//! were read from so malformed nodes can be reported precisely.

mod agent;
mod history;
mod job;
mod task;

pub use agent::{AgentCapabilities, AgentRegistration, AgentState, MasterRegistration};
pub use history::{HistoryEntry, JobEvent, JobEventKind};
pub use job::Job;
pub use task::{Goal, Task, TaskState, TaskStatus};

use helios_coordination::Version;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{ModelError, Result};

/// A record together with the version of the node it was read from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

pub(crate) fn encode<T: Serialize>(path: &str, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|source| ModelError::Serialization {
        path: path.to_string(),
        source,
    })
}

pub(crate) fn decode<T: DeserializeOwned>(path: &str, data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|source| ModelError::Serialization {
        path: path.to_string(),
        source,
    })
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
