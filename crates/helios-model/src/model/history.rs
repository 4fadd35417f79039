use helios_coordination::{AgentId, EventSeq, TaskId};
use serde::{Deserialize, Serialize};

use super::task::{Goal, TaskState};

/// What happened to a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobEventKind {
    Created,
    Deployed { agent: AgentId, task: TaskId, goal: Goal },
    GoalChanged { agent: AgentId, task: TaskId, goal: Goal },
    Undeployed { agent: AgentId, task: TaskId },
    TaskStateChanged { agent: AgentId, task: TaskId, state: TaskState },
}

/// Payload of a `/history/jobs/<job>/<seq>` node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Epoch millis
    pub timestamp: i64,
    #[serde(flatten)]
    pub kind: JobEventKind,
}

impl JobEvent {
    pub fn new(kind: JobEventKind) -> Self {
        Self {
            timestamp: super::now_millis(),
            kind,
        }
    }
}

/// A stored history event with the sequence the store assigned to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    pub seq: EventSeq,
    pub event: JobEvent,
}
