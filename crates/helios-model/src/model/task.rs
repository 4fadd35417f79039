use std::fmt;

use helios_coordination::JobId;
use serde::{Deserialize, Serialize};

/// Desired state of a task on its agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Goal {
    Start,
    Stop,
    Undeploy,
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::Undeploy => "UNDEPLOY",
        };
        f.write_str(s)
    }
}

/// Assignment payload at `/assignments/<agent>/<task>`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub job: JobId,
    pub goal: Goal,
}

impl Task {
    pub fn new(job: JobId, goal: Goal) -> Self {
        Self { job, goal }
    }
}

/// Lifecycle state reported by an agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pulling,
    Creating,
    Starting,
    Running,
    Stopping,
    Stopped,
    Exited,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Exited | Self::Failed)
    }
}

/// Status payload at `/status/tasks/<agent>/<task>`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub job: JobId,
    pub goal: Goal,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Epoch millis of the report
    pub updated: i64,
}
