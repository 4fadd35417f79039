//! Model error types

use helios_coordination::{AgentId, CoordinationError, ErrorKind, JobId, TaskId};

/// Error type for master and agent model operations
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("job already exists: {0}")]
    JobExists(JobId),

    #[error("job {job} is still deployed on {agents:?}")]
    JobStillDeployed { job: JobId, agents: Vec<AgentId> },

    #[error("invalid job definition: {0}")]
    InvalidJob(String),

    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("task {task} already assigned to {agent}")]
    TaskAlreadyAssigned { agent: AgentId, task: TaskId },

    #[error("task {task} not assigned to {agent}")]
    TaskNotAssigned { agent: AgentId, task: TaskId },

    #[error("malformed payload at {path}: {source}")]
    Serialization {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

pub type Result<T> = std::result::Result<T, ModelError>;

impl ModelError {
    /// Classification for outer surfaces: stale preconditions are conflicts,
    /// store trouble is unavailability.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::JobNotFound(_) | Self::AgentNotFound(_) | Self::TaskNotAssigned { .. } => {
                ErrorKind::NotFound
            }
            Self::JobExists(_) | Self::JobStillDeployed { .. } | Self::TaskAlreadyAssigned { .. } => {
                ErrorKind::Conflict
            }
            Self::InvalidJob(_) | Self::Serialization { .. } => ErrorKind::Invalid,
            Self::Coordination(e) => e.kind(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}
