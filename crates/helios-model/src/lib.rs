//! Helios domain model
//!
//! Job, task and agent records as stored in the coordination namespace, and
//! the master and agent models that turn domain actions into transactions:
//! - [`MasterModel`]: job lifecycle, deployments, cluster views, job history
//! - [`AgentModel`]: agent registration, desired state, task status reports

pub mod error;
pub mod model;
pub mod service;

pub use error::{ModelError, Result};
pub use model::{
    AgentCapabilities, AgentRegistration, AgentState, Goal, HistoryEntry, Job, JobEvent,
    JobEventKind, MasterRegistration, Task, TaskState, TaskStatus, Versioned,
};
pub use service::{AgentModel, AgentRegistrar, AssignmentWatch, EphemeralRegistration, MasterModel};
