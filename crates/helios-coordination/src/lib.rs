//! Helios coordination layer
//!
//! Every state change in a Helios cluster is an atomic, version-guarded
//! transaction against a shared hierarchical store. This crate provides:
//! - [`CoordinationSession`]: the process-wide store connection, with bounded
//!   retry and connection-state tracking
//! - [`Operation`] and [`Transaction`]: composable all-or-nothing commits
//! - [`PathLayout`]: the namespace convention for jobs, tasks and agents
//! - [`ChangeDispatcher`]: durable watches on top of one-shot notifications
//! - [`LeaderElector`]: single active master election
//!
//! The store itself sits behind the [`store::CoordinationStore`] trait;
//! [`store::MemoryStore`] is an in-process implementation.

pub mod dispatcher;
pub mod election;
pub mod error;
pub mod operation;
pub mod paths;
pub mod retry;
pub mod session;
pub mod store;
pub mod transaction;

pub use dispatcher::{
    ChangeDispatcher, ChangeEvent, ChangeListener, ChangeNotification, FnChangeListener, NodeData,
    Snapshot, WatchKind, WatchRegistration,
};
pub use election::{ElectionState, LeaderElector, LeadershipToken};
pub use error::{CoordinationError, ErrorKind, Outcome, Result};
pub use operation::Operation;
pub use paths::{AgentId, EventSeq, JobId, ManagedPath, MasterId, PathLayout, TaskId};
pub use retry::{ErrorClass, RetryDecision, RetryPolicy};
pub use session::{ConnectionState, CoordinationSession, SessionConfig, SessionStatus};
pub use store::{CreateMode, NodeStat, Version};
pub use transaction::{CommitResult, OperationResult, Transaction};
