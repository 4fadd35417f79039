//! Primitive client contract of the external coordination store
//!
//! The store is assumed to provide linearizable reads and writes, ephemeral
//! session-scoped nodes, sequential node naming, atomic multi-path commit and
//! one-shot change notifications. Everything above this module is built only
//! on the traits defined here.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use memory::{Fault, MemoryStore};

/// Per-node version counter. A freshly created node is at version 0.
pub type Version = u32;

/// Identity of one store session.
pub type SessionId = u64;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Receiving side of a session's event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<StoreEvent>;

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CreateMode {
    #[default]
    Persistent,
    Ephemeral,
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(self, Self::PersistentSequential | Self::EphemeralSequential)
    }
}

/// Metadata of a stored node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeStat {
    /// Data version, incremented on every successful set
    pub version: Version,
    /// Children version, incremented on every child create or delete
    pub child_version: Version,
    pub num_children: u32,
    /// Owning session for ephemeral nodes
    pub ephemeral_owner: Option<SessionId>,
    /// Id of the transaction that created the node; changes when a node is
    /// deleted and created again
    pub created: u64,
}

/// A single primitive write inside an atomic multi commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    SetData {
        path: String,
        data: Vec<u8>,
        version: Option<Version>,
    },
    Delete {
        path: String,
        version: Option<Version>,
    },
    Check {
        path: String,
        version: Version,
    },
}

impl StoreOp {
    pub fn path(&self) -> &str {
        match self {
            Self::Create { path, .. }
            | Self::SetData { path, .. }
            | Self::Delete { path, .. }
            | Self::Check { path, .. } => path,
        }
    }
}

/// Result of one primitive op in a successful multi commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    /// Actual path created (differs from the requested one for sequential nodes)
    Created { path: String },
    SetData { stat: NodeStat },
    Deleted,
    Checked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    NodeCreated,
    NodeDataChanged,
    NodeDeleted,
    NodeChildrenChanged,
}

/// A fired one-shot watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub event_type: EventType,
    pub path: String,
}

/// Connection-level notifications for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Watch(WatchedEvent),
    Session(SessionEvent),
}

/// Error returned by the primitive store client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("node does not exist: {path}")]
    NoNode { path: String },

    #[error("node already exists: {path}")]
    NodeExists { path: String },

    #[error("version mismatch on {path}: expected {expected}, actual {actual}")]
    BadVersion {
        path: String,
        expected: Version,
        actual: Version,
    },

    #[error("node has children: {path}")]
    NotEmpty { path: String },

    #[error("ephemeral node cannot have children: {path}")]
    NoChildrenForEphemerals { path: String },

    #[error("invalid path: {path}")]
    InvalidPath { path: String },

    #[error("connection loss")]
    ConnectionLoss,

    #[error("operation timeout")]
    OperationTimeout,

    #[error("session expired")]
    SessionExpired,

    #[error("session closed")]
    Closed,

    #[error("operation {index} failed: {source}")]
    Multi {
        index: usize,
        source: Box<StoreError>,
    },
}

impl StoreError {
    /// Strip the multi wrapper, returning the failing op index if there was one.
    pub fn into_indexed(self) -> (Option<usize>, StoreError) {
        match self {
            Self::Multi { index, source } => (Some(index), *source),
            other => (None, other),
        }
    }
}

/// Factory for store sessions.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Open a new session. Watch and connection events for that session are
    /// delivered, in order, on the returned receiver.
    async fn connect(
        &self,
        session_timeout: Duration,
    ) -> StoreResult<(Arc<dyn StoreClient>, EventReceiver)>;
}

/// Handle to one live store session.
///
/// Requests issued on one handle are processed in order, so a read issued after
/// an indeterminate failure observes the outcome of the failed request.
#[async_trait]
pub trait StoreClient: Send + Sync + 'static {
    fn session_id(&self) -> SessionId;

    /// Read data and stat; with `watch` a data watch is armed (only if the node exists).
    async fn get(&self, path: &str, watch: bool) -> StoreResult<(Vec<u8>, NodeStat)>;

    /// Stat a node; with `watch` a data watch is armed whether or not it exists.
    async fn exists(&self, path: &str, watch: bool) -> StoreResult<Option<NodeStat>>;

    /// List child names (not full paths); with `watch` a child watch is armed.
    async fn children(&self, path: &str, watch: bool) -> StoreResult<Vec<String>>;

    /// Apply all ops atomically, in order. On failure nothing is applied and
    /// the error is `StoreError::Multi` carrying the failing op index.
    async fn multi(&self, ops: Vec<StoreOp>) -> StoreResult<Vec<OpResult>>;

    /// Wait until this session's view is caught up with the leader.
    async fn sync(&self, path: &str) -> StoreResult<()>;

    /// End the session; ephemeral nodes are removed immediately.
    async fn close(&self) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mode_flags() {
        assert!(!CreateMode::Persistent.is_ephemeral());
        assert!(!CreateMode::Persistent.is_sequential());
        assert!(CreateMode::Ephemeral.is_ephemeral());
        assert!(CreateMode::PersistentSequential.is_sequential());
        assert!(CreateMode::EphemeralSequential.is_ephemeral());
        assert!(CreateMode::EphemeralSequential.is_sequential());
    }

    #[test]
    fn test_into_indexed() {
        let err = StoreError::Multi {
            index: 2,
            source: Box::new(StoreError::NodeExists {
                path: "/a".to_string(),
            }),
        };
        let (index, inner) = err.into_indexed();
        assert_eq!(index, Some(2));
        assert!(matches!(inner, StoreError::NodeExists { .. }));

        let (index, inner) = StoreError::ConnectionLoss.into_indexed();
        assert_eq!(index, None);
        assert_eq!(inner, StoreError::ConnectionLoss);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::BadVersion {
            path: "/jobs/foo:1".to_string(),
            expected: 3,
            actual: 4,
        };
        assert_eq!(
            err.to_string(),
            "version mismatch on /jobs/foo:1: expected 3, actual 4"
        );
    }
}
