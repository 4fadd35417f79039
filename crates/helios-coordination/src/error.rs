//! Coordination error types

use std::fmt;

use crate::store::{StoreError, Version};

/// What is known about the effects of a failed commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing was applied
    NotApplied,
    /// The commit may or may not have been applied
    Unknown,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotApplied => f.write_str("not applied"),
            Self::Unknown => f.write_str("outcome unknown"),
        }
    }
}

/// Coarse classification for outer surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A precondition no longer holds; re-read and recompute
    Conflict,
    NotFound,
    /// The store could not be reached or the session was lost
    Unavailable,
    /// The request itself is malformed
    Invalid,
}

/// Error type for coordination operations
///
/// Node-level variants carry the index of the failing operation when the
/// error came out of a transaction commit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinationError {
    #[error("node not found: {path}{}", at(.index))]
    NodeNotFound { index: Option<usize>, path: String },

    #[error("node already exists: {path}{}", at(.index))]
    NodeExists { index: Option<usize>, path: String },

    #[error("version mismatch on {path}: expected {expected}, actual {actual}{}", at(.index))]
    VersionMismatch {
        index: Option<usize>,
        path: String,
        expected: Version,
        actual: Version,
    },

    #[error("node has children: {path}{}", at(.index))]
    NotEmpty { index: Option<usize>, path: String },

    #[error("invalid path: {path}{}", at(.index))]
    InvalidPath { index: Option<usize>, path: String },

    #[error("invalid {kind}: {value:?}")]
    InvalidIdentifier { kind: &'static str, value: String },

    #[error("coordination unavailable after {attempts} attempts ({outcome})")]
    CoordinationUnavailable { attempts: u32, outcome: Outcome },

    #[error("coordination session expired")]
    SessionExpired,

    #[error("coordination session closed")]
    Closed,
}

fn at(index: &Option<usize>) -> String {
    match index {
        Some(index) => format!(" (operation {})", index),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, CoordinationError>;

impl CoordinationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NodeExists { .. } | Self::VersionMismatch { .. } | Self::NotEmpty { .. } => {
                ErrorKind::Conflict
            }
            Self::NodeNotFound { .. } => ErrorKind::NotFound,
            Self::InvalidPath { .. } | Self::InvalidIdentifier { .. } => ErrorKind::Invalid,
            Self::CoordinationUnavailable { .. } | Self::SessionExpired | Self::Closed => {
                ErrorKind::Unavailable
            }
        }
    }

    /// Index of the failing operation inside a transaction, if known.
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::NodeNotFound { index, .. }
            | Self::NodeExists { index, .. }
            | Self::VersionMismatch { index, .. }
            | Self::NotEmpty { index, .. }
            | Self::InvalidPath { index, .. } => *index,
            _ => None,
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            Self::NodeNotFound { path, .. }
            | Self::NodeExists { path, .. }
            | Self::VersionMismatch { path, .. }
            | Self::NotEmpty { path, .. }
            | Self::InvalidPath { path, .. } => Some(path),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub(crate) fn with_index(mut self, new_index: Option<usize>) -> Self {
        match &mut self {
            Self::NodeNotFound { index, .. }
            | Self::NodeExists { index, .. }
            | Self::VersionMismatch { index, .. }
            | Self::NotEmpty { index, .. }
            | Self::InvalidPath { index, .. } => *index = new_index,
            _ => {}
        }
        self
    }
}

impl From<StoreError> for CoordinationError {
    fn from(err: StoreError) -> Self {
        let (index, err) = err.into_indexed();
        match err {
            StoreError::NoNode { path } => Self::NodeNotFound { index, path },
            StoreError::NodeExists { path } => Self::NodeExists { index, path },
            StoreError::BadVersion {
                path,
                expected,
                actual,
            } => Self::VersionMismatch {
                index,
                path,
                expected,
                actual,
            },
            StoreError::NotEmpty { path } => Self::NotEmpty { index, path },
            StoreError::NoChildrenForEphemerals { path } | StoreError::InvalidPath { path } => {
                Self::InvalidPath { index, path }
            }
            StoreError::ConnectionLoss | StoreError::OperationTimeout => {
                Self::CoordinationUnavailable {
                    attempts: 1,
                    outcome: Outcome::Unknown,
                }
            }
            StoreError::SessionExpired => Self::SessionExpired,
            StoreError::Closed => Self::Closed,
            // into_indexed never yields a nested multi error
            StoreError::Multi { source, .. } => Self::from(*source).with_index(index),
        }
    }
}
