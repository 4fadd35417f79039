//! Operations: single named changes against one path
//!
//! An `Operation` is an immutable value; it does nothing until it is appended
//! to a [`Transaction`](crate::Transaction) and committed.

use std::fmt;

use crate::error::Result;
use crate::paths::validate_path;
use crate::store::{CreateMode, StoreOp, Version};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Create a node with an empty payload
    Create { path: String, mode: CreateMode },
    CreateWithData {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    /// Create a node, then set its payload guarded by `version`, in one commit
    CreateWithDataAndVersion {
        path: String,
        data: Vec<u8>,
        version: Version,
        mode: CreateMode,
    },
    /// Unconditional payload write
    SetData { path: String, data: Vec<u8> },
    SetDataWithVersion {
        path: String,
        data: Vec<u8>,
        version: Version,
    },
    /// Unconditional delete
    Delete { path: String },
    DeleteWithVersion { path: String, version: Version },
    /// Precondition only: the node must be at exactly `version`
    CheckVersion { path: String, version: Version },
}

impl Operation {
    pub fn create(path: impl Into<String>) -> Self {
        Self::Create {
            path: path.into(),
            mode: CreateMode::Persistent,
        }
    }

    pub fn create_with_data(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::CreateWithData {
            path: path.into(),
            data: data.into(),
            mode: CreateMode::Persistent,
        }
    }

    pub fn create_with_data_and_version(
        path: impl Into<String>,
        data: impl Into<Vec<u8>>,
        version: Version,
    ) -> Self {
        Self::CreateWithDataAndVersion {
            path: path.into(),
            data: data.into(),
            version,
            mode: CreateMode::Persistent,
        }
    }

    pub fn set_data(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::SetData {
            path: path.into(),
            data: data.into(),
        }
    }

    pub fn set_data_with_version(
        path: impl Into<String>,
        data: impl Into<Vec<u8>>,
        version: Version,
    ) -> Self {
        Self::SetDataWithVersion {
            path: path.into(),
            data: data.into(),
            version,
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::Delete { path: path.into() }
    }

    pub fn delete_with_version(path: impl Into<String>, version: Version) -> Self {
        Self::DeleteWithVersion {
            path: path.into(),
            version,
        }
    }

    pub fn check_version(path: impl Into<String>, version: Version) -> Self {
        Self::CheckVersion {
            path: path.into(),
            version,
        }
    }

    /// Set the create mode; no effect on non-create operations.
    pub fn with_mode(mut self, new_mode: CreateMode) -> Self {
        match &mut self {
            Self::Create { mode, .. }
            | Self::CreateWithData { mode, .. }
            | Self::CreateWithDataAndVersion { mode, .. } => *mode = new_mode,
            _ => {}
        }
        self
    }

    pub fn ephemeral(self) -> Self {
        self.with_mode(CreateMode::Ephemeral)
    }

    pub fn sequential(self) -> Self {
        self.with_mode(CreateMode::PersistentSequential)
    }

    pub fn path(&self) -> &str {
        match self {
            Self::Create { path, .. }
            | Self::CreateWithData { path, .. }
            | Self::CreateWithDataAndVersion { path, .. }
            | Self::SetData { path, .. }
            | Self::SetDataWithVersion { path, .. }
            | Self::Delete { path }
            | Self::DeleteWithVersion { path, .. }
            | Self::CheckVersion { path, .. } => path,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::CreateWithData { .. } => "create-with-data",
            Self::CreateWithDataAndVersion { .. } => "create-with-data-and-version",
            Self::SetData { .. } => "set-data",
            Self::SetDataWithVersion { .. } => "set-data-with-version",
            Self::Delete { .. } => "delete",
            Self::DeleteWithVersion { .. } => "delete-with-version",
            Self::CheckVersion { .. } => "check-version",
        }
    }

    pub fn mode(&self) -> Option<CreateMode> {
        match self {
            Self::Create { mode, .. }
            | Self::CreateWithData { mode, .. }
            | Self::CreateWithDataAndVersion { mode, .. } => Some(*mode),
            _ => None,
        }
    }

    /// Whether committing the operation changes the store.
    pub fn is_write(&self) -> bool {
        !matches!(self, Self::CheckVersion { .. })
    }

    pub fn validate(&self) -> Result<()> {
        let mode = self.mode().unwrap_or_default();
        validate_path(self.path(), mode)?;
        if let Self::CreateWithDataAndVersion { mode, .. } = self
            && mode.is_sequential()
        {
            // The follow-up set-data cannot address a store-named node
            return Err(crate::CoordinationError::InvalidPath {
                index: None,
                path: self.path().to_string(),
            });
        }
        Ok(())
    }

    /// Primitive store ops, in order, that implement this operation.
    pub fn expand(&self) -> Vec<StoreOp> {
        match self.clone() {
            Self::Create { path, mode } => vec![StoreOp::Create {
                path,
                data: Vec::new(),
                mode,
            }],
            Self::CreateWithData { path, data, mode } => {
                vec![StoreOp::Create { path, data, mode }]
            }
            Self::CreateWithDataAndVersion {
                path,
                data,
                version,
                mode,
            } => vec![
                StoreOp::Create {
                    path: path.clone(),
                    data: Vec::new(),
                    mode,
                },
                StoreOp::SetData {
                    path,
                    data,
                    version: Some(version),
                },
            ],
            Self::SetData { path, data } => vec![StoreOp::SetData {
                path,
                data,
                version: None,
            }],
            Self::SetDataWithVersion {
                path,
                data,
                version,
            } => vec![StoreOp::SetData {
                path,
                data,
                version: Some(version),
            }],
            Self::Delete { path } => vec![StoreOp::Delete {
                path,
                version: None,
            }],
            Self::DeleteWithVersion { path, version } => vec![StoreOp::Delete {
                path,
                version: Some(version),
            }],
            Self::CheckVersion { path, version } => vec![StoreOp::Check { path, version }],
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name(), self.path())?;
        match self {
            Self::CreateWithDataAndVersion { version, .. }
            | Self::SetDataWithVersion { version, .. }
            | Self::DeleteWithVersion { version, .. }
            | Self::CheckVersion { version, .. } => write!(f, " @{}", version),
            _ => Ok(()),
        }
    }
}
