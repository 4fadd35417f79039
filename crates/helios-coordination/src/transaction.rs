//! Transactions: ordered operations committed atomically

use crate::error::{CoordinationError, Result};
use crate::operation::Operation;
use crate::session::CoordinationSession;
use crate::store::{CreateMode, OpResult, StoreError, StoreOp, Version};

/// An ordered set of operations applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    operations: Vec<Operation>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder step
    pub fn append(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Commit through `session`. The transaction is consumed either way.
    pub async fn commit(self, session: &CoordinationSession) -> Result<CommitResult> {
        session.submit(self).await
    }

    /// Validate every operation and expand to primitive store ops.
    pub(crate) fn compile(self) -> Result<CompiledTransaction> {
        let mut ops = Vec::new();
        let mut origins = Vec::new();
        for (index, operation) in self.operations.iter().enumerate() {
            operation
                .validate()
                .map_err(|e| e.with_index(Some(index)))?;
            for op in operation.expand() {
                ops.push(op);
                origins.push(index);
            }
        }
        Ok(CompiledTransaction {
            operations: self.operations,
            ops,
            origins,
        })
    }
}

impl From<Vec<Operation>> for Transaction {
    fn from(operations: Vec<Operation>) -> Self {
        Self { operations }
    }
}

impl FromIterator<Operation> for Transaction {
    fn from_iter<I: IntoIterator<Item = Operation>>(iter: I) -> Self {
        Self {
            operations: iter.into_iter().collect(),
        }
    }
}

/// A transaction lowered to primitive store ops, remembering which operation
/// each primitive op came from.
#[derive(Debug, Clone)]
pub(crate) struct CompiledTransaction {
    operations: Vec<Operation>,
    ops: Vec<StoreOp>,
    origins: Vec<usize>,
}

impl CompiledTransaction {
    pub(crate) fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub(crate) fn has_writes(&self) -> bool {
        self.operations.iter().any(Operation::is_write)
    }

    /// Map a store failure index back to the operation that produced it.
    /// Failures of ops appended after the compiled ones carry no index.
    pub(crate) fn map_error(&self, err: StoreError) -> CoordinationError {
        let (index, _) = err.clone().into_indexed();
        let origin = index.and_then(|i| self.origins.get(i).copied());
        CoordinationError::from(err).with_index(origin)
    }

    /// Fold primitive results into one result per operation.
    pub(crate) fn collect(&self, results: Vec<OpResult>) -> Vec<OperationResult> {
        let mut collected: Vec<OperationResult> = Vec::with_capacity(self.operations.len());
        let mut last_origin = None;
        for (result, &origin) in results.into_iter().zip(&self.origins) {
            let folded = match result {
                OpResult::Created { path } => OperationResult::Created { path },
                OpResult::SetData { stat } => OperationResult::Updated {
                    version: stat.version,
                },
                OpResult::Deleted => OperationResult::Deleted,
                OpResult::Checked => OperationResult::Checked,
            };
            if last_origin == Some(origin) {
                // Second half of a create-with-data-and-version keeps the created path
                continue;
            }
            last_origin = Some(origin);
            collected.push(folded);
        }
        collected
    }

    /// Results for a commit confirmed applied without its acknowledgement.
    pub(crate) fn recovered(&self) -> Vec<OperationResult> {
        self.operations
            .iter()
            .map(|operation| match operation {
                Operation::Create { path, mode }
                | Operation::CreateWithData { path, mode, .. }
                | Operation::CreateWithDataAndVersion { path, mode, .. }
                    if !mode.is_sequential() =>
                {
                    OperationResult::Created { path: path.clone() }
                }
                Operation::Delete { .. } | Operation::DeleteWithVersion { .. } => {
                    OperationResult::Deleted
                }
                Operation::CheckVersion { .. } => OperationResult::Checked,
                _ => OperationResult::Applied,
            })
            .collect()
    }
}

/// Outcome of one operation in a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    /// Actual path of the created node
    Created { path: String },
    /// New data version
    Updated { version: Version },
    Deleted,
    Checked,
    /// Applied, but the store-assigned detail was lost with the acknowledgement
    Applied,
}

/// Result of a successful commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitResult {
    /// One entry per operation, in append order
    pub results: Vec<OperationResult>,
    /// Store round trips used
    pub attempts: u32,
    /// True when the commit was confirmed through its commit marker after an
    /// indeterminate failure
    pub recovered: bool,
}

impl CommitResult {
    pub(crate) fn empty() -> Self {
        Self::default()
    }

    /// Path created by operation `index`, if known.
    pub fn created_path(&self, index: usize) -> Option<&str> {
        match self.results.get(index) {
            Some(OperationResult::Created { path }) => Some(path),
            _ => None,
        }
    }

    /// New version written by operation `index`, if known.
    pub fn updated_version(&self, index: usize) -> Option<Version> {
        match self.results.get(index) {
            Some(OperationResult::Updated { version }) => Some(*version),
            _ => None,
        }
    }
}

/// Marker create appended to write transactions.
pub(crate) fn marker_op(path: &str) -> StoreOp {
    StoreOp::Create {
        path: path.to_string(),
        data: Vec::new(),
        mode: CreateMode::Ephemeral,
    }
}
