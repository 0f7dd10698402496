//! Engine error type

use crate::lock::LockError;
use crate::persistence::StoreError;
use crate::worker::WorkerPoolError;

/// Errors returned by task, subtask and runner operations
///
/// Handler failures never show up here: they are recorded on the atomic and
/// drive the retry machinery instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store failure; always fatal to the current run
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Lock provider failure
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Worker pool could not be started
    #[error(transparent)]
    WorkerPool(#[from] WorkerPoolError),

    /// Task does not exist
    #[error("task not found: {0}")]
    TaskNotFound(i64),

    /// Subtask does not exist
    #[error("subtask not found: {0}")]
    SubtaskNotFound(i64),

    /// A spawned dispatch or run panicked or was cancelled
    #[error("dispatch aborted: {0}")]
    Dispatch(String),
}
