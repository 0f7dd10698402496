//! Single-runner-per-task locking
//!
//! A task may be executed by at most one runner at a time, across
//! processes. Runners take a [`HeldLock`] before touching a task and the
//! lock is released when the guard drops, including during unwinding.

mod file;
mod memory;

use std::fmt;
use std::sync::Arc;

use tracing::warn;

pub use file::FileLockProvider;
pub use memory::InMemoryLockProvider;

/// Lock errors
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identifies one lockable task
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockScope {
    pub namespace: String,
    pub task_id: i64,
}

impl LockScope {
    pub fn new(namespace: impl Into<String>, task_id: i64) -> Self {
        Self {
            namespace: namespace.into(),
            task_id,
        }
    }
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.task_id)
    }
}

/// Non-blocking, cross-process advisory lock keyed by [`LockScope`]
pub trait TaskLock: Send + Sync + 'static {
    /// Take the lock if nobody holds it
    ///
    /// Returns `false` when the lock is held, by this provider or another.
    fn try_acquire(&self, scope: &LockScope) -> Result<bool, LockError>;

    /// Release a lock taken by this provider; no-op otherwise
    fn release(&self, scope: &LockScope) -> Result<(), LockError>;

    /// Whether anyone currently holds the lock
    fn is_held(&self, scope: &LockScope) -> Result<bool, LockError>;
}

/// RAII guard over an acquired lock
pub struct HeldLock {
    locks: Arc<dyn TaskLock>,
    scope: LockScope,
    released: bool,
}

impl HeldLock {
    /// Try to take `scope`; `None` if someone else holds it
    pub fn try_acquire(
        locks: Arc<dyn TaskLock>,
        scope: LockScope,
    ) -> Result<Option<Self>, LockError> {
        if !locks.try_acquire(&scope)? {
            return Ok(None);
        }
        Ok(Some(Self {
            locks,
            scope,
            released: false,
        }))
    }

    pub fn scope(&self) -> &LockScope {
        &self.scope
    }

    /// Release now and surface any error
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.locks.release(&self.scope)
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.locks.release(&self.scope) {
            warn!(scope = %self.scope, error = %e, "failed to release task lock");
        }
    }
}
