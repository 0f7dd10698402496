//! In-process lock provider for tests and single-process deployments

use std::collections::HashSet;

use parking_lot::Mutex;

use super::{LockError, LockScope, TaskLock};

/// Lock provider backed by a set of held scopes
#[derive(Default)]
pub struct InMemoryLockProvider {
    held: Mutex<HashSet<LockScope>>,
}

impl InMemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskLock for InMemoryLockProvider {
    fn try_acquire(&self, scope: &LockScope) -> Result<bool, LockError> {
        Ok(self.held.lock().insert(scope.clone()))
    }

    fn release(&self, scope: &LockScope) -> Result<(), LockError> {
        self.held.lock().remove(scope);
        Ok(())
    }

    fn is_held(&self, scope: &LockScope) -> Result<bool, LockError> {
        Ok(self.held.lock().contains(scope))
    }
}
