//! Shared engine context and task lookup

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::lock::{LockScope, TaskLock};
use crate::persistence::TaskStore;
use crate::worker::ExecutorRegistry;

use super::subtask::Subtask;
use super::task::Task;

/// Longest task or subtask name the store keeps
pub const MAX_NAME_LEN: usize = 250;

pub(crate) fn truncate_name(name: &str) -> String {
    name.chars().take(MAX_NAME_LEN).collect()
}

/// Everything a task run needs: store, lock provider, executors and tunables
///
/// Cheap to clone; every [`Task`] and [`Subtask`] carries one.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tasklane_durable::{
///     EngineConfig, ExecutorRegistry, InMemoryLockProvider, InMemoryTaskStore, TaskQueue,
/// };
///
/// let queue = TaskQueue::new(
///     Arc::new(InMemoryTaskStore::new()),
///     Arc::new(InMemoryLockProvider::new()),
///     Arc::new(ExecutorRegistry::new()),
///     EngineConfig::default(),
/// );
/// assert_eq!(queue.config().num_workers, 4);
/// ```
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    locks: Arc<dyn TaskLock>,
    registry: Arc<ExecutorRegistry>,
    config: Arc<EngineConfig>,
}

impl TaskQueue {
    pub fn new(
        store: Arc<dyn TaskStore>,
        locks: Arc<dyn TaskLock>,
        registry: Arc<ExecutorRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            locks,
            registry,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<dyn TaskLock> {
        &self.locks
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Lock scope of a task in this queue's namespace
    pub fn lock_scope(&self, task_id: i64) -> LockScope {
        LockScope::new(self.config.lock_namespace.clone(), task_id)
    }

    /// Create a task in status `generating`
    #[instrument(skip(self))]
    pub async fn create_task(&self, name: &str, project_name: &str) -> Result<Task, EngineError> {
        let record = self
            .store
            .create_task(&truncate_name(name), project_name)
            .await?;
        info!(task_id = record.id, "task created");
        Ok(Task::from_record(self.clone(), record))
    }

    /// First non-failed task called `name`, or a new one
    #[instrument(skip(self))]
    pub async fn load_or_create(&self, name: &str, project_name: &str) -> Result<Task, EngineError> {
        let name = truncate_name(name);
        let existing = self.store.find_tasks_by_name(&name, false).await?;
        match existing.into_iter().next() {
            Some(record) => {
                debug!(task_id = record.id, "reusing existing task");
                Ok(Task::from_record(self.clone(), record))
            }
            None => self.create_task(&name, project_name).await,
        }
    }

    pub async fn load(&self, task_id: i64) -> Result<Option<Task>, EngineError> {
        let record = self.store.get_task(task_id).await?;
        Ok(record.map(|record| Task::from_record(self.clone(), record)))
    }

    /// Every task, in id order
    pub async fn load_all(&self) -> Result<Vec<Task>, EngineError> {
        let records = self.store.list_tasks().await?;
        Ok(records
            .into_iter()
            .map(|record| Task::from_record(self.clone(), record))
            .collect())
    }

    /// Every task called `name`, failed ones included
    pub async fn load_by_name(&self, name: &str) -> Result<Vec<Task>, EngineError> {
        let records = self
            .store
            .find_tasks_by_name(&truncate_name(name), true)
            .await?;
        Ok(records
            .into_iter()
            .map(|record| Task::from_record(self.clone(), record))
            .collect())
    }

    pub async fn subtask(&self, subtask_id: i64) -> Result<Option<Subtask>, EngineError> {
        let record = self.store.get_subtask(subtask_id).await?;
        Ok(record.map(|record| Subtask::from_record(self.clone(), record)))
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
