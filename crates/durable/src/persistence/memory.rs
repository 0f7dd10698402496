//! In-memory implementation of TaskStore for testing

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;

use super::store::*;
use crate::model::{AtomicStatus, SubtaskStatus, TaskStatus};

#[derive(Default)]
struct Tables {
    tasks: BTreeMap<i64, TaskRecord>,
    subtasks: BTreeMap<i64, SubtaskRecord>,
    atomics: BTreeMap<i64, AtomicRecord>,
    next_task_id: i64,
    next_subtask_id: i64,
    next_atomic_id: i64,
}

impl Tables {
    fn subtask_mut(&mut self, subtask_id: i64) -> Result<&mut SubtaskRecord, StoreError> {
        self.subtasks
            .get_mut(&subtask_id)
            .ok_or(StoreError::SubtaskNotFound(subtask_id))
    }
}

/// In-memory implementation of TaskStore
///
/// This is primarily for testing. A single lock guards all three tables,
/// so every operation is atomic with respect to every other, which is at
/// least as strong as what the PostgreSQL store guarantees.
///
/// # Example
///
/// ```
/// use tasklane_durable::InMemoryTaskStore;
///
/// let store = InMemoryTaskStore::new();
/// ```
pub struct InMemoryTaskStore {
    tables: RwLock<Tables>,
}

impl InMemoryTaskStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Get the number of tasks
    pub fn task_count(&self) -> usize {
        self.tables.read().tasks.len()
    }

    /// Get the number of atomics across all subtasks
    pub fn atomic_count(&self) -> usize {
        self.tables.read().atomics.len()
    }

    /// Clear all data
    pub fn clear(&self) {
        *self.tables.write() = Tables::default();
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(&self, name: &str, project_name: &str) -> Result<TaskRecord, StoreError> {
        let mut tables = self.tables.write();
        tables.next_task_id += 1;
        let record = TaskRecord {
            id: tables.next_task_id,
            name: name.to_string(),
            project_name: project_name.to_string(),
            status: TaskStatus::Generating,
            time_added: Utc::now(),
            time_started: None,
        };
        tables.tasks.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.tables.read().tasks.get(&task_id).cloned())
    }

    async fn find_tasks_by_name(
        &self,
        name: &str,
        include_failed: bool,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .tasks
            .values()
            .filter(|t| t.name == name)
            .filter(|t| include_failed || t.status != TaskStatus::Failed)
            .cloned()
            .collect())
    }

    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, StoreError> {
        Ok(self.tables.read().tasks.values().cloned().collect())
    }

    async fn set_task_status(&self, task_id: i64, status: TaskStatus) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let task = tables
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        task.status = status;
        Ok(())
    }

    async fn mark_task_started(&self, task_id: i64) -> Result<bool, StoreError> {
        let mut tables = self.tables.write();
        let task = tables
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        if task.time_started.is_some() {
            return Ok(false);
        }
        task.time_started = Some(Utc::now());
        Ok(true)
    }

    async fn delete_task(&self, task_id: i64) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if tables.tasks.remove(&task_id).is_none() {
            return Err(StoreError::TaskNotFound(task_id));
        }
        let subtask_ids: Vec<i64> = tables
            .subtasks
            .values()
            .filter(|s| s.task_id == task_id)
            .map(|s| s.id)
            .collect();
        tables
            .atomics
            .retain(|_, a| !subtask_ids.contains(&a.subtask_id));
        tables.subtasks.retain(|_, s| s.task_id != task_id);
        Ok(())
    }

    async fn insert_subtask(&self, subtask: NewSubtask) -> Result<SubtaskRecord, StoreError> {
        let mut tables = self.tables.write();
        if !tables.tasks.contains_key(&subtask.task_id) {
            return Err(StoreError::TaskNotFound(subtask.task_id));
        }
        tables.next_subtask_id += 1;
        let record = SubtaskRecord {
            id: tables.next_subtask_id,
            task_id: subtask.task_id,
            name: subtask.name,
            executor_kind: subtask.executor_kind,
            init_params: subtask.init_params,
            depends_on: subtask.depends_on,
            num: 0,
            done: 0,
            retries: subtask.retries,
            status: SubtaskStatus::Queued,
            error_message: None,
        };
        tables.subtasks.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_subtask(&self, subtask_id: i64) -> Result<Option<SubtaskRecord>, StoreError> {
        Ok(self.tables.read().subtasks.get(&subtask_id).cloned())
    }

    async fn list_subtasks(&self, task_id: i64) -> Result<Vec<SubtaskRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .subtasks
            .values()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn pending_subtasks(
        &self,
        task_id: i64,
        limit: usize,
    ) -> Result<Vec<SubtaskRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .subtasks
            .values()
            .filter(|s| s.task_id == task_id && s.status.is_pending())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn set_subtask_status(
        &self,
        subtask_id: i64,
        status: SubtaskStatus,
    ) -> Result<(), StoreError> {
        self.tables.write().subtask_mut(subtask_id)?.status = status;
        Ok(())
    }

    async fn set_subtask_retries(&self, subtask_id: i64, retries: u32) -> Result<(), StoreError> {
        self.tables.write().subtask_mut(subtask_id)?.retries = retries;
        Ok(())
    }

    async fn reset_failed_subtasks(&self, task_id: i64, retries: u32) -> Result<u64, StoreError> {
        let mut tables = self.tables.write();
        let mut reset = Vec::new();
        for subtask in tables.subtasks.values_mut() {
            if subtask.task_id == task_id && subtask.status == SubtaskStatus::Failed {
                subtask.status = SubtaskStatus::Queued;
                subtask.retries = retries;
                subtask.error_message = None;
                reset.push(subtask.id);
            }
        }
        for atomic in tables.atomics.values_mut() {
            if reset.contains(&atomic.subtask_id) && atomic.status == AtomicStatus::Failed {
                atomic.status = AtomicStatus::Queued;
            }
        }
        Ok(reset.len() as u64)
    }

    async fn enqueue_atomic(
        &self,
        subtask_id: i64,
        method_name: &str,
        params: Vec<Value>,
    ) -> Result<AtomicRecord, StoreError> {
        let mut tables = self.tables.write();
        tables.subtask_mut(subtask_id)?.num += 1;
        tables.next_atomic_id += 1;
        let record = AtomicRecord {
            id: tables.next_atomic_id,
            subtask_id,
            method_name: method_name.to_string(),
            params,
            status: AtomicStatus::Queued,
            error: None,
        };
        tables.atomics.insert(record.id, record.clone());
        Ok(record)
    }

    async fn pending_atomics(
        &self,
        subtask_id: i64,
        limit: usize,
    ) -> Result<Vec<AtomicRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .atomics
            .values()
            .filter(|a| a.subtask_id == subtask_id && a.status == AtomicStatus::Queued)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn finish_atomic(
        &self,
        atomic_id: i64,
        status: AtomicStatus,
        error: Option<&str>,
        message: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write();
        let atomic = tables
            .atomics
            .get_mut(&atomic_id)
            .ok_or(StoreError::AtomicNotFound(atomic_id))?;
        if atomic.status == AtomicStatus::Done {
            return Ok(false);
        }
        atomic.status = status;
        atomic.error = error.map(str::to_string);
        let subtask_id = atomic.subtask_id;

        let subtask = tables.subtask_mut(subtask_id)?;
        match status {
            AtomicStatus::Done if subtask.done < subtask.num => subtask.done += 1,
            AtomicStatus::Failed => {
                if let Some(message) = message {
                    subtask.error_message = Some(message.to_string());
                }
            }
            _ => {}
        }
        Ok(true)
    }

    async fn requeue_failed_atomics(&self, subtask_id: i64) -> Result<u64, StoreError> {
        let mut tables = self.tables.write();
        let mut count = 0;
        for atomic in tables.atomics.values_mut() {
            if atomic.subtask_id == subtask_id && atomic.status == AtomicStatus::Failed {
                atomic.status = AtomicStatus::Queued;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn list_atomics(&self, subtask_id: i64) -> Result<Vec<AtomicRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .atomics
            .values()
            .filter(|a| a.subtask_id == subtask_id)
            .cloned()
            .collect())
    }

    async fn progress_totals(&self, task_id: i64) -> Result<ProgressTotals, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .subtasks
            .values()
            .filter(|s| s.task_id == task_id)
            .fold(ProgressTotals::default(), |acc, s| ProgressTotals {
                total: acc.total + s.num,
                completed: acc.completed + s.done,
            }))
    }

    async fn current_subtask(&self, task_id: i64) -> Result<Option<CurrentSubtask>, StoreError> {
        Ok(self
            .tables
            .read()
            .subtasks
            .values()
            .find(|s| s.task_id == task_id && s.status != SubtaskStatus::Done)
            .map(|s| CurrentSubtask {
                name: s.name.clone(),
                status: s.status,
            }))
    }
}
