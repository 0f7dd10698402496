//! TaskStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{AtomicStatus, SubtaskStatus, TaskStatus};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(i64),

    /// Subtask not found
    #[error("subtask not found: {0}")]
    SubtaskNotFound(i64),

    /// Atomic call not found
    #[error("atomic not found: {0}")]
    AtomicNotFound(i64),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A task row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    pub name: String,
    pub project_name: String,
    pub status: TaskStatus,
    pub time_added: DateTime<Utc>,

    /// Stamped once, by the first runner that acquires the task lock
    pub time_started: Option<DateTime<Utc>>,
}

/// A subtask row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskRecord {
    pub id: i64,
    pub task_id: i64,
    pub name: String,

    /// Executor kind the worker pool instantiates for this subtask
    pub executor_kind: String,

    /// Passed once to every worker at construction
    pub init_params: Vec<Value>,

    /// Reserved; the engine runs subtasks in insertion order
    pub depends_on: Option<i64>,

    /// Atomic calls ever enqueued
    pub num: i64,

    /// Atomic calls completed successfully
    pub done: i64,

    /// Remaining retry budget
    pub retries: u32,

    pub status: SubtaskStatus,
    pub error_message: Option<String>,
}

/// Subtask to be inserted
#[derive(Debug, Clone)]
pub struct NewSubtask {
    pub task_id: i64,
    pub name: String,
    pub executor_kind: String,
    pub init_params: Vec<Value>,
    pub depends_on: Option<i64>,
    pub retries: u32,
}

/// An atomic call row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicRecord {
    pub id: i64,
    pub subtask_id: i64,
    pub method_name: String,
    pub params: Vec<Value>,
    pub status: AtomicStatus,

    /// Raw failure detail of the last dispatch
    pub error: Option<String>,
}

/// Sums of the subtask counters of one task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressTotals {
    /// Sum of `num`
    pub total: i64,

    /// Sum of `done`
    pub completed: i64,
}

/// Name and status of the first subtask that is not done
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentSubtask {
    pub name: String,
    pub status: SubtaskStatus,
}

/// Durable store for tasks, subtasks and atomic calls
///
/// Implementations must be thread-safe and support concurrent access.
/// Counter updates (`num`, `done`) must be applied atomically so that
/// concurrent progress readers never observe a decreasing value.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Provision the schema (called once before first use)
    async fn migrate(&self) -> Result<(), StoreError> {
        Ok(())
    }

    // =========================================================================
    // Task Operations
    // =========================================================================

    /// Create a task in status `generating`
    async fn create_task(&self, name: &str, project_name: &str)
        -> Result<TaskRecord, StoreError>;

    /// Load a task
    async fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>, StoreError>;

    /// Tasks with the given name, in id order
    async fn find_tasks_by_name(
        &self,
        name: &str,
        include_failed: bool,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// All tasks, in id order
    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, StoreError>;

    /// Update task status
    async fn set_task_status(&self, task_id: i64, status: TaskStatus) -> Result<(), StoreError>;

    /// Stamp `time_started` if it is still unset
    ///
    /// Returns whether the stamp happened.
    async fn mark_task_started(&self, task_id: i64) -> Result<bool, StoreError>;

    /// Delete a task together with its subtasks and atomics
    async fn delete_task(&self, task_id: i64) -> Result<(), StoreError>;

    // =========================================================================
    // Subtask Operations
    // =========================================================================

    /// Insert a subtask in status `queued`
    async fn insert_subtask(&self, subtask: NewSubtask) -> Result<SubtaskRecord, StoreError>;

    /// Load a subtask
    async fn get_subtask(&self, subtask_id: i64) -> Result<Option<SubtaskRecord>, StoreError>;

    /// All subtasks of a task, in id order
    async fn list_subtasks(&self, task_id: i64) -> Result<Vec<SubtaskRecord>, StoreError>;

    /// Up to `limit` pending (queued or running) subtasks, in id order
    async fn pending_subtasks(
        &self,
        task_id: i64,
        limit: usize,
    ) -> Result<Vec<SubtaskRecord>, StoreError>;

    /// Update subtask status
    async fn set_subtask_status(
        &self,
        subtask_id: i64,
        status: SubtaskStatus,
    ) -> Result<(), StoreError>;

    /// Overwrite the retry budget
    async fn set_subtask_retries(&self, subtask_id: i64, retries: u32)
        -> Result<(), StoreError>;

    /// Put failed subtasks (and their failed atomics) of a task back into the queue
    ///
    /// Returns the number of subtasks reset.
    async fn reset_failed_subtasks(&self, task_id: i64, retries: u32)
        -> Result<u64, StoreError>;

    // =========================================================================
    // Atomic Operations
    // =========================================================================

    /// Insert a queued atomic and bump the subtask's `num` in one transaction
    async fn enqueue_atomic(
        &self,
        subtask_id: i64,
        method_name: &str,
        params: Vec<Value>,
    ) -> Result<AtomicRecord, StoreError>;

    /// Up to `limit` queued atomics of a subtask, in id order
    async fn pending_atomics(
        &self,
        subtask_id: i64,
        limit: usize,
    ) -> Result<Vec<AtomicRecord>, StoreError>;

    /// Record the outcome of a dispatch together with its subtask counters
    ///
    /// One write: the atomic takes `status` and `error`, then a `Done`
    /// outcome bumps the subtask's `done` (never past `num`) and a `Failed`
    /// one stores `message` as the subtask's last error. An atomic that is
    /// already `done` is left untouched and `false` is returned.
    async fn finish_atomic(
        &self,
        atomic_id: i64,
        status: AtomicStatus,
        error: Option<&str>,
        message: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Put failed atomics of a subtask back into the queue
    ///
    /// Returns the number of atomics requeued.
    async fn requeue_failed_atomics(&self, subtask_id: i64) -> Result<u64, StoreError>;

    /// All atomics of a subtask, in id order
    async fn list_atomics(&self, subtask_id: i64) -> Result<Vec<AtomicRecord>, StoreError>;

    // =========================================================================
    // Progress Operations
    // =========================================================================

    /// Sum of `num` and `done` across the task's subtasks
    async fn progress_totals(&self, task_id: i64) -> Result<ProgressTotals, StoreError>;

    /// First subtask (by id) whose status is not `done`
    async fn current_subtask(&self, task_id: i64) -> Result<Option<CurrentSubtask>, StoreError>;
}
