//! Tasks: ordered subtask sequences run under an exclusive lock

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::EngineError;
use crate::lock::{HeldLock, LockScope};
use crate::model::TaskStatus;
use crate::persistence::{NewSubtask, SubtaskRecord, TaskRecord};
use crate::queue::QueueCursor;

use super::progress::{self, Progress};
use super::queue::{truncate_name, TaskQueue};
use super::subtask::Subtask;

/// How an [`execute`](Task::execute) call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every subtask finished
    Done,
    /// A subtask ran out of retries, or the task had already failed
    Failed,
    /// Another runner holds the task lock; nothing was touched
    AlreadyRunning,
}

/// Top-level unit of work
#[derive(Debug, Clone)]
pub struct Task {
    queue: TaskQueue,
    record: TaskRecord,
    errors: u32,
}

impl Task {
    pub(crate) fn from_record(queue: TaskQueue, record: TaskRecord) -> Self {
        Self {
            queue,
            record,
            errors: 0,
        }
    }

    pub fn id(&self) -> i64 {
        self.record.id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn project_name(&self) -> &str {
        &self.record.project_name
    }

    pub fn status(&self) -> TaskStatus {
        self.record.status
    }

    pub fn time_added(&self) -> DateTime<Utc> {
        self.record.time_added
    }

    pub fn time_started(&self) -> Option<DateTime<Utc>> {
        self.record.time_started
    }

    pub fn record(&self) -> &TaskRecord {
        &self.record
    }

    /// Subtasks that failed during the last run
    pub fn errors(&self) -> u32 {
        self.errors
    }

    pub fn lock_scope(&self) -> LockScope {
        self.queue.lock_scope(self.record.id)
    }

    /// Refresh the stored row
    pub async fn reload(&mut self) -> Result<(), EngineError> {
        self.record = self
            .queue
            .store()
            .get_task(self.record.id)
            .await?
            .ok_or(EngineError::TaskNotFound(self.record.id))?;
        Ok(())
    }

    pub async fn set_status(&mut self, status: TaskStatus) -> Result<(), EngineError> {
        self.queue
            .store()
            .set_task_status(self.record.id, status)
            .await?;
        self.record.status = status;
        Ok(())
    }

    /// Mark generation finished; the task is ready to run
    pub async fn begin(&mut self) -> Result<(), EngineError> {
        self.set_status(TaskStatus::Queued).await
    }

    /// Put failed subtasks back into the queue and make the task runnable
    ///
    /// Retry budgets of the reset subtasks are restored to the configured
    /// default.
    #[instrument(skip(self), fields(task_id = self.record.id))]
    pub async fn reset(&mut self) -> Result<(), EngineError> {
        let retries = self.queue.config().default_retries;
        let reset = self
            .queue
            .store()
            .reset_failed_subtasks(self.record.id, retries)
            .await?;
        self.set_status(TaskStatus::Queued).await?;
        info!(subtasks = reset, "task reset");
        Ok(())
    }

    /// Append a subtask with the default retry budget
    pub async fn queue_subtask(
        &mut self,
        name: &str,
        executor_kind: &str,
        init_params: Vec<Value>,
    ) -> Result<Subtask, EngineError> {
        let retries = self.queue.config().default_retries;
        self.queue_subtask_with_retries(name, executor_kind, init_params, retries)
            .await
    }

    /// Append a subtask
    ///
    /// A task that already finished goes back to `queued` so the new
    /// subtask gets picked up.
    pub async fn queue_subtask_with_retries(
        &mut self,
        name: &str,
        executor_kind: &str,
        init_params: Vec<Value>,
        retries: u32,
    ) -> Result<Subtask, EngineError> {
        let record = self
            .queue
            .store()
            .insert_subtask(NewSubtask {
                task_id: self.record.id,
                name: truncate_name(name),
                executor_kind: executor_kind.to_string(),
                init_params,
                depends_on: None,
                retries,
            })
            .await?;
        debug!(task_id = self.record.id, subtask_id = record.id, "queued subtask");

        self.reload().await?;
        if self.record.status == TaskStatus::Done {
            self.set_status(TaskStatus::Queued).await?;
        }

        Ok(Subtask::from_record(self.queue.clone(), record))
    }

    /// Every subtask, in insertion order
    pub async fn subtasks(&self) -> Result<Vec<Subtask>, EngineError> {
        let records = self.queue.store().list_subtasks(self.record.id).await?;
        Ok(records
            .into_iter()
            .map(|record| Subtask::from_record(self.queue.clone(), record))
            .collect())
    }

    /// Whether some runner currently holds this task's lock
    pub fn is_running(&self) -> Result<bool, EngineError> {
        Ok(self.queue.locks().is_held(&self.lock_scope())?)
    }

    /// Run every pending subtask in insertion order
    ///
    /// Takes the task lock for the duration of the run. A task that already
    /// failed is refused without touching it; call [`reset`](Self::reset)
    /// first to run it again.
    #[instrument(skip(self), fields(task_id = self.record.id))]
    pub async fn execute(&mut self) -> Result<RunOutcome, EngineError> {
        self.reload().await?;
        if self.record.status == TaskStatus::Failed {
            warn!("refusing to run a failed task");
            return Ok(RunOutcome::Failed);
        }

        let Some(lock) = HeldLock::try_acquire(Arc::clone(self.queue.locks()), self.lock_scope())?
        else {
            info!("task is already running");
            return Ok(RunOutcome::AlreadyRunning);
        };

        self.errors = 0;
        if self.queue.store().mark_task_started(self.record.id).await? {
            debug!("start time stamped");
        }
        self.set_status(TaskStatus::Running).await?;
        info!(name = %self.record.name, "task started");

        self.drain_subtasks().await?;

        let outcome = if self.errors == 0 {
            self.set_status(TaskStatus::Done).await?;
            info!("task done");
            RunOutcome::Done
        } else {
            self.set_status(TaskStatus::Failed).await?;
            warn!(errors = self.errors, "task failed");
            RunOutcome::Failed
        };

        lock.release()?;
        self.reload().await?;
        Ok(outcome)
    }

    /// [`execute`](Self::execute), reduced to whether the task finished
    pub async fn run(&mut self) -> Result<bool, EngineError> {
        Ok(self.execute().await? == RunOutcome::Done)
    }

    async fn drain_subtasks(&mut self) -> Result<(), EngineError> {
        let task_id = self.record.id;
        let store = Arc::clone(self.queue.store());
        let queue = self.queue.clone();

        let mut cursor = QueueCursor::mapped(
            self.queue.config().page_size,
            move |limit: usize| {
                let store = Arc::clone(&store);
                async move { store.pending_subtasks(task_id, limit).await }
            },
            move |record: SubtaskRecord| Subtask::from_record(queue.clone(), record),
        )
        .await?;

        while cursor.has_items() && self.errors == 0 {
            while let Some(subtask) = cursor.next() {
                if !subtask.run_to_completion().await? {
                    self.errors += 1;
                    break;
                }
            }
            if self.errors == 0 {
                cursor.rewind().await?;
            }
        }

        Ok(())
    }

    /// Progress of this task, computed from the stored counters
    pub async fn progress(&self) -> Result<Progress, EngineError> {
        let store = self.queue.store();
        let totals = store.progress_totals(self.record.id).await?;
        if totals.total == 0 {
            return Ok(Progress::empty());
        }

        let record = store
            .get_task(self.record.id)
            .await?
            .ok_or(EngineError::TaskNotFound(self.record.id))?;
        let current = store.current_subtask(self.record.id).await?;
        Ok(progress::estimate(
            totals,
            record.time_started,
            Utc::now(),
            current,
        ))
    }

    /// Delete the task with all of its subtasks and calls
    #[instrument(skip(self), fields(task_id = self.record.id))]
    pub async fn remove(self) -> Result<(), EngineError> {
        self.queue.store().delete_task(self.record.id).await?;
        info!("task removed");
        Ok(())
    }
}
