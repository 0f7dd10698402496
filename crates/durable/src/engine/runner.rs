//! Runner: execute one task end to end, or watch for queued tasks
//!
//! A runner wraps [`Task::execute`] with what a standalone runner process
//! needs: completion notifications, optional cleanup of finished tasks and
//! recovery from an aborted run. When a run ends abnormally (store error or
//! panic) the lock guard has already been dropped, so the runner asks the
//! supervisor to launch a fresh runner unless another one holds the task.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::adapters::{notification_tags, Notifier, Supervisor};
use crate::error::EngineError;
use crate::model::{SubtaskStatus, TaskStatus};
use crate::reliability::duration_millis;

use super::queue::TaskQueue;
use super::task::{RunOutcome, Task};

/// Runner behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerOptions {
    /// Delete a task (and its subtasks) once it finished successfully
    pub remove_finished: bool,

    /// Delay between two scans in [`Runner::watch`]
    #[serde(with = "duration_millis")]
    pub watch_interval: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            remove_finished: false,
            watch_interval: Duration::from_secs(1),
        }
    }
}

impl RunnerOptions {
    pub fn with_remove_finished(mut self, remove: bool) -> Self {
        self.remove_finished = remove;
        self
    }

    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }
}

/// What [`Runner::run_now`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunReport {
    /// No task with that id
    NotFound,
    /// The task had failed before; it was left alone
    Refused,
    /// Another runner holds the task
    AlreadyRunning,
    /// The task finished
    Done,
    /// A subtask ran out of retries
    Failed,
}

/// Drives tasks to completion and announces the result
#[derive(Clone)]
pub struct Runner {
    queue: TaskQueue,
    notifier: Arc<dyn Notifier>,
    supervisor: Arc<dyn Supervisor>,
    options: RunnerOptions,
}

impl Runner {
    pub fn new(
        queue: TaskQueue,
        notifier: Arc<dyn Notifier>,
        supervisor: Arc<dyn Supervisor>,
        options: RunnerOptions,
    ) -> Self {
        Self {
            queue,
            notifier,
            supervisor,
            options,
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// Run one task in this process
    #[instrument(skip(self))]
    pub async fn run_now(&self, task_id: i64) -> Result<RunReport, EngineError> {
        let Some(task) = self.queue.load(task_id).await? else {
            warn!("task not found");
            return Ok(RunReport::NotFound);
        };
        if task.status() == TaskStatus::Failed {
            warn!(name = %task.name(), "task failed before, not running it");
            return Ok(RunReport::Refused);
        }

        // Run on its own tokio task so a panicking handler path surfaces
        // as a JoinError instead of unwinding through the runner
        let handle = tokio::spawn(async move {
            let mut task = task;
            let outcome = task.execute().await?;
            Ok::<_, EngineError>((outcome, task))
        });

        let (outcome, task) = match handle.await {
            Ok(Ok(finished)) => finished,
            Ok(Err(e)) => {
                error!(error = %e, "task run aborted");
                self.recover(task_id).await;
                return Err(e);
            }
            Err(join_error) => {
                error!(error = %join_error, "task run panicked");
                self.recover(task_id).await;
                return Err(EngineError::Dispatch(join_error.to_string()));
            }
        };

        match outcome {
            RunOutcome::AlreadyRunning => Ok(RunReport::AlreadyRunning),
            RunOutcome::Done => {
                self.announce(
                    &task,
                    "Task finished",
                    format!("'{}' has finished successfully", task.name()),
                )
                .await;
                if self.options.remove_finished {
                    task.remove().await?;
                }
                Ok(RunReport::Done)
            }
            RunOutcome::Failed => {
                let reason = failure_reason(&task).await?;
                self.announce(
                    &task,
                    "Task failed",
                    format!("'{}' failed with {}", task.name(), reason),
                )
                .await;
                Ok(RunReport::Failed)
            }
        }
    }

    /// Launch every runnable task nobody is running
    ///
    /// Runnable means queued, or marked running with no lock holder (its
    /// runner died). Returns the ids handed to the supervisor.
    pub async fn launch_queued(&self) -> Result<Vec<i64>, EngineError> {
        let mut launched = Vec::new();
        for task in self.queue.load_all().await? {
            let runnable = matches!(task.status(), TaskStatus::Queued | TaskStatus::Running);
            if !runnable || task.is_running()? {
                continue;
            }
            match self.supervisor.launch(task.id()).await {
                Ok(()) => {
                    info!(task_id = task.id(), "launched runner");
                    launched.push(task.id());
                }
                Err(e) => warn!(task_id = task.id(), error = %e, "failed to launch runner"),
            }
        }
        Ok(launched)
    }

    /// Scan for queued tasks until `shutdown` turns true or its sender drops
    pub async fn watch(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        info!(interval = ?self.options.watch_interval, "watching for queued tasks");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.launch_queued().await?;

            tokio::select! {
                _ = tokio::time::sleep(self.options.watch_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("watch stopped");
        Ok(())
    }

    /// Hand an aborted task to a fresh runner
    async fn recover(&self, task_id: i64) {
        let scope = self.queue.lock_scope(task_id);
        match self.queue.locks().is_held(&scope) {
            Ok(true) => {
                info!(task_id, "task picked up by another runner, not relaunching");
            }
            Ok(false) => {
                if let Err(e) = self.supervisor.launch(task_id).await {
                    error!(task_id, error = %e, "failed to relaunch aborted task");
                }
            }
            Err(e) => error!(task_id, error = %e, "cannot check task lock"),
        }
    }

    async fn announce(&self, task: &Task, title: &str, message: String) {
        let tags = notification_tags(task.project_name());
        if let Err(e) = self.notifier.notify(title, &message, &tags).await {
            warn!(task_id = task.id(), error = %e, "notification failed");
        }
    }
}

/// Last error of the first failed subtask
async fn failure_reason(task: &Task) -> Result<String, EngineError> {
    let reason = task
        .subtasks()
        .await?
        .into_iter()
        .find(|subtask| subtask.status() == SubtaskStatus::Failed)
        .and_then(|subtask| subtask.record().error_message.clone())
        .unwrap_or_else(|| "an unknown error".to_string());
    Ok(reason)
}
