//! Background runner launching

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

/// Errors from supervisor operations
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to launch runner for task {task_id}: {message}")]
    LaunchFailed { task_id: i64, message: String },
}

/// Starts a runner for a task out of band
///
/// Implementations must return as soon as the runner is launched; they do
/// not wait for it to finish.
#[async_trait]
pub trait Supervisor: Send + Sync + 'static {
    async fn launch(&self, task_id: i64) -> Result<(), SupervisorError>;
}

/// Supervisor that never launches anything
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpSupervisor;

#[async_trait]
impl Supervisor for NoOpSupervisor {
    async fn launch(&self, _task_id: i64) -> Result<(), SupervisorError> {
        Ok(())
    }
}

/// Supervisor that remembers which tasks it was asked to launch
#[derive(Clone, Default)]
pub struct RecordingSupervisor {
    launched: Arc<Mutex<Vec<i64>>>,
}

impl RecordingSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launched(&self) -> Vec<i64> {
        self.launched.lock().clone()
    }
}

#[async_trait]
impl Supervisor for RecordingSupervisor {
    async fn launch(&self, task_id: i64) -> Result<(), SupervisorError> {
        self.launched.lock().push(task_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_supervisor() {
        let supervisor = RecordingSupervisor::new();
        supervisor.launch(3).await.unwrap();
        supervisor.launch(5).await.unwrap();
        assert_eq!(supervisor.launched(), vec![3, 5]);
    }

    #[tokio::test]
    async fn test_noop_supervisor() {
        assert!(NoOpSupervisor.launch(1).await.is_ok());
    }
}
