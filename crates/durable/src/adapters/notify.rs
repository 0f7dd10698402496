//! Task completion notifications

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

/// Errors from notify operations
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Adapter for sending notifications
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    /// Send a notification with a title, message body and routing tags
    async fn notify(&self, title: &str, message: &str, tags: &[String]) -> Result<(), NotifyError>;
}

/// Routing tags for a task notification
///
/// Always `task`, plus `task.project.<project>` when the task belongs to one.
pub fn notification_tags(project_name: &str) -> Vec<String> {
    let mut tags = vec!["task".to_string()];
    if !project_name.is_empty() {
        tags.push(format!("task.project.{}", project_name));
    }
    tags
}

/// Notification adapter that silently discards all notifications.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpNotifier;

impl NoOpNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for NoOpNotifier {
    async fn notify(&self, _title: &str, _message: &str, _tags: &[String]) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Writes notifications to the log
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, title: &str, message: &str, tags: &[String]) -> Result<(), NotifyError> {
        info!(title = %title, tags = ?tags, "{}", message);
        Ok(())
    }
}

/// Recorded notification
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyCall {
    pub title: String,
    pub message: String,
    pub tags: Vec<String>,
}

/// Notifier that keeps every notification in memory
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    calls: Arc<Mutex<Vec<NotifyCall>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all recorded notifications
    pub fn calls(&self) -> Vec<NotifyCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, title: &str, message: &str, tags: &[String]) -> Result<(), NotifyError> {
        self.calls.lock().push(NotifyCall {
            title: title.to_string(),
            message: message.to_string(),
            tags: tags.to_vec(),
        });
        Ok(())
    }
}
