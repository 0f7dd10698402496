//! Outbound adapters used by the runner
//!
//! - [`Notifier`] announces finished and failed tasks
//! - [`Supervisor`] (re)launches a runner for a task in the background

mod notify;
mod supervisor;

pub use notify::{
    notification_tags, LogNotifier, NoOpNotifier, NotifyCall, NotifyError, Notifier,
    RecordingNotifier,
};
pub use supervisor::{NoOpSupervisor, RecordingSupervisor, Supervisor, SupervisorError};
