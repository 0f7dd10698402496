//! # Durable Task Queue Engine
//!
//! A PostgreSQL-backed, crash-recoverable job queue. A task is an ordered
//! list of subtasks; a subtask is a queue of method calls dispatched to a
//! bounded pool of long-lived workers.
//!
//! ## Features
//!
//! - **Durable state**: every status and counter lives in the store, so a
//!   crashed runner resumes where it stopped
//! - **Dynamic queues**: calls appended while a subtask runs are picked up
//!   by the same run
//! - **Retry passes**: failed calls are requeued and the subtask retried with
//!   backoff until its retry budget runs out
//! - **Single runner per task**: an advisory lock guards every task run
//! - **Progress and ETA** computed from the durable counters
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Runner / Task                            │
//! │  (task lock, subtasks strictly in insertion order)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Subtask                                │
//! │  (re-pollable cursor over queued calls, retry passes)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkerPool                              │
//! │  (N executors built once, one call per worker at a time)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use serde_json::json;
//! use tasklane_durable::prelude::*;
//!
//! struct Doubler;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), EngineError> {
//! let mut registry = ExecutorRegistry::new();
//! registry.register(
//!     "doubler",
//!     |_params| Ok(Doubler),
//!     MethodTable::new().method("double", |_state: Arc<Doubler>, (n,): (i64,)| async move {
//!         Ok::<_, MethodError>(n * 2)
//!     }),
//! );
//!
//! let queue = TaskQueue::new(
//!     Arc::new(InMemoryTaskStore::new()),
//!     Arc::new(InMemoryLockProvider::new()),
//!     Arc::new(registry),
//!     EngineConfig::default(),
//! );
//!
//! let mut task = queue.create_task("double numbers", "demo").await?;
//! let mut subtask = task.queue_subtask("double", "doubler", vec![]).await?;
//! for n in 0..10 {
//!     subtask.queue_method_call("double", vec![json!(n)]).await?;
//! }
//! task.begin().await?;
//!
//! assert!(task.run().await?);
//! assert_eq!(task.progress().await?.percent, 100);
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod config;
pub mod engine;
pub mod error;
pub mod lock;
pub mod model;
pub mod persistence;
pub mod queue;
pub mod reliability;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::adapters::{LogNotifier, NoOpNotifier, NoOpSupervisor, Notifier, Supervisor};
    pub use crate::config::EngineConfig;
    pub use crate::engine::{
        Progress, RunOutcome, RunReport, Runner, RunnerOptions, Subtask, SubtaskOutcome, Task,
        TaskQueue,
    };
    pub use crate::error::EngineError;
    pub use crate::lock::{FileLockProvider, InMemoryLockProvider, TaskLock};
    pub use crate::model::{
        AtomicStatus, MethodCall, MethodError, MethodResult, SubtaskStatus, TaskStatus,
    };
    pub use crate::persistence::{InMemoryTaskStore, PostgresTaskStore, StoreError, TaskStore};
    pub use crate::reliability::BackoffPolicy;
    pub use crate::worker::{ExecutorRegistry, MethodTable, PoolConfig, WorkerExecutor};
}

// Re-export key types at crate root
pub use adapters::{
    notification_tags, LogNotifier, NoOpNotifier, NoOpSupervisor, NotifyError, Notifier,
    RecordingNotifier, RecordingSupervisor, Supervisor, SupervisorError,
};
pub use config::EngineConfig;
pub use engine::{
    Progress, RunOutcome, RunReport, Runner, RunnerOptions, Subtask, SubtaskOutcome, Task,
    TaskQueue,
};
pub use error::EngineError;
pub use lock::{FileLockProvider, HeldLock, InMemoryLockProvider, LockError, LockScope, TaskLock};
pub use model::{
    AtomicStatus, MethodCall, MethodError, MethodResult, SubtaskStatus, TaskStatus,
};
pub use persistence::{
    AtomicRecord, InMemoryTaskStore, PostgresTaskStore, StoreError, SubtaskRecord, TaskRecord,
    TaskStore,
};
pub use queue::QueueCursor;
pub use reliability::BackoffPolicy;
pub use worker::{
    ExecutorFactory, ExecutorRegistry, MethodTable, PoolConfig, WorkerExecutor, WorkerLease,
    WorkerPool, WorkerPoolError, WorkerPoolStatus,
};
