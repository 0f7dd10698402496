//! Persistence layer for the task queue
//!
//! This module provides:
//! - [`TaskStore`] trait for task, subtask and atomic persistence
//! - [`InMemoryTaskStore`] for testing
//! - [`PostgresTaskStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;
pub use store::{
    AtomicRecord, CurrentSubtask, NewSubtask, ProgressTotals, StoreError, SubtaskRecord,
    TaskRecord, TaskStore,
};
