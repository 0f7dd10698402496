//! Worker pool for atomic method calls
//!
//! This module provides:
//! - [`ExecutorRegistry`] / [`MethodTable`] - Named handlers per executor kind
//! - [`WorkerPool`] - Bounded set of long-lived workers of one kind
//! - [`WorkerLease`] - Exclusive use of one idle worker
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      WorkerPool                           │
//! │                                                           │
//! │   acquire() ──▶ idle queue ──▶ WorkerLease                │
//! │                                    │                      │
//! │                                    ▼ call()               │
//! │   ┌──────────┐  ┌──────────┐  ┌──────────┐                │
//! │   │ slot 0   │  │ slot 1   │  │ slot N   │  (tokio tasks) │
//! │   │ executor │  │ executor │  │ executor │                │
//! │   └──────────┘  └──────────┘  └──────────┘                │
//! │        ▲  respawned from init params on panic / timeout   │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod executor;
mod pool;

pub use executor::{ExecutorFactory, ExecutorRegistry, MethodTable, WorkerExecutor};
pub use pool::{PoolConfig, WorkerLease, WorkerPool, WorkerPoolError, WorkerPoolStatus};
