//! Task execution engine
//!
//! ```text
//! Runner ──▶ Task::execute (lock held)
//!              │ one subtask at a time, insertion order
//!              ▼
//!            Subtask::run ──▶ WorkerPool (≤ num_workers calls in flight)
//!              │
//!              ▼
//!            TaskStore (counters, statuses) ◀── Task::progress
//! ```

pub mod progress;
mod queue;
mod runner;
mod subtask;
mod task;

pub use progress::Progress;
pub use queue::{TaskQueue, MAX_NAME_LEN};
pub use runner::{RunReport, Runner, RunnerOptions};
pub use subtask::{Subtask, SubtaskOutcome};
pub use task::{RunOutcome, Task};
