//! Domain types shared by the store, the worker pool and the engine

mod call;
mod status;

pub use call::{MethodCall, MethodError, MethodResult};
pub use status::{AtomicStatus, SubtaskStatus, TaskStatus};
