//! Reliability patterns for the task queue
//!
//! This module provides:
//! - [`BackoffPolicy`] - Delay between subtask retry passes

mod backoff;

pub use backoff::BackoffPolicy;
pub(crate) use backoff::{duration_millis, option_duration_millis};
