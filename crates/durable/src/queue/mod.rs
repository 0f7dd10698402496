//! Re-pollable views over pending queue rows

mod cursor;

pub use cursor::{QueueCursor, DEFAULT_PAGE_SIZE};
