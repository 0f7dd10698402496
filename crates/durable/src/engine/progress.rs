//! Progress and ETA estimation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::SubtaskStatus;
use crate::persistence::{CurrentSubtask, ProgressTotals};

/// Pessimistic margin applied to the linear remaining-time estimate
const ESTIMATE_MARGIN: f64 = 1.2;

/// Snapshot of a task's progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// `floor(completed / total * 100)`
    pub percent: u32,

    /// Estimated seconds until completion; `-1` while nothing has completed
    pub estimated_seconds_remaining: i64,

    pub time_started: Option<DateTime<Utc>>,

    /// Name of the first subtask that is not done
    pub description: String,

    /// Status of that subtask
    pub status: Option<SubtaskStatus>,
}

impl Progress {
    /// Snapshot of a task with no queued work
    pub fn empty() -> Self {
        Self {
            percent: 0,
            estimated_seconds_remaining: 0,
            time_started: None,
            description: String::new(),
            status: None,
        }
    }
}

/// Compute progress from durable counters
pub fn estimate(
    totals: ProgressTotals,
    time_started: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    current: Option<CurrentSubtask>,
) -> Progress {
    if totals.total <= 0 {
        return Progress::empty();
    }

    let completed = totals.completed.clamp(0, totals.total);
    let percent = (completed * 100 / totals.total) as u32;

    let estimated_seconds_remaining = if completed == 0 {
        -1
    } else {
        let elapsed = time_started
            .map(|started| (now - started).num_seconds().max(0))
            .unwrap_or(0);
        let remaining = totals.total - completed;
        let linear = elapsed as f64 / completed as f64 * remaining as f64;
        (linear * ESTIMATE_MARGIN).floor() as i64 + 1
    };

    let (description, status) = match current {
        Some(current) => (current.name, Some(current.status)),
        None => (String::new(), None),
    };

    Progress {
        percent,
        estimated_seconds_remaining,
        time_started,
        description,
        status,
    }
}
