//! Subtask runs: drain one atomic queue through a worker pool
//!
//! One pass of [`Subtask::run`]:
//!
//! ```text
//! start pool ──▶ open cursor ──▶ dispatch page (≤ num_workers in flight)
//!                     ▲                     │
//!                     │ no error            ▼
//!                     └──── rewind ◀── join in-flight
//!                                           │ error / empty
//!                                           ▼
//!                     shutdown pool ──▶ done | retry | failed
//! ```
//!
//! After the first failed call no new call is dispatched; calls already in
//! flight finish and are recorded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::error::EngineError;
use crate::model::{MethodCall, MethodError, SubtaskStatus};
use crate::persistence::{AtomicRecord, StoreError, SubtaskRecord, TaskStore};
use crate::queue::QueueCursor;
use crate::worker::{WorkerLease, WorkerPool};

use super::queue::TaskQueue;

/// Result of one pass over a subtask's queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtaskOutcome {
    /// Queue drained without a failure
    Done,
    /// Pass failed, failed calls were requeued and budget remains
    Retry,
    /// Pass failed with no retry budget left
    Failed,
}

/// Outcome counters of one pass, shared with in-flight dispatches
#[derive(Debug, Default)]
struct PassTally {
    success: AtomicU64,
    errors: AtomicU64,
}

impl PassTally {
    fn failed(&self) -> bool {
        self.errors.load(Ordering::SeqCst) > 0
    }
}

/// A named phase of a task, with its own atomic queue
#[derive(Debug, Clone)]
pub struct Subtask {
    queue: TaskQueue,
    record: SubtaskRecord,
    success: u64,
    errors: u64,
    passes: u32,
}

impl Subtask {
    pub(crate) fn from_record(queue: TaskQueue, record: SubtaskRecord) -> Self {
        Self {
            queue,
            record,
            success: 0,
            errors: 0,
            passes: 0,
        }
    }

    pub fn id(&self) -> i64 {
        self.record.id
    }

    pub fn task_id(&self) -> i64 {
        self.record.task_id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn executor_kind(&self) -> &str {
        &self.record.executor_kind
    }

    pub fn init_params(&self) -> &[Value] {
        &self.record.init_params
    }

    pub fn status(&self) -> SubtaskStatus {
        self.record.status
    }

    pub fn record(&self) -> &SubtaskRecord {
        &self.record
    }

    /// Remaining retry budget
    pub fn retries(&self) -> u32 {
        self.record.retries
    }

    /// Calls that succeeded during the last pass
    pub fn success(&self) -> u64 {
        self.success
    }

    /// Calls that failed during the last pass
    pub fn errors(&self) -> u64 {
        self.errors
    }

    /// Overwrite the retry budget
    pub async fn set_retries(&mut self, retries: u32) -> Result<(), EngineError> {
        self.queue
            .store()
            .set_subtask_retries(self.record.id, retries)
            .await?;
        self.record.retries = retries;
        Ok(())
    }

    /// Append one method call to the queue
    ///
    /// Safe to call while the subtask is running; the running pass picks
    /// the call up on its next rewind.
    pub async fn queue_method_call(
        &mut self,
        method_name: &str,
        args: Vec<Value>,
    ) -> Result<AtomicRecord, EngineError> {
        let atomic = self
            .queue
            .store()
            .enqueue_atomic(self.record.id, method_name, args)
            .await?;
        self.record.num += 1;
        debug!(subtask_id = self.record.id, atomic_id = atomic.id, method_name, "queued method call");
        Ok(atomic)
    }

    /// Refresh the stored row
    pub async fn reload(&mut self) -> Result<(), EngineError> {
        self.record = self
            .queue
            .store()
            .get_subtask(self.record.id)
            .await?
            .ok_or(EngineError::SubtaskNotFound(self.record.id))?;
        Ok(())
    }

    /// Every atomic call of this subtask, in id order
    pub async fn atomics(&self) -> Result<Vec<AtomicRecord>, EngineError> {
        Ok(self.queue.store().list_atomics(self.record.id).await?)
    }

    /// Run one pass over the pending calls
    ///
    /// A worker pool that cannot be built or started is returned as an error
    /// before anything is dispatched.
    #[instrument(skip(self), fields(task_id = self.record.task_id, subtask_id = self.record.id))]
    pub async fn run(&mut self) -> Result<SubtaskOutcome, EngineError> {
        self.passes += 1;
        self.success = 0;
        self.errors = 0;

        let config = self.queue.config();
        let pool = Arc::new(WorkerPool::new(
            &self.record.executor_kind,
            self.record.init_params.clone(),
            self.queue.registry(),
            config.num_workers,
            config.pool.clone(),
        )?);
        pool.start()?;

        let store = Arc::clone(self.queue.store());
        store
            .set_subtask_status(self.record.id, SubtaskStatus::Running)
            .await?;
        info!(pass = self.passes, workers = pool.size(), "subtask pass started");

        let tally = Arc::new(PassTally::default());
        let drained = self.drain(&store, &pool, &tally).await;

        if let Err(e) = pool.shutdown().await {
            warn!(error = %e, "worker pool did not stop cleanly");
        }
        drained?;

        self.success = tally.success.load(Ordering::SeqCst);
        self.errors = tally.errors.load(Ordering::SeqCst);
        self.resolve().await
    }

    /// Run passes until the subtask is done or out of retries
    ///
    /// Returns whether the final pass was clean.
    pub async fn run_to_completion(&mut self) -> Result<bool, EngineError> {
        loop {
            match self.run().await? {
                SubtaskOutcome::Retry => continue,
                SubtaskOutcome::Done => return Ok(true),
                SubtaskOutcome::Failed => return Ok(false),
            }
        }
    }

    async fn drain(
        &self,
        store: &Arc<dyn TaskStore>,
        pool: &Arc<WorkerPool>,
        tally: &Arc<PassTally>,
    ) -> Result<(), EngineError> {
        let page_size = self.queue.config().page_size;
        let mut cursor =
            QueueCursor::pending_atomics(Arc::clone(store), self.record.id, page_size).await?;
        let mut in_flight: JoinSet<Result<(), StoreError>> = JoinSet::new();

        while cursor.has_items() && !tally.failed() {
            while let Some(atomic) = cursor.next().cloned() {
                let lease = pool.acquire().await?;
                while let Some(joined) = in_flight.try_join_next() {
                    joined.map_err(|e| EngineError::Dispatch(e.to_string()))??;
                }
                if tally.failed() {
                    break;
                }
                in_flight.spawn(dispatch_atomic(
                    Arc::clone(store),
                    lease,
                    atomic,
                    Arc::clone(tally),
                ));
            }

            // A row still in flight is still queued; never rewind past it
            while let Some(joined) = in_flight.join_next().await {
                joined.map_err(|e| EngineError::Dispatch(e.to_string()))??;
            }

            if tally.failed() {
                break;
            }
            cursor.rewind().await?;
        }

        Ok(())
    }

    async fn resolve(&mut self) -> Result<SubtaskOutcome, EngineError> {
        let store = Arc::clone(self.queue.store());
        self.reload().await?;

        if self.errors == 0 {
            store
                .set_subtask_status(self.record.id, SubtaskStatus::Done)
                .await?;
            self.record.status = SubtaskStatus::Done;
            info!(success = self.success, "subtask done");
            return Ok(SubtaskOutcome::Done);
        }

        let remaining = self.record.retries.saturating_sub(1);
        store.set_subtask_retries(self.record.id, remaining).await?;
        self.record.retries = remaining;

        if remaining > 0 {
            let requeued = store.requeue_failed_atomics(self.record.id).await?;
            let delay = self.queue.config().retry_backoff.delay_for_pass(self.passes);
            warn!(
                errors = self.errors,
                requeued,
                retries = remaining,
                ?delay,
                "subtask pass failed, retrying"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            return Ok(SubtaskOutcome::Retry);
        }

        store
            .set_subtask_status(self.record.id, SubtaskStatus::Failed)
            .await?;
        self.record.status = SubtaskStatus::Failed;
        warn!(
            errors = self.errors,
            error_message = self.record.error_message.as_deref().unwrap_or(""),
            "subtask failed, retries exhausted"
        );
        Ok(SubtaskOutcome::Failed)
    }
}

/// Send one call and record its outcome
async fn dispatch_atomic(
    store: Arc<dyn TaskStore>,
    lease: WorkerLease,
    atomic: AtomicRecord,
    tally: Arc<PassTally>,
) -> Result<(), StoreError> {
    let call = MethodCall::new(atomic.method_name.clone(), atomic.params.clone());
    let worker = lease.worker();
    let result = lease.call(call).await;

    // Counted before the worker goes back to the idle set
    if result.failed() {
        tally.errors.fetch_add(1, Ordering::SeqCst);
    }
    drop(lease);

    let detail = result.error.as_ref().map(MethodError::to_detail);
    let message = result.failed().then_some(result.error_message.as_str());
    store
        .finish_atomic(atomic.id, result.status(), detail.as_deref(), message)
        .await?;

    if result.failed() {
        warn!(
            atomic_id = atomic.id,
            worker,
            method_name = %atomic.method_name,
            error = %result.error_message,
            "method call failed"
        );
    } else {
        tally.success.fetch_add(1, Ordering::SeqCst);
        debug!(atomic_id = atomic.id, worker, "method call done");
    }

    Ok(())
}
