//! Bounded pool of long-lived workers
//!
//! Each slot is a tokio task owning one executor. The engine leases an idle
//! slot, sends it a call over the slot's request channel and awaits the
//! reply. A slot that panics or blows its call timeout is replaced with a
//! fresh executor built from the same init params.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::executor::{ExecutorFactory, ExecutorRegistry, WorkerExecutor};
use crate::model::{MethodCall, MethodError, MethodResult};
use crate::reliability::{duration_millis, option_duration_millis};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Upper bound on a single method call; `None` waits forever
    #[serde(default, with = "option_duration_millis")]
    pub call_timeout: Option<Duration>,

    /// How long shutdown waits for workers to acknowledge termination
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            call_timeout: None,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Set the per-call timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Workers are being constructed
    Starting,
    /// Every slot is live and leasable
    Running,
    /// Workers are being terminated
    Draining,
    /// No live workers
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// No factory registered for the subtask's executor kind
    #[error("no executor registered for kind: {0}")]
    UnknownExecutor(String),

    /// An executor refused its init params
    #[error("executor {kind} failed to start: {message}")]
    ExecutorInit { kind: String, message: String },

    /// Pool already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Pool not running
    #[error("worker pool is not running")]
    NotRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

enum WorkerRequest {
    Call {
        call: MethodCall,
        reply: oneshot::Sender<MethodResult>,
    },
    Terminate {
        ack: oneshot::Sender<()>,
    },
}

struct WorkerSlot {
    tx: mpsc::Sender<WorkerRequest>,
    handle: JoinHandle<()>,
}

/// Pool of `size` workers of one executor kind
///
/// # Example
///
/// ```ignore
/// let pool = Arc::new(WorkerPool::new("shell", vec![], &registry, 4, PoolConfig::default())?);
/// pool.start()?;
///
/// let lease = pool.acquire().await?;
/// let result = lease.call(MethodCall::new("run", vec![json!("true"), json!([])])).await;
///
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    pool_id: Uuid,
    kind: String,
    init_params: Vec<Value>,
    factory: ExecutorFactory,
    config: PoolConfig,
    size: usize,
    slots: Mutex<Vec<Option<WorkerSlot>>>,
    idle_tx: mpsc::UnboundedSender<usize>,
    idle_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<usize>>,
    busy: AtomicUsize,
    status: RwLock<WorkerPoolStatus>,
}

impl WorkerPool {
    /// Create a stopped pool for `kind`
    ///
    /// Fails if the registry has no factory for `kind`.
    pub fn new(
        kind: &str,
        init_params: Vec<Value>,
        registry: &ExecutorRegistry,
        size: usize,
        config: PoolConfig,
    ) -> Result<Self, WorkerPoolError> {
        let factory = registry
            .factory(kind)
            .ok_or_else(|| WorkerPoolError::UnknownExecutor(kind.to_string()))?;
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();

        Ok(Self {
            pool_id: Uuid::now_v7(),
            kind: kind.to_string(),
            init_params,
            factory,
            config,
            size: size.max(1),
            slots: Mutex::new(Vec::new()),
            idle_tx,
            idle_rx: tokio::sync::Mutex::new(idle_rx),
            busy: AtomicUsize::new(0),
            status: RwLock::new(WorkerPoolStatus::Stopped),
        })
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn busy_count(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        let live = self.slots.lock().iter().filter(|s| s.is_some()).count();
        live.saturating_sub(self.busy_count())
    }

    /// Construct every worker
    ///
    /// Executor init runs here; the first failure stops the already
    /// spawned workers and is returned.
    #[instrument(skip(self), fields(pool_id = %self.pool_id, kind = %self.kind))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if matches!(*status, WorkerPoolStatus::Running | WorkerPoolStatus::Starting) {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Starting;
        }

        let mut slots = Vec::with_capacity(self.size);
        for index in 0..self.size {
            match self.spawn_worker(index) {
                Ok(slot) => slots.push(Some(slot)),
                Err(e) => {
                    for slot in slots.into_iter().flatten() {
                        slot.handle.abort();
                    }
                    *self.status.write() = WorkerPoolStatus::Stopped;
                    return Err(e);
                }
            }
        }

        *self.slots.lock() = slots;
        // Leases from a previous run may have parked stale indices
        if let Ok(mut idle) = self.idle_rx.try_lock() {
            while idle.try_recv().is_ok() {}
        }
        self.busy.store(0, Ordering::SeqCst);
        for index in 0..self.size {
            let _ = self.idle_tx.send(index);
        }
        *self.status.write() = WorkerPoolStatus::Running;

        info!(pool_id = %self.pool_id, kind = %self.kind, size = self.size, "worker pool started");
        Ok(())
    }

    fn spawn_worker(&self, index: usize) -> Result<WorkerSlot, WorkerPoolError> {
        let executor: Box<dyn WorkerExecutor> =
            (self.factory)(&self.init_params).map_err(|e| WorkerPoolError::ExecutorInit {
                kind: self.kind.clone(),
                message: e.message,
            })?;

        let (tx, mut rx) = mpsc::channel::<WorkerRequest>(1);
        let pool_id = self.pool_id;
        let handle = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    WorkerRequest::Call { call, reply } => {
                        let result = executor.invoke(&call).await;
                        let _ = reply.send(result);
                    }
                    WorkerRequest::Terminate { ack } => {
                        let _ = ack.send(());
                        break;
                    }
                }
            }
            debug!(%pool_id, worker = index, "worker exited");
        });

        Ok(WorkerSlot { tx, handle })
    }

    /// Replace the worker in `index` with a fresh one
    fn respawn(&self, index: usize) {
        let replacement = match self.spawn_worker(index) {
            Ok(slot) => Some(slot),
            Err(e) => {
                error!(pool_id = %self.pool_id, worker = index, error = %e, "failed to respawn worker");
                None
            }
        };

        let mut slots = self.slots.lock();
        if let Some(entry) = slots.get_mut(index) {
            if let Some(old) = entry.take() {
                old.handle.abort();
            }
            *entry = replacement;
        }
    }

    /// Wait for an idle worker
    pub async fn acquire(self: &Arc<Self>) -> Result<WorkerLease, WorkerPoolError> {
        if self.status() != WorkerPoolStatus::Running {
            return Err(WorkerPoolError::NotRunning);
        }

        let index = self
            .idle_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(WorkerPoolError::NotRunning)?;
        self.busy.fetch_add(1, Ordering::SeqCst);

        Ok(WorkerLease {
            pool: Arc::clone(self),
            index,
        })
    }

    /// Run one call on the next idle worker
    pub async fn dispatch(self: &Arc<Self>, call: MethodCall) -> Result<MethodResult, WorkerPoolError> {
        let lease = self.acquire().await?;
        Ok(lease.call(call).await)
    }

    async fn dispatch_to(&self, index: usize, call: MethodCall) -> MethodResult {
        let method_name = call.method_name.clone();
        let tx = self
            .slots
            .lock()
            .get(index)
            .and_then(|slot| slot.as_ref().map(|s| s.tx.clone()));

        let Some(tx) = tx else {
            return MethodResult::failure(method_name.clone(), MethodError::worker_crashed(&method_name));
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if tx
            .send(WorkerRequest::Call {
                call,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            warn!(pool_id = %self.pool_id, worker = index, "worker gone before call");
            self.respawn(index);
            return MethodResult::failure(method_name.clone(), MethodError::worker_crashed(&method_name));
        }

        let outcome = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, reply_rx).await {
                Ok(reply) => reply.map_err(|_| MethodError::worker_crashed(&method_name)),
                Err(_) => Err(MethodError::timed_out(&method_name, limit)),
            },
            None => reply_rx
                .await
                .map_err(|_| MethodError::worker_crashed(&method_name)),
        };

        match outcome {
            Ok(result) => result,
            Err(error) => {
                warn!(
                    pool_id = %self.pool_id,
                    worker = index,
                    method = %method_name,
                    error = %error,
                    "replacing worker"
                );
                self.respawn(index);
                MethodResult::failure(method_name, error)
            }
        }
    }

    fn release(&self, index: usize) {
        self.busy.fetch_sub(1, Ordering::SeqCst);
        let _ = self.idle_tx.send(index);
    }

    /// Terminate every worker
    ///
    /// Waits up to `shutdown_timeout` for each worker to acknowledge, then
    /// aborts whatever is left. Safe to call more than once.
    #[instrument(skip(self), fields(pool_id = %self.pool_id, kind = %self.kind))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        let slots: Vec<WorkerSlot> = self.slots.lock().drain(..).flatten().collect();
        let mut handles = Vec::with_capacity(slots.len());
        let mut acks = Vec::with_capacity(slots.len());
        for slot in slots {
            let tx = slot.tx;
            handles.push(slot.handle);
            acks.push(async move {
                let (ack_tx, ack_rx) = oneshot::channel();
                if tx.send(WorkerRequest::Terminate { ack: ack_tx }).await.is_ok() {
                    let _ = ack_rx.await;
                }
            });
        }

        let timed_out = tokio::time::timeout(
            self.config.shutdown_timeout,
            futures::future::join_all(acks),
        )
        .await
        .is_err();

        for handle in &handles {
            handle.abort();
        }
        *self.status.write() = WorkerPoolStatus::Stopped;

        if timed_out {
            warn!(pool_id = %self.pool_id, "shutdown timeout reached, workers aborted");
            return Err(WorkerPoolError::ShutdownTimeout);
        }

        info!(pool_id = %self.pool_id, "worker pool stopped");
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for slot in self.slots.get_mut().iter().flatten() {
            slot.handle.abort();
        }
    }
}

/// Exclusive use of one worker
///
/// The worker returns to the idle set when the lease is dropped.
pub struct WorkerLease {
    pool: Arc<WorkerPool>,
    index: usize,
}

impl WorkerLease {
    /// Slot index of the leased worker
    pub fn worker(&self) -> usize {
        self.index
    }

    /// Send one call to the leased worker and wait for its reply
    pub async fn call(&self, call: MethodCall) -> MethodResult {
        self.pool.dispatch_to(self.index, call).await
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}
