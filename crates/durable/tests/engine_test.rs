//! Engine behaviour against the in-memory store and lock provider
//!
//! Run with: cargo test -p tasklane-durable --test engine_test

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;

use tasklane_durable::{
    AtomicRecord, AtomicStatus, BackoffPolicy, EngineConfig, EngineError, ExecutorRegistry,
    InMemoryLockProvider, InMemoryTaskStore, MethodError, MethodTable, RecordingNotifier,
    RecordingSupervisor, RunOutcome, RunReport, Runner, RunnerOptions, SubtaskOutcome,
    StoreError, SubtaskRecord, SubtaskStatus, Task, TaskLock, TaskQueue, TaskRecord, TaskStatus,
    TaskStore, WorkerPoolError,
};
use tasklane_durable::persistence::{CurrentSubtask, NewSubtask, ProgressTotals};

// ============================================
// Harness
// ============================================

/// Observations shared by every worker of the "test" kind
#[derive(Default)]
struct Calls {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    work_calls: AtomicUsize,
    fail_calls: AtomicUsize,
    waiting: AtomicUsize,
    seen: Mutex<HashSet<i64>>,
}

struct TestWorker {
    calls: Arc<Calls>,
    gate: watch::Receiver<bool>,
}

fn registry(calls: Arc<Calls>, gate: watch::Receiver<bool>) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry.register(
        "test",
        move |_params| {
            Ok(TestWorker {
                calls: Arc::clone(&calls),
                gate: gate.clone(),
            })
        },
        MethodTable::new()
            .method("add", |_w: Arc<TestWorker>, (a, b): (i64, i64)| async move {
                Ok::<_, MethodError>(a + b)
            })
            .method("work", |w: Arc<TestWorker>, (ms,): (u64,)| async move {
                let now = w.calls.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                w.calls.max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                w.calls.in_flight.fetch_sub(1, Ordering::SeqCst);
                w.calls.work_calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, MethodError>(ms)
            })
            .method("fail", |w: Arc<TestWorker>, (msg,): (String,)| async move {
                w.calls.fail_calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(MethodError::new(msg))
            })
            .method("flaky", |w: Arc<TestWorker>, (n,): (i64,)| async move {
                if w.calls.seen.lock().insert(n) {
                    Err(MethodError::new(format!("flaky {} first attempt", n)))
                } else {
                    Ok(n)
                }
            })
            .method("gated", |w: Arc<TestWorker>, (n,): (i64,)| async move {
                w.calls.waiting.fetch_add(1, Ordering::SeqCst);
                let mut gate = w.gate.clone();
                let opened = gate.wait_for(|open| *open).await.is_ok();
                if !opened {
                    return Err(MethodError::new("gate dropped"));
                }
                Ok::<_, MethodError>(n)
            }),
    );
    registry
}

struct Harness {
    queue: TaskQueue,
    store: Arc<InMemoryTaskStore>,
    locks: Arc<InMemoryLockProvider>,
    calls: Arc<Calls>,
    gate: watch::Sender<bool>,
}

impl Harness {
    fn new(config: EngineConfig) -> Self {
        let store = Arc::new(InMemoryTaskStore::new());
        let locks = Arc::new(InMemoryLockProvider::new());
        let calls = Arc::new(Calls::default());
        let (gate, gate_rx) = watch::channel(false);

        let queue = TaskQueue::new(
            store.clone(),
            locks.clone(),
            Arc::new(registry(Arc::clone(&calls), gate_rx)),
            config,
        );

        Self {
            queue,
            store,
            locks,
            calls,
            gate,
        }
    }

    fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    fn runner(&self, notifier: RecordingNotifier, supervisor: RecordingSupervisor) -> Runner {
        Runner::new(
            self.queue.clone(),
            Arc::new(notifier),
            Arc::new(supervisor),
            RunnerOptions::default(),
        )
    }
}

fn config(workers: usize) -> EngineConfig {
    EngineConfig::default()
        .with_num_workers(workers)
        .with_retry_backoff(BackoffPolicy::none())
}

/// Poll `condition` until it holds, failing the test after a few seconds
async fn eventually<F: FnMut() -> bool>(mut condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn task_with_calls(
    harness: &Harness,
    name: &str,
    calls: &[(&str, serde_json::Value)],
    retries: u32,
) -> Task {
    let mut task = harness.queue.create_task(name, "tests").await.unwrap();
    let mut subtask = task
        .queue_subtask_with_retries("phase", "test", vec![], retries)
        .await
        .unwrap();
    for (method, args) in calls {
        let args = args.as_array().cloned().unwrap_or_default();
        subtask.queue_method_call(method, args).await.unwrap();
    }
    task.begin().await.unwrap();
    task
}

// ============================================
// Task runs
// ============================================

#[tokio::test]
async fn test_task_runs_subtasks_in_order_and_finishes() {
    let harness = Harness::new(config(2));
    let mut task = harness.queue.create_task("import", "shop").await.unwrap();

    let mut first = task.queue_subtask("first", "test", vec![]).await.unwrap();
    let mut second = task.queue_subtask("second", "test", vec![]).await.unwrap();
    for n in 0..5 {
        first.queue_method_call("add", vec![json!(n), json!(1)]).await.unwrap();
        second.queue_method_call("add", vec![json!(n), json!(2)]).await.unwrap();
    }
    task.begin().await.unwrap();

    assert!(task.run().await.unwrap());
    assert_eq!(task.status(), TaskStatus::Done);
    assert!(task.time_started().is_some());
    assert_eq!(task.errors(), 0);

    for subtask in task.subtasks().await.unwrap() {
        assert_eq!(subtask.status(), SubtaskStatus::Done);
        assert_eq!(subtask.record().num, 5);
        assert_eq!(subtask.record().done, 5);
        for atomic in subtask.atomics().await.unwrap() {
            assert_eq!(atomic.status, AtomicStatus::Done);
            assert!(atomic.error.is_none());
        }
    }
    assert!(!harness.locks.is_held(&task.lock_scope()).unwrap());
}

#[tokio::test]
async fn test_time_started_is_stamped_once() {
    let harness = Harness::new(config(1));
    let mut task = task_with_calls(&harness, "stamp", &[("add", json!([1, 1]))], 3).await;

    assert!(task.run().await.unwrap());
    let started = task.time_started().unwrap();

    task.queue_subtask("later", "test", vec![])
        .await
        .unwrap()
        .queue_method_call("add", vec![json!(2), json!(2)])
        .await
        .unwrap();
    assert!(task.run().await.unwrap());
    assert_eq!(task.time_started(), Some(started));
}

#[tokio::test]
async fn test_queueing_onto_done_task_requeues_it() {
    let harness = Harness::new(config(1));
    let mut task = task_with_calls(&harness, "reopen", &[("add", json!([1, 2]))], 3).await;
    assert!(task.run().await.unwrap());
    assert_eq!(task.status(), TaskStatus::Done);

    let mut extra = task.queue_subtask("extra", "test", vec![]).await.unwrap();
    extra.queue_method_call("add", vec![json!(3), json!(4)]).await.unwrap();
    assert_eq!(task.status(), TaskStatus::Queued);

    assert!(task.run().await.unwrap());
    extra.reload().await.unwrap();
    assert_eq!(extra.status(), SubtaskStatus::Done);
}

#[tokio::test]
async fn test_empty_subtask_succeeds_without_dispatch() {
    let harness = Harness::new(config(2));
    let mut task = harness.queue.create_task("empty", "").await.unwrap();
    let mut subtask = task.queue_subtask("nothing", "test", vec![]).await.unwrap();

    assert_eq!(subtask.run().await.unwrap(), SubtaskOutcome::Done);
    assert_eq!(subtask.success(), 0);
    assert_eq!(subtask.errors(), 0);
    assert_eq!(harness.store.atomic_count(), 0);
}

#[tokio::test]
async fn test_unknown_executor_kind_is_fatal() {
    let harness = Harness::new(config(2));
    let mut task = harness.queue.create_task("broken", "").await.unwrap();
    let mut subtask = task.queue_subtask("nowhere", "missing", vec![]).await.unwrap();
    subtask.queue_method_call("add", vec![json!(1), json!(1)]).await.unwrap();

    let err = subtask.run().await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::WorkerPool(WorkerPoolError::UnknownExecutor(ref kind)) if kind == "missing"
    ));

    let atomics = subtask.atomics().await.unwrap();
    assert_eq!(atomics[0].status, AtomicStatus::Queued);
}

// ============================================
// Queue properties
// ============================================

#[tokio::test]
async fn test_done_never_decreases_and_never_exceeds_num() {
    let harness = Harness::new(config(3));
    let calls: Vec<(&str, serde_json::Value)> = (0..30).map(|_| ("work", json!([10]))).collect();
    let mut task = task_with_calls(&harness, "monotonic", &calls, 3).await;
    let subtask_id = task.subtasks().await.unwrap()[0].id();

    let store = harness.store.clone();
    let mut producer = harness.queue.subtask(subtask_id).await.unwrap().unwrap();
    let run = tokio::spawn(async move { task.run().await });

    let mut last_done = 0;
    let mut extra = 0;
    while !run.is_finished() {
        let row = store.get_subtask(subtask_id).await.unwrap().unwrap();
        assert!(row.done >= last_done, "done went from {} to {}", last_done, row.done);
        assert!(row.done <= row.num);
        last_done = row.done;

        if extra < 5 {
            producer.queue_method_call("work", vec![json!(1)]).await.unwrap();
            extra += 1;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    assert!(run.await.unwrap().unwrap());
    let row = store.get_subtask(subtask_id).await.unwrap().unwrap();
    assert_eq!(row.done, row.num);
    assert_eq!(row.num, 30 + extra);
}

#[tokio::test]
async fn test_every_call_runs_once_within_worker_bound() {
    let harness = Harness::new(config(3));
    let mut task = harness.queue.create_task("fan-out", "").await.unwrap();
    let mut subtask = task.queue_subtask("work", "test", vec![]).await.unwrap();
    for _ in 0..20 {
        subtask.queue_method_call("work", vec![json!(5)]).await.unwrap();
    }

    assert_eq!(subtask.run().await.unwrap(), SubtaskOutcome::Done);
    assert_eq!(subtask.success() + subtask.errors(), 20);
    assert_eq!(harness.calls.work_calls.load(Ordering::SeqCst), 20);
    assert!(harness.calls.max_in_flight.load(Ordering::SeqCst) <= 3);
    assert!(harness.calls.max_in_flight.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_calls_queued_mid_run_are_processed() {
    const N: i64 = 5;
    let harness = Harness::new(config(3));
    let mut task = harness.queue.create_task("dynamic", "").await.unwrap();
    let mut subtask = task.queue_subtask("gated", "test", vec![]).await.unwrap();
    for n in 0..N {
        subtask.queue_method_call("gated", vec![json!(n)]).await.unwrap();
    }

    let mut producer = subtask.clone();
    let run = tokio::spawn(async move {
        let outcome = subtask.run().await;
        (outcome, subtask)
    });

    // First pass is blocked inside the workers
    let calls = Arc::clone(&harness.calls);
    eventually(|| calls.waiting.load(Ordering::SeqCst) > 0).await;
    for n in N..2 * N {
        producer.queue_method_call("gated", vec![json!(n)]).await.unwrap();
    }
    harness.open_gate();

    let (outcome, subtask) = run.await.unwrap();
    assert_eq!(outcome.unwrap(), SubtaskOutcome::Done);
    assert_eq!(subtask.success(), 2 * N as u64);
    assert_eq!(subtask.errors(), 0);
    assert_eq!(subtask.record().done, 2 * N);
}

// ============================================
// Failure and retries
// ============================================

#[tokio::test]
async fn test_failure_stops_new_dispatch_and_later_subtasks() {
    let harness = Harness::new(config(1));
    let mut task = harness.queue.create_task("short-circuit", "").await.unwrap();

    let mut failing = task
        .queue_subtask_with_retries("failing", "test", vec![], 1)
        .await
        .unwrap();
    failing
        .queue_method_call("fail", vec![json!("disk full")])
        .await
        .unwrap();
    for _ in 0..5 {
        failing.queue_method_call("work", vec![json!(1)]).await.unwrap();
    }

    let mut after = task.queue_subtask("after", "test", vec![]).await.unwrap();
    after.queue_method_call("work", vec![json!(1)]).await.unwrap();
    task.begin().await.unwrap();

    assert_eq!(task.execute().await.unwrap(), RunOutcome::Failed);
    assert_eq!(task.status(), TaskStatus::Failed);
    assert_eq!(task.errors(), 1);
    assert_eq!(harness.calls.work_calls.load(Ordering::SeqCst), 0);

    failing.reload().await.unwrap();
    assert_eq!(failing.status(), SubtaskStatus::Failed);
    assert_eq!(failing.record().error_message.as_deref(), Some("disk full"));
    assert_eq!(failing.record().done, 0);

    after.reload().await.unwrap();
    assert_eq!(after.status(), SubtaskStatus::Queued);
    assert_eq!(after.atomics().await.unwrap()[0].status, AtomicStatus::Queued);
}

#[tokio::test]
async fn test_failed_call_is_recorded_on_atomic() {
    let harness = Harness::new(config(1));
    let mut task = harness.queue.create_task("record", "").await.unwrap();
    let mut subtask = task
        .queue_subtask_with_retries("one", "test", vec![], 0)
        .await
        .unwrap();
    subtask
        .queue_method_call("fail", vec![json!("bad input")])
        .await
        .unwrap();

    assert_eq!(subtask.run().await.unwrap(), SubtaskOutcome::Failed);
    assert_eq!(subtask.errors(), 1);

    let atomic = &subtask.atomics().await.unwrap()[0];
    assert_eq!(atomic.status, AtomicStatus::Failed);
    assert!(atomic.error.as_deref().unwrap().contains("bad input"));
}

#[tokio::test]
async fn test_retry_pass_recovers_failed_call() {
    let harness = Harness::new(config(2));
    let mut task = harness.queue.create_task("retry", "").await.unwrap();
    let mut subtask = task
        .queue_subtask_with_retries("flaky", "test", vec![], 5)
        .await
        .unwrap();
    subtask.queue_method_call("flaky", vec![json!(7)]).await.unwrap();
    for n in 0..3 {
        subtask.queue_method_call("add", vec![json!(n), json!(n)]).await.unwrap();
    }

    assert_eq!(subtask.run().await.unwrap(), SubtaskOutcome::Retry);
    assert_eq!(subtask.retries(), 4);

    assert!(subtask.run_to_completion().await.unwrap());
    assert_eq!(subtask.status(), SubtaskStatus::Done);
    assert_eq!(subtask.errors(), 0);
    assert_eq!(subtask.record().done, 4);

    let flaky = &subtask.atomics().await.unwrap()[0];
    assert_eq!(flaky.method_name, "flaky");
    assert_eq!(flaky.status, AtomicStatus::Done);
}

#[tokio::test]
async fn test_retry_budget_is_exhausted() {
    let harness = Harness::new(config(2));
    let mut task = harness.queue.create_task("exhaust", "").await.unwrap();
    let mut subtask = task
        .queue_subtask_with_retries("always failing", "test", vec![], 2)
        .await
        .unwrap();
    subtask
        .queue_method_call("fail", vec![json!("nope")])
        .await
        .unwrap();

    assert!(!subtask.run_to_completion().await.unwrap());
    assert_eq!(harness.calls.fail_calls.load(Ordering::SeqCst), 2);
    assert!(subtask.errors() >= 1);

    let stored = harness.store.get_subtask(subtask.id()).await.unwrap().unwrap();
    assert_eq!(stored.retries, 0);
    assert_eq!(stored.status, SubtaskStatus::Failed);
}

#[tokio::test]
async fn test_task_retries_subtask_in_place() {
    // One worker: each pass stops at the first flaky call
    let harness = Harness::new(config(1));
    let mut task = task_with_calls(
        &harness,
        "in place",
        &[("flaky", json!([1])), ("flaky", json!([2])), ("add", json!([1, 1]))],
        3,
    )
    .await;

    assert!(task.run().await.unwrap());
    let subtask = &task.subtasks().await.unwrap()[0];
    assert_eq!(subtask.retries(), 1);
    assert_eq!(subtask.status(), SubtaskStatus::Done);
    assert_eq!(subtask.record().done, 3);
}

#[tokio::test]
async fn test_failed_task_is_refused_until_reset() {
    let harness = Harness::new(config(1));
    let mut task = task_with_calls(&harness, "refuse", &[("flaky", json!([9]))], 1).await;

    assert!(!task.run().await.unwrap());
    assert_eq!(task.status(), TaskStatus::Failed);

    // Refused: the flaky call is not attempted again
    assert_eq!(task.execute().await.unwrap(), RunOutcome::Failed);
    let subtask = &task.subtasks().await.unwrap()[0];
    assert_eq!(subtask.atomics().await.unwrap()[0].status, AtomicStatus::Failed);

    task.reset().await.unwrap();
    assert_eq!(task.status(), TaskStatus::Queued);
    let subtask = &task.subtasks().await.unwrap()[0];
    assert_eq!(subtask.status(), SubtaskStatus::Queued);
    assert_eq!(subtask.retries(), harness.queue.config().default_retries);

    assert!(task.run().await.unwrap());
    assert_eq!(task.status(), TaskStatus::Done);
}

// ============================================
// Exclusivity
// ============================================

#[tokio::test]
async fn test_second_runner_sees_already_running() {
    let harness = Harness::new(config(2));
    let task = task_with_calls(&harness, "exclusive", &[("gated", json!([1]))], 3).await;
    let task_id = task.id();

    let mut first = task.clone();
    let running = tokio::spawn(async move { first.execute().await });

    let calls = Arc::clone(&harness.calls);
    eventually(|| calls.waiting.load(Ordering::SeqCst) > 0).await;

    let before = harness.store.get_task(task_id).await.unwrap().unwrap();
    let mut second = harness.queue.load(task_id).await.unwrap().unwrap();
    assert!(second.is_running().unwrap());
    assert_eq!(second.execute().await.unwrap(), RunOutcome::AlreadyRunning);
    let after = harness.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(before, after);

    harness.open_gate();
    assert_eq!(running.await.unwrap().unwrap(), RunOutcome::Done);
    assert!(!second.is_running().unwrap());
}

#[tokio::test]
async fn test_concurrent_runs_have_one_winner() {
    let harness = Harness::new(config(2));
    let task = task_with_calls(&harness, "race", &[("gated", json!([1]))], 3).await;

    let mut a = task.clone();
    let mut b = task.clone();
    let run_a = tokio::spawn(async move { a.execute().await });
    let run_b = tokio::spawn(async move { b.execute().await });

    eventually(|| run_a.is_finished() || run_b.is_finished()).await;
    harness.open_gate();

    let mut outcomes = vec![
        run_a.await.unwrap().unwrap(),
        run_b.await.unwrap().unwrap(),
    ];
    outcomes.sort_by_key(|outcome| *outcome == RunOutcome::Done);
    assert_eq!(outcomes, vec![RunOutcome::AlreadyRunning, RunOutcome::Done]);
}

// ============================================
// Interrupted completion writes
// ============================================

/// Which side of the write the next `finish_atomic` error lands on
#[derive(Debug, Clone, Copy, PartialEq)]
enum Interruption {
    BeforeWrite,
    AfterWrite,
}

/// In-memory store whose next `finish_atomic` reports a connection error
struct InterruptedStore {
    inner: InMemoryTaskStore,
    interruption: Interruption,
    armed: AtomicBool,
}

impl InterruptedStore {
    fn new(interruption: Interruption) -> Self {
        Self {
            inner: InMemoryTaskStore::new(),
            interruption,
            armed: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl TaskStore for InterruptedStore {
    async fn create_task(&self, name: &str, project_name: &str) -> Result<TaskRecord, StoreError> {
        self.inner.create_task(name, project_name).await
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>, StoreError> {
        self.inner.get_task(task_id).await
    }

    async fn find_tasks_by_name(
        &self,
        name: &str,
        include_failed: bool,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        self.inner.find_tasks_by_name(name, include_failed).await
    }

    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, StoreError> {
        self.inner.list_tasks().await
    }

    async fn set_task_status(&self, task_id: i64, status: TaskStatus) -> Result<(), StoreError> {
        self.inner.set_task_status(task_id, status).await
    }

    async fn mark_task_started(&self, task_id: i64) -> Result<bool, StoreError> {
        self.inner.mark_task_started(task_id).await
    }

    async fn delete_task(&self, task_id: i64) -> Result<(), StoreError> {
        self.inner.delete_task(task_id).await
    }

    async fn insert_subtask(&self, subtask: NewSubtask) -> Result<SubtaskRecord, StoreError> {
        self.inner.insert_subtask(subtask).await
    }

    async fn get_subtask(&self, subtask_id: i64) -> Result<Option<SubtaskRecord>, StoreError> {
        self.inner.get_subtask(subtask_id).await
    }

    async fn list_subtasks(&self, task_id: i64) -> Result<Vec<SubtaskRecord>, StoreError> {
        self.inner.list_subtasks(task_id).await
    }

    async fn pending_subtasks(
        &self,
        task_id: i64,
        limit: usize,
    ) -> Result<Vec<SubtaskRecord>, StoreError> {
        self.inner.pending_subtasks(task_id, limit).await
    }

    async fn set_subtask_status(
        &self,
        subtask_id: i64,
        status: SubtaskStatus,
    ) -> Result<(), StoreError> {
        self.inner.set_subtask_status(subtask_id, status).await
    }

    async fn set_subtask_retries(&self, subtask_id: i64, retries: u32) -> Result<(), StoreError> {
        self.inner.set_subtask_retries(subtask_id, retries).await
    }

    async fn reset_failed_subtasks(&self, task_id: i64, retries: u32) -> Result<u64, StoreError> {
        self.inner.reset_failed_subtasks(task_id, retries).await
    }

    async fn enqueue_atomic(
        &self,
        subtask_id: i64,
        method_name: &str,
        params: Vec<Value>,
    ) -> Result<AtomicRecord, StoreError> {
        self.inner.enqueue_atomic(subtask_id, method_name, params).await
    }

    async fn pending_atomics(
        &self,
        subtask_id: i64,
        limit: usize,
    ) -> Result<Vec<AtomicRecord>, StoreError> {
        self.inner.pending_atomics(subtask_id, limit).await
    }

    async fn finish_atomic(
        &self,
        atomic_id: i64,
        status: AtomicStatus,
        error: Option<&str>,
        message: Option<&str>,
    ) -> Result<bool, StoreError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            if self.interruption == Interruption::AfterWrite {
                self.inner
                    .finish_atomic(atomic_id, status, error, message)
                    .await?;
            }
            return Err(StoreError::Database("connection reset".to_string()));
        }
        self.inner
            .finish_atomic(atomic_id, status, error, message)
            .await
    }

    async fn requeue_failed_atomics(&self, subtask_id: i64) -> Result<u64, StoreError> {
        self.inner.requeue_failed_atomics(subtask_id).await
    }

    async fn list_atomics(&self, subtask_id: i64) -> Result<Vec<AtomicRecord>, StoreError> {
        self.inner.list_atomics(subtask_id).await
    }

    async fn progress_totals(&self, task_id: i64) -> Result<ProgressTotals, StoreError> {
        self.inner.progress_totals(task_id).await
    }

    async fn current_subtask(&self, task_id: i64) -> Result<Option<CurrentSubtask>, StoreError> {
        self.inner.current_subtask(task_id).await
    }
}

/// Run a 4-call task through one interrupted completion, then run it again
async fn rerun_after_interruption(interruption: Interruption) -> (Task, SubtaskRecord) {
    let store = Arc::new(InterruptedStore::new(interruption));
    let (_gate, gate_rx) = watch::channel(false);
    let queue = TaskQueue::new(
        store.clone(),
        Arc::new(InMemoryLockProvider::new()),
        Arc::new(registry(Arc::new(Calls::default()), gate_rx)),
        config(1),
    );

    let mut task = queue.create_task("interrupted", "tests").await.unwrap();
    let mut subtask = task.queue_subtask("phase", "test", vec![]).await.unwrap();
    for n in 0..4 {
        subtask
            .queue_method_call("add", vec![json!(n), json!(1)])
            .await
            .unwrap();
    }
    task.begin().await.unwrap();

    let first = task.run().await;
    assert!(matches!(first, Err(EngineError::Store(StoreError::Database(_)))));
    let stored = store.get_task(task.id()).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Running);

    assert!(task.run().await.unwrap());
    let row = store.get_subtask(subtask.id()).await.unwrap().unwrap();
    (task, row)
}

#[tokio::test]
async fn test_completion_lost_before_write_is_redispatched() {
    let (task, row) = rerun_after_interruption(Interruption::BeforeWrite).await;

    assert_eq!(task.status(), TaskStatus::Done);
    assert_eq!((row.num, row.done), (4, 4));
    assert_eq!(task.progress().await.unwrap().percent, 100);
}

#[tokio::test]
async fn test_completion_lost_after_write_is_counted_once() {
    let (task, row) = rerun_after_interruption(Interruption::AfterWrite).await;

    assert_eq!(task.status(), TaskStatus::Done);
    assert_eq!((row.num, row.done), (4, 4));
    assert_eq!(task.progress().await.unwrap().percent, 100);
}

// ============================================
// Progress
// ============================================

#[tokio::test]
async fn test_progress_is_monotonic_and_reaches_100() {
    let harness = Harness::new(config(2));
    let calls: Vec<(&str, serde_json::Value)> = (0..24).map(|_| ("work", json!([4]))).collect();
    let mut task = task_with_calls(&harness, "progress", &calls, 3).await;

    let before = task.progress().await.unwrap();
    assert_eq!(before.percent, 0);
    assert_eq!(before.estimated_seconds_remaining, -1);
    assert_eq!(before.description, "phase");

    let observer = task.clone();
    let run = tokio::spawn(async move { task.run().await });

    let mut last = 0;
    while !run.is_finished() {
        let progress = observer.progress().await.unwrap();
        assert!(progress.percent >= last);
        assert!(progress.percent <= 100);
        last = progress.percent;
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
    assert!(run.await.unwrap().unwrap());

    let done = observer.progress().await.unwrap();
    assert_eq!(done.percent, 100);
    assert!(done.time_started.is_some());
    assert_eq!(done.description, "");
    assert_eq!(done.status, None);
}

#[tokio::test]
async fn test_progress_of_task_without_calls_is_empty() {
    let harness = Harness::new(config(1));
    let mut task = harness.queue.create_task("idle", "").await.unwrap();
    task.queue_subtask("nothing yet", "test", vec![]).await.unwrap();

    let progress = task.progress().await.unwrap();
    assert_eq!(progress.percent, 0);
    assert_eq!(progress.estimated_seconds_remaining, 0);
    assert_eq!(progress.description, "");
}

// ============================================
// Runner
// ============================================

#[tokio::test]
async fn test_runner_announces_success() {
    let harness = Harness::new(config(2));
    let task = task_with_calls(&harness, "nightly export", &[("add", json!([1, 2]))], 3).await;

    let notifier = RecordingNotifier::new();
    let runner = harness.runner(notifier.clone(), RecordingSupervisor::new());

    assert_eq!(runner.run_now(task.id()).await.unwrap(), RunReport::Done);

    let calls = notifier.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].title, "Task finished");
    assert_eq!(calls[0].message, "'nightly export' has finished successfully");
    assert_eq!(
        calls[0].tags,
        vec!["task".to_string(), "task.project.tests".to_string()]
    );
    assert!(harness.queue.load(task.id()).await.unwrap().is_some());
}

#[tokio::test]
async fn test_runner_announces_failure() {
    let harness = Harness::new(config(1));
    let task = task_with_calls(&harness, "import", &[("fail", json!(["quota exceeded"]))], 1).await;

    let notifier = RecordingNotifier::new();
    let runner = harness.runner(notifier.clone(), RecordingSupervisor::new());

    assert_eq!(runner.run_now(task.id()).await.unwrap(), RunReport::Failed);
    let calls = notifier.calls();
    assert_eq!(calls[0].title, "Task failed");
    assert_eq!(calls[0].message, "'import' failed with quota exceeded");

    // A failed task is left alone on the next attempt
    assert_eq!(runner.run_now(task.id()).await.unwrap(), RunReport::Refused);
    assert_eq!(notifier.calls().len(), 1);
}

#[tokio::test]
async fn test_runner_reports_missing_task() {
    let harness = Harness::new(config(1));
    let runner = harness.runner(RecordingNotifier::new(), RecordingSupervisor::new());
    assert_eq!(runner.run_now(404).await.unwrap(), RunReport::NotFound);
}

#[tokio::test]
async fn test_runner_removes_finished_task() {
    let harness = Harness::new(config(1));
    let task = task_with_calls(&harness, "cleanup", &[("add", json!([1, 1]))], 3).await;

    let runner = Runner::new(
        harness.queue.clone(),
        Arc::new(RecordingNotifier::new()),
        Arc::new(RecordingSupervisor::new()),
        RunnerOptions::default().with_remove_finished(true),
    );

    assert_eq!(runner.run_now(task.id()).await.unwrap(), RunReport::Done);
    assert!(harness.queue.load(task.id()).await.unwrap().is_none());
    assert_eq!(harness.store.task_count(), 0);
}

#[tokio::test]
async fn test_runner_relaunches_aborted_task() {
    let harness = Harness::new(config(1));
    let mut task = harness.queue.create_task("aborted", "").await.unwrap();
    task.queue_subtask("nowhere", "missing", vec![])
        .await
        .unwrap()
        .queue_method_call("add", vec![json!(1), json!(1)])
        .await
        .unwrap();
    task.begin().await.unwrap();

    let supervisor = RecordingSupervisor::new();
    let runner = harness.runner(RecordingNotifier::new(), supervisor.clone());

    let err = runner.run_now(task.id()).await.unwrap_err();
    assert!(matches!(err, EngineError::WorkerPool(_)));
    assert_eq!(supervisor.launched(), vec![task.id()]);
    assert!(!task.is_running().unwrap());
}

#[tokio::test]
async fn test_launch_queued_skips_held_and_unready_tasks() {
    let harness = Harness::new(config(1));
    let queued = task_with_calls(&harness, "queued", &[("add", json!([1, 1]))], 3).await;
    let held = task_with_calls(&harness, "held", &[("add", json!([1, 1]))], 3).await;
    let _generating = harness.queue.create_task("generating", "").await.unwrap();

    assert!(harness.locks.try_acquire(&held.lock_scope()).unwrap());

    let supervisor = RecordingSupervisor::new();
    let runner = harness.runner(RecordingNotifier::new(), supervisor.clone());

    assert_eq!(runner.launch_queued().await.unwrap(), vec![queued.id()]);
    assert_eq!(supervisor.launched(), vec![queued.id()]);
}

#[tokio::test]
async fn test_watch_launches_until_shutdown() {
    let harness = Harness::new(config(1));
    let task = task_with_calls(&harness, "watched", &[("add", json!([1, 1]))], 3).await;

    let supervisor = RecordingSupervisor::new();
    let runner = Runner::new(
        harness.queue.clone(),
        Arc::new(RecordingNotifier::new()),
        Arc::new(supervisor.clone()),
        RunnerOptions::default().with_watch_interval(Duration::from_millis(10)),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watching = tokio::spawn(async move { runner.watch(shutdown_rx).await });

    let observed = supervisor.clone();
    eventually(|| !observed.launched().is_empty()).await;
    shutdown_tx.send_replace(true);

    watching.await.unwrap().unwrap();
    assert!(supervisor.launched().iter().all(|id| *id == task.id()));
}
