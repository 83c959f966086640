//! Executor integration tests - listener ordering, cancellation, triggers
//!
//! `cargo test -p cadence-task --test executor_test`

use async_trait::async_trait;
use cadence_foundation::{ContextGuard, ContextProvider, ContextSnapshot, ExecutorConfig};
use cadence_task::{
    AnyHandle, ExecutionError, ExecutionHistory, ExecutionStatus, ExecutorBuilder, HandleId,
    Interrupted, LastExecution, ManagedExecutor, Task, TaskContext, TaskEvent, TaskHandle,
    TaskListener, TaskState, Trigger,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::cell::Cell;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

// ============================================================================
// Helpers
// ============================================================================

fn kind(error: &ExecutionError) -> &'static str {
    match error {
        ExecutionError::Cancelled { .. } => "cancelled",
        ExecutionError::Skipped { .. } => "skipped",
        ExecutionError::SubmissionRejected { .. } => "rejected",
        ExecutionError::StartAborted { .. } => "start-aborted",
        ExecutionError::Failed { .. } => "failed",
        ExecutionError::TriggerFailed { .. } => "trigger-failed",
        _ => "other",
    }
}

/// Records every callback as `"<attempt>:<callback>[:<error kind>]"`
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn count(&self, callback: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.split(':').nth(1) == Some(callback))
            .count()
    }

    async fn wait_for_done(&self, n: usize) {
        wait_until(|| self.count("done") >= n).await;
    }

    fn push(&self, event: &TaskEvent<'_>, label: String) {
        self.events
            .lock()
            .push(format!("{}:{}", event.attempt(), label));
    }
}

#[async_trait]
impl TaskListener for Recorder {
    async fn submitted(&self, event: &TaskEvent<'_>) -> anyhow::Result<()> {
        self.push(event, "submitted".into());
        Ok(())
    }

    async fn starting(&self, event: &TaskEvent<'_>) -> anyhow::Result<()> {
        self.push(event, "starting".into());
        Ok(())
    }

    async fn aborted(&self, event: &TaskEvent<'_>, error: &ExecutionError) -> anyhow::Result<()> {
        self.push(event, format!("aborted:{}", kind(error)));
        Ok(())
    }

    async fn done(
        &self,
        event: &TaskEvent<'_>,
        error: Option<&ExecutionError>,
    ) -> anyhow::Result<()> {
        match error {
            None => self.push(event, "done".into()),
            Some(e) => self.push(event, format!("done:{}", kind(e))),
        }
        Ok(())
    }
}

async fn wait_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

fn counting_task(name: &str, counter: Arc<AtomicU32>) -> Task<u32> {
    Task::new(name, move |_ctx: TaskContext| {
        let counter = Arc::clone(&counter);
        async move { Ok(counter.fetch_add(1, Ordering::SeqCst) + 1) }
    })
}

/// Grants `runs` attempts, `gap` apart
struct Spaced {
    runs: u64,
    gap: ChronoDuration,
}

impl Trigger for Spaced {
    fn next_run_time(
        &self,
        history: &ExecutionHistory,
        scheduled_at: DateTime<Utc>,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(match history.attempts() {
            0 => Some(scheduled_at),
            n if n < self.runs => Some(Utc::now() + self.gap),
            _ => None,
        })
    }
}

fn spaced(runs: u64, gap_ms: i64) -> Arc<dyn Trigger> {
    Arc::new(Spaced {
        runs,
        gap: ChronoDuration::milliseconds(gap_ms),
    })
}

// ============================================================================
// One-shot
// ============================================================================

#[tokio::test]
async fn test_one_shot_success_sequence() {
    let executor = ManagedExecutor::new();
    let recorder = Arc::new(Recorder::default());

    let task = Task::new("answer", |_ctx| async { Ok(42u32) }).with_listener(recorder.clone());
    let handle = executor.submit(task).await.unwrap();

    assert_eq!(handle.get().await.unwrap(), 42);
    recorder.wait_for_done(1).await;

    assert_eq!(recorder.events(), vec!["1:submitted", "1:starting", "1:done"]);
    assert!(handle.is_done());
    assert!(!handle.is_cancelled());
    assert_eq!(handle.state(), TaskState::Done);
    assert!(handle.delay() <= ChronoDuration::zero());
}

#[tokio::test]
async fn test_cancel_before_start() {
    let executor = ManagedExecutor::new();
    let recorder = Arc::new(Recorder::default());
    let ran = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&ran);
    let task = Task::new("later", move |_ctx| {
        let flag = Arc::clone(&flag);
        async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }
    })
    .with_listener(recorder.clone());

    let handle = executor
        .schedule(task, ChronoDuration::seconds(60))
        .await
        .unwrap();
    assert!(handle.delay() > ChronoDuration::zero());

    assert!(handle.cancel(false));
    recorder.wait_for_done(1).await;

    assert_eq!(
        recorder.events(),
        vec!["1:submitted", "1:aborted:cancelled", "1:done:cancelled"]
    );
    assert!(handle.is_cancelled());
    assert!(handle.is_done());
    assert!(handle.delay() <= ChronoDuration::zero());
    assert!(handle.get().await.unwrap_err().is_cancellation());
    assert!(!ran.load(Ordering::SeqCst));

    // already terminal
    assert!(!handle.cancel(true));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(recorder.events().len(), 3);
}

#[tokio::test]
async fn test_cancel_interrupts_running_body() {
    let executor = ManagedExecutor::new();
    let recorder = Arc::new(Recorder::default());
    let started = Arc::new(Notify::new());

    let signal = Arc::clone(&started);
    let task = Task::new("sleeper", move |ctx: TaskContext| {
        let signal = Arc::clone(&signal);
        async move {
            signal.notify_one();
            ctx.interrupted().await;
            Err::<(), _>(anyhow::Error::new(Interrupted))
        }
    })
    .with_listener(recorder.clone());

    let handle = executor.submit(task).await.unwrap();
    started.notified().await;
    assert_eq!(handle.state(), TaskState::Running);

    assert!(handle.cancel(true));
    recorder.wait_for_done(1).await;

    match handle.get().await.unwrap_err() {
        ExecutionError::Cancelled {
            was_running,
            interrupted,
            ..
        } => {
            assert!(was_running);
            assert!(interrupted);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    // the body honored the interrupt, so `done` reports its own error
    assert_eq!(
        recorder.events(),
        vec![
            "1:submitted",
            "1:starting",
            "1:aborted:cancelled",
            "1:done:failed"
        ]
    );
}

#[tokio::test]
async fn test_get_timeout_leaves_attempt_running() {
    let executor = ManagedExecutor::new();
    let task = Task::new("slow", |_ctx| async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(5u8)
    });
    let handle = executor.submit(task).await.unwrap();

    let err = handle
        .get_timeout(Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::Timeout(_)));
    assert!(!handle.is_done());

    assert_eq!(handle.get_timeout(Duration::from_secs(5)).await.unwrap(), 5);
}

#[tokio::test]
async fn test_body_panic_is_failure() {
    let executor = ManagedExecutor::new();
    let task = Task::<()>::new("boom", |_ctx| async {
        if true {
            panic!("kaboom");
        }
        Ok(())
    });
    let handle = executor.submit(task).await.unwrap();

    let err = handle.get().await.unwrap_err();
    assert!(err.is_task_failure());
    assert!(err.to_string().contains("kaboom"));
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn test_handles_order_by_next_run() {
    let executor = ManagedExecutor::new();
    let a = executor
        .schedule(Task::new("a", |_ctx| async { Ok(()) }), ChronoDuration::seconds(10))
        .await
        .unwrap();
    let b = executor
        .schedule(Task::new("b", |_ctx| async { Ok(()) }), ChronoDuration::seconds(20))
        .await
        .unwrap();

    assert_eq!(a.cmp(&b), CmpOrdering::Less);
    assert_eq!(b.cmp(&a), CmpOrdering::Greater);
    assert_eq!(a.cmp(&a), CmpOrdering::Equal);

    assert!(a.cancel(false));
    assert!(b.cancel(false));

    assert_eq!(a.cmp(&b), CmpOrdering::Less);
    assert_eq!(b.cmp(&a), CmpOrdering::Greater);
    assert_eq!(a.cmp(&a), CmpOrdering::Equal);
    assert_eq!(a.erase().cmp(&b.erase()), CmpOrdering::Less);
}

// ============================================================================
// Series
// ============================================================================

#[tokio::test]
async fn test_trigger_grants_n_runs() {
    let executor = ManagedExecutor::new();
    let recorder = Arc::new(Recorder::default());
    let counter = Arc::new(AtomicU32::new(0));

    let task = counting_task("tick", Arc::clone(&counter)).with_listener(recorder.clone());
    let handle = executor
        .schedule_with_trigger(task, spaced(3, 5))
        .await
        .unwrap();

    recorder.wait_for_done(3).await;
    assert_eq!(
        recorder.events(),
        vec![
            "1:submitted",
            "1:starting",
            "1:done",
            "2:submitted",
            "2:starting",
            "2:done",
            "3:submitted",
            "3:starting",
            "3:done",
        ]
    );
    assert!(handle.is_done());
    assert_eq!(handle.attempt(), 3);
    assert_eq!(handle.get().await.unwrap(), 3);
    assert_eq!(handle.next_run_time(), None);
}

#[tokio::test]
async fn test_two_run_counting_scenario() {
    let executor = ManagedExecutor::new();
    let recorder = Arc::new(Recorder::default());
    let counter = Arc::new(AtomicU32::new(0));

    let task = counting_task("count", Arc::clone(&counter)).with_listener(recorder.clone());
    let handle = executor
        .schedule_with_trigger(task, spaced(2, 300))
        .await
        .unwrap();

    let first = handle.wait_for_attempt(1).await.unwrap();
    assert_eq!(first.outcome.unwrap(), 1);
    assert_eq!(handle.get().await.unwrap(), 1);

    let second = handle.wait_for_attempt(2).await.unwrap();
    assert_eq!(second.outcome.unwrap(), 2);
    assert_eq!(handle.get().await.unwrap(), 2);

    recorder.wait_for_done(2).await;
    assert_eq!(recorder.events().len(), 6);
    assert_eq!(recorder.count("aborted"), 0);
}

/// Skips the attempt right after attempt 1 and remembers what it saw
#[derive(Default)]
struct SkipSecond {
    saw_skipped_record: AtomicBool,
}

impl Trigger for SkipSecond {
    fn next_run_time(
        &self,
        history: &ExecutionHistory,
        scheduled_at: DateTime<Utc>,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        if let Some(last) = history.last() {
            if last.status() == ExecutionStatus::Skipped && !last.has_result() {
                self.saw_skipped_record.store(true, Ordering::SeqCst);
            }
        }
        Ok(match history.attempts() {
            0 => Some(scheduled_at),
            n if n < 3 => Some(Utc::now()),
            _ => None,
        })
    }

    fn skip_run(
        &self,
        last: Option<&LastExecution>,
        _scheduled_for: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        Ok(last.map(LastExecution::attempt) == Some(1))
    }
}

#[tokio::test]
async fn test_skip_records_history_and_continues() {
    let executor = ManagedExecutor::new();
    let recorder = Arc::new(Recorder::default());
    let counter = Arc::new(AtomicU32::new(0));
    let trigger = Arc::new(SkipSecond::default());

    let task = counting_task("skippy", Arc::clone(&counter)).with_listener(recorder.clone());
    let handle = executor
        .schedule_with_trigger(task, trigger.clone())
        .await
        .unwrap();

    recorder.wait_for_done(3).await;
    assert_eq!(
        recorder.events(),
        vec![
            "1:submitted",
            "1:starting",
            "1:done",
            "2:submitted",
            "2:aborted:skipped",
            "2:done:skipped",
            "3:submitted",
            "3:starting",
            "3:done",
        ]
    );
    assert!(trigger.saw_skipped_record.load(Ordering::SeqCst));
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(handle.get().await.unwrap(), 2);
    assert_eq!(executor.stats().skipped, 1);
}

struct Never;

impl Trigger for Never {
    fn next_run_time(
        &self,
        _history: &ExecutionHistory,
        _scheduled_at: DateTime<Utc>,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(None)
    }
}

#[tokio::test]
async fn test_trigger_declining_first_run_rejects_submission() {
    let executor = ManagedExecutor::new();
    let recorder = Arc::new(Recorder::default());

    let task = Task::new("never", |_ctx| async { Ok(()) }).with_listener(recorder.clone());
    let err = executor
        .schedule_with_trigger(task, Arc::new(Never))
        .await
        .unwrap_err();

    assert!(matches!(err, ExecutionError::SubmissionRejected { .. }));
    assert!(err.is_declined());
    assert!(recorder.events().is_empty());
    assert_eq!(executor.stats().submitted, 0);
}

/// First run is granted, computing the second fails
struct BrokenCalendar;

impl Trigger for BrokenCalendar {
    fn next_run_time(
        &self,
        history: &ExecutionHistory,
        scheduled_at: DateTime<Utc>,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        if history.is_empty() {
            return Ok(Some(scheduled_at));
        }
        anyhow::bail!("calendar service unavailable")
    }
}

#[tokio::test]
async fn test_trigger_failure_aborts_attempt() {
    let executor = ManagedExecutor::new();
    let recorder = Arc::new(Recorder::default());

    let task = Task::new("cal", |_ctx| async { Ok(1u8) }).with_listener(recorder.clone());
    let handle = executor
        .schedule_with_trigger(task, Arc::new(BrokenCalendar))
        .await
        .unwrap();

    recorder.wait_for_done(1).await;
    let err = handle.get().await.unwrap_err();
    assert!(err.is_trigger_failure());
    assert!(!err.is_task_failure());
    assert!(handle.is_done());
    assert_eq!(
        recorder.events(),
        vec![
            "1:submitted",
            "1:starting",
            "1:aborted:trigger-failed",
            "1:done:trigger-failed"
        ]
    );
}

#[tokio::test]
async fn test_fixed_rate_until_cancelled() {
    let executor = ManagedExecutor::new();
    let counter = Arc::new(AtomicU32::new(0));

    let handle = executor
        .schedule_at_fixed_rate(
            counting_task("rate", Arc::clone(&counter)),
            ChronoDuration::milliseconds(-50),
            ChronoDuration::milliseconds(10),
        )
        .await
        .unwrap();
    assert!(handle.is_repeating());

    wait_until(|| counter.load(Ordering::SeqCst) >= 3).await;
    assert!(handle.cancel(false));
    assert!(handle.is_done());
    assert!(handle.get().await.unwrap_err().is_cancellation());
    assert!(!handle.cancel(false));
}

#[tokio::test]
async fn test_fixed_delay_stops_after_failure() {
    let executor = ManagedExecutor::new();
    let recorder = Arc::new(Recorder::default());
    let counter = Arc::new(AtomicU32::new(0));

    let runs = Arc::clone(&counter);
    let task = Task::new("flaky", move |_ctx: TaskContext| {
        let runs = Arc::clone(&runs);
        async move {
            let n = runs.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 2 {
                anyhow::bail!("disk full on run {}", n);
            }
            Ok(n)
        }
    })
    .with_listener(recorder.clone());

    let handle = executor
        .schedule_with_fixed_delay(task, ChronoDuration::zero(), ChronoDuration::milliseconds(5))
        .await
        .unwrap();

    recorder.wait_for_done(2).await;
    let err = handle.get().await.unwrap_err();
    assert!(err.is_task_failure());
    assert!(handle.is_done());
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(recorder.count("aborted"), 0);
    assert_eq!(recorder.events().last().unwrap(), "2:done:failed");
}

// ============================================================================
// Listener failures and re-entrancy
// ============================================================================

struct RejectSubmit;

#[async_trait]
impl TaskListener for RejectSubmit {
    async fn submitted(&self, _event: &TaskEvent<'_>) -> anyhow::Result<()> {
        anyhow::bail!("quota exceeded")
    }
}

#[tokio::test]
async fn test_submitted_failure_fails_submission() {
    let executor = ManagedExecutor::new();
    let recorder = Arc::new(Recorder::default());

    /// Forwards to the recorder, then fails `submitted`
    struct Both(Arc<Recorder>);

    #[async_trait]
    impl TaskListener for Both {
        async fn submitted(&self, event: &TaskEvent<'_>) -> anyhow::Result<()> {
            self.0.submitted(event).await?;
            RejectSubmit.submitted(event).await
        }

        async fn aborted(
            &self,
            event: &TaskEvent<'_>,
            error: &ExecutionError,
        ) -> anyhow::Result<()> {
            self.0.aborted(event, error).await
        }

        async fn done(
            &self,
            event: &TaskEvent<'_>,
            error: Option<&ExecutionError>,
        ) -> anyhow::Result<()> {
            self.0.done(event, error).await
        }
    }

    let task = Task::new("quota", |_ctx| async { Ok(()) })
        .with_listener(Arc::new(Both(recorder.clone())));
    let err = executor.submit(task).await.unwrap_err();

    assert!(matches!(err, ExecutionError::SubmissionRejected { .. }));
    assert!(err.cause().unwrap().to_string().contains("quota exceeded"));
    assert_eq!(
        recorder.events(),
        vec!["1:submitted", "1:aborted:rejected", "1:done:rejected"]
    );
    assert_eq!(executor.stats().submitted, 0);
}

struct RejectStart(Arc<Recorder>);

#[async_trait]
impl TaskListener for RejectStart {
    async fn submitted(&self, event: &TaskEvent<'_>) -> anyhow::Result<()> {
        self.0.submitted(event).await
    }

    async fn starting(&self, event: &TaskEvent<'_>) -> anyhow::Result<()> {
        self.0.starting(event).await?;
        anyhow::bail!("maintenance window")
    }

    async fn aborted(&self, event: &TaskEvent<'_>, error: &ExecutionError) -> anyhow::Result<()> {
        self.0.aborted(event, error).await
    }

    async fn done(
        &self,
        event: &TaskEvent<'_>,
        error: Option<&ExecutionError>,
    ) -> anyhow::Result<()> {
        self.0.done(event, error).await
    }
}

#[tokio::test]
async fn test_starting_failure_skips_body() {
    let executor = ManagedExecutor::new();
    let recorder = Arc::new(Recorder::default());
    let counter = Arc::new(AtomicU32::new(0));

    let task = counting_task("blocked", Arc::clone(&counter))
        .with_listener(Arc::new(RejectStart(recorder.clone())));
    let handle = executor.submit(task).await.unwrap();

    let err = handle.get().await.unwrap_err();
    assert!(matches!(err, ExecutionError::StartAborted { .. }));
    recorder.wait_for_done(1).await;

    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert_eq!(
        recorder.events(),
        vec![
            "1:submitted",
            "1:starting",
            "1:aborted:start-aborted",
            "1:done:start-aborted"
        ]
    );
}

struct FailingDone;

#[async_trait]
impl TaskListener for FailingDone {
    async fn done(
        &self,
        _event: &TaskEvent<'_>,
        _error: Option<&ExecutionError>,
    ) -> anyhow::Result<()> {
        anyhow::bail!("audit sink down")
    }
}

#[tokio::test]
async fn test_done_failure_is_swallowed() {
    let executor = ManagedExecutor::new();
    let task = Task::new("audited", |_ctx| async { Ok(9u8) }).with_listener(Arc::new(FailingDone));
    let handle = executor.submit(task).await.unwrap();

    assert_eq!(handle.get().await.unwrap(), 9);
    wait_until(|| executor.stats().listener_failures == 1).await;
    assert_eq!(handle.get().await.unwrap(), 9);
}

/// Cancels the first handle it sees during `submitted`, then resubmits
/// from `aborted`
#[derive(Default)]
struct CancelThenResubmit {
    cancelled_once: AtomicBool,
    derived: Mutex<Option<AnyHandle>>,
}

#[async_trait]
impl TaskListener for CancelThenResubmit {
    async fn submitted(&self, event: &TaskEvent<'_>) -> anyhow::Result<()> {
        if !self.cancelled_once.swap(true, Ordering::SeqCst) {
            assert!(event.handle().cancel(false));
        }
        Ok(())
    }

    async fn aborted(&self, event: &TaskEvent<'_>, error: &ExecutionError) -> anyhow::Result<()> {
        if error.is_cancellation() && self.derived.lock().is_none() {
            let derived = event.resubmit().await?;
            *self.derived.lock() = Some(derived);
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_cancel_in_submitted_then_resubmit_from_aborted() {
    let executor = ManagedExecutor::new();
    let listener = Arc::new(CancelThenResubmit::default());
    let counter = Arc::new(AtomicU32::new(0));

    let task = counting_task("phoenix", Arc::clone(&counter)).with_listener(listener.clone());
    let original = executor.submit(task).await.unwrap();

    assert!(original.is_cancelled());
    assert!(original.get().await.unwrap_err().is_cancellation());

    wait_until(|| listener.derived.lock().is_some()).await;
    let derived = listener
        .derived
        .lock()
        .clone()
        .and_then(|h| h.downcast::<u32>())
        .unwrap();

    assert_ne!(derived, original);
    assert_eq!(derived.get().await.unwrap(), 1);
    assert!(original.get().await.unwrap_err().is_cancellation());
}

struct SiblingWaiter {
    sibling: TaskHandle<u32>,
    seen: Mutex<Option<u32>>,
}

#[async_trait]
impl TaskListener for SiblingWaiter {
    async fn done(
        &self,
        _event: &TaskEvent<'_>,
        _error: Option<&ExecutionError>,
    ) -> anyhow::Result<()> {
        let value = self.sibling.get().await?;
        *self.seen.lock() = Some(value);
        Ok(())
    }
}

#[tokio::test]
async fn test_listener_can_wait_on_sibling() {
    let executor = ManagedExecutor::new();
    let sibling = executor
        .submit(Task::new("sibling", |_ctx| async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(7u32)
        }))
        .await
        .unwrap();

    let waiter = Arc::new(SiblingWaiter {
        sibling,
        seen: Mutex::new(None),
    });
    executor
        .submit(Task::new("waiter", |_ctx| async { Ok(()) }).with_listener(waiter.clone()))
        .await
        .unwrap();

    wait_until(|| waiter.seen.lock().is_some()).await;
    assert_eq!(*waiter.seen.lock(), Some(7));
}

// ============================================================================
// Context propagation
// ============================================================================

struct FlagProvider(Arc<AtomicU32>);
struct FlagSnapshot(Arc<AtomicU32>);

impl ContextSnapshot for FlagSnapshot {
    fn apply(&self) -> ContextGuard {
        self.0.store(1, Ordering::SeqCst);
        let flag = Arc::clone(&self.0);
        ContextGuard::new(move || flag.store(0, Ordering::SeqCst))
    }
}

impl ContextProvider for FlagProvider {
    fn capture(&self) -> Arc<dyn ContextSnapshot> {
        Arc::new(FlagSnapshot(Arc::clone(&self.0)))
    }
}

#[tokio::test]
async fn test_body_runs_with_captured_context() {
    let flag = Arc::new(AtomicU32::new(0));
    let executor = ExecutorBuilder::new()
        .context_provider(Arc::new(FlagProvider(Arc::clone(&flag))))
        .build()
        .unwrap();

    let observed = Arc::clone(&flag);
    let task = Task::new("ctx", move |_ctx: TaskContext| {
        let observed = Arc::clone(&observed);
        async move { Ok(observed.load(Ordering::SeqCst)) }
    });
    let handle = executor.submit(task).await.unwrap();

    assert_eq!(handle.get().await.unwrap(), 1);
    assert_eq!(flag.load(Ordering::SeqCst), 0);
}

#[derive(Default)]
struct TenantSeen {
    seen: Mutex<Vec<(&'static str, u32)>>,
}

#[async_trait]
impl TaskListener for TenantSeen {
    async fn submitted(&self, _event: &TaskEvent<'_>) -> anyhow::Result<()> {
        self.seen.lock().push(("submitted", tenant()));
        Ok(())
    }

    async fn starting(&self, _event: &TaskEvent<'_>) -> anyhow::Result<()> {
        self.seen.lock().push(("starting", tenant()));
        Ok(())
    }

    async fn done(
        &self,
        _event: &TaskEvent<'_>,
        _error: Option<&ExecutionError>,
    ) -> anyhow::Result<()> {
        self.seen.lock().push(("done", tenant()));
        Ok(())
    }
}

thread_local! {
    static TENANT: Cell<u32> = const { Cell::new(0) };
}

fn tenant() -> u32 {
    TENANT.with(Cell::get)
}

fn set_tenant(value: u32) {
    TENANT.with(|t| t.set(value));
}

/// Thread-local context, the way request-scoped state usually lives
struct TenantProvider;
struct Tenant(u32);

impl ContextSnapshot for Tenant {
    fn apply(&self) -> ContextGuard {
        let previous = TENANT.with(|t| t.replace(self.0));
        ContextGuard::new(move || set_tenant(previous))
    }
}

impl ContextProvider for TenantProvider {
    fn capture(&self) -> Arc<dyn ContextSnapshot> {
        Arc::new(Tenant(tenant()))
    }
}

#[tokio::test]
async fn test_context_not_left_on_thread_while_body_is_suspended() {
    let executor = ExecutorBuilder::new()
        .context_provider(Arc::new(TenantProvider))
        .build()
        .unwrap();

    set_tenant(1);
    let task = Task::new("tenant", |_ctx: TaskContext| async {
        let before = tenant();
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok((before, tenant()))
    });
    let handle = executor.submit(task).await.unwrap();
    set_tenant(0);

    // the body is parked in its sleep; this thread must be clean
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(tenant(), 0);

    assert_eq!(handle.get().await.unwrap(), (1, 1));
    assert_eq!(tenant(), 0);
}

#[tokio::test]
async fn test_listener_runs_in_its_registration_context() {
    let executor = ExecutorBuilder::new()
        .context_provider(Arc::new(TenantProvider))
        .build()
        .unwrap();
    let listener = Arc::new(TenantSeen::default());

    set_tenant(5);
    let registered = TenantProvider.capture();
    set_tenant(1);

    let task = Task::new("tenant", |_ctx: TaskContext| async { Ok(tenant()) })
        .with_listener_context(listener.clone(), registered);
    let handle = executor.submit(task).await.unwrap();
    set_tenant(0);

    assert_eq!(handle.get().await.unwrap(), 1);
    wait_until(|| listener.seen.lock().len() == 3).await;
    assert_eq!(
        *listener.seen.lock(),
        vec![("submitted", 5), ("starting", 5), ("done", 5)]
    );
    assert_eq!(tenant(), 0);
}

// ============================================================================
// Cancellation races
// ============================================================================

/// Cancels its own handle from inside `starting`
struct CancelOnStart(Arc<Recorder>);

#[async_trait]
impl TaskListener for CancelOnStart {
    async fn submitted(&self, event: &TaskEvent<'_>) -> anyhow::Result<()> {
        self.0.submitted(event).await
    }

    async fn starting(&self, event: &TaskEvent<'_>) -> anyhow::Result<()> {
        self.0.starting(event).await?;
        assert!(event.handle().cancel(true));
        Ok(())
    }

    async fn aborted(&self, event: &TaskEvent<'_>, error: &ExecutionError) -> anyhow::Result<()> {
        self.0.aborted(event, error).await
    }

    async fn done(
        &self,
        event: &TaskEvent<'_>,
        error: Option<&ExecutionError>,
    ) -> anyhow::Result<()> {
        self.0.done(event, error).await
    }
}

#[tokio::test]
async fn test_cancel_during_starting_keeps_body_from_running() {
    let executor = ManagedExecutor::new();
    let recorder = Arc::new(Recorder::default());
    let counter = Arc::new(AtomicU32::new(0));

    let task = counting_task("second-thoughts", Arc::clone(&counter))
        .with_listener(Arc::new(CancelOnStart(recorder.clone())));
    let handle = executor.submit(task).await.unwrap();

    recorder.wait_for_done(1).await;
    assert_eq!(
        recorder.events(),
        vec![
            "1:submitted",
            "1:starting",
            "1:aborted:cancelled",
            "1:done:cancelled"
        ]
    );
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert!(matches!(
        handle.get().await.unwrap_err(),
        ExecutionError::Cancelled {
            was_running: false,
            ..
        }
    ));
}

#[tokio::test]
async fn test_result_of_body_ignoring_interrupt_is_discarded() {
    let executor = ManagedExecutor::new();
    let recorder = Arc::new(Recorder::default());
    let started = Arc::new(Notify::new());

    let signal = Arc::clone(&started);
    let task = Task::new("stubborn", move |_ctx: TaskContext| {
        let signal = Arc::clone(&signal);
        async move {
            signal.notify_one();
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(7u32)
        }
    })
    .with_listener(recorder.clone());

    let handle = executor.submit(task).await.unwrap();
    started.notified().await;
    assert!(handle.cancel(true));

    recorder.wait_for_done(1).await;
    assert!(matches!(
        handle.get().await.unwrap_err(),
        ExecutionError::Cancelled {
            was_running: true,
            interrupted: true,
            ..
        }
    ));
    assert_eq!(
        recorder.events(),
        vec![
            "1:submitted",
            "1:starting",
            "1:aborted:cancelled",
            "1:done:cancelled"
        ]
    );
    let stats = executor.stats();
    assert_eq!(stats.succeeded, 0);
    assert_eq!(stats.cancelled, 1);
}

#[tokio::test]
async fn test_body_ignoring_interrupt_is_abandoned_after_grace() {
    let executor = ExecutorBuilder::new()
        .config(ExecutorConfig::default().with_interrupt_grace_ms(50))
        .build()
        .unwrap();
    let recorder = Arc::new(Recorder::default());
    let started = Arc::new(Notify::new());

    let signal = Arc::clone(&started);
    let task = Task::new("wedged", move |_ctx: TaskContext| {
        let signal = Arc::clone(&signal);
        async move {
            signal.notify_one();
            std::future::pending::<()>().await;
            Ok(0u32)
        }
    })
    .with_listener(recorder.clone());

    let handle = executor.submit(task).await.unwrap();
    started.notified().await;
    assert_eq!(executor.stats().running, 1);
    assert!(handle.cancel(true));

    recorder.wait_for_done(1).await;
    assert_eq!(
        recorder.events().last().map(String::as_str),
        Some("1:done:cancelled")
    );
    assert!(handle.get().await.unwrap_err().is_cancellation());
    assert_eq!(executor.stats().running, 0);
    wait_until(|| executor.stats().active == 0).await;
}

// ============================================================================
// More listener behavior
// ============================================================================

/// Forwards to the recorder, then fails `aborted`
struct FailingAborted(Arc<Recorder>);

#[async_trait]
impl TaskListener for FailingAborted {
    async fn submitted(&self, event: &TaskEvent<'_>) -> anyhow::Result<()> {
        self.0.submitted(event).await
    }

    async fn aborted(&self, event: &TaskEvent<'_>, error: &ExecutionError) -> anyhow::Result<()> {
        self.0.aborted(event, error).await?;
        anyhow::bail!("pager offline")
    }

    async fn done(
        &self,
        event: &TaskEvent<'_>,
        error: Option<&ExecutionError>,
    ) -> anyhow::Result<()> {
        self.0.done(event, error).await
    }
}

#[tokio::test]
async fn test_aborted_failure_does_not_suppress_done() {
    let executor = ManagedExecutor::new();
    let recorder = Arc::new(Recorder::default());

    let task = Task::new("paged", |_ctx| async { Ok(()) })
        .with_listener(Arc::new(FailingAborted(recorder.clone())));
    let handle = executor
        .schedule(task, ChronoDuration::seconds(60))
        .await
        .unwrap();
    assert!(handle.cancel(false));

    recorder.wait_for_done(1).await;
    assert_eq!(
        recorder.events(),
        vec!["1:submitted", "1:aborted:cancelled", "1:done:cancelled"]
    );
    wait_until(|| executor.stats().listener_failures == 1).await;
    assert!(handle.get().await.unwrap_err().is_cancellation());
}

/// Reschedules the task once, from the first `done` it sees
#[derive(Default)]
struct RescheduleOnce {
    rescheduled: AtomicBool,
    derived: Mutex<Option<AnyHandle>>,
    done: Mutex<Vec<(HandleId, u64)>>,
}

#[async_trait]
impl TaskListener for RescheduleOnce {
    async fn done(
        &self,
        event: &TaskEvent<'_>,
        _error: Option<&ExecutionError>,
    ) -> anyhow::Result<()> {
        self.done
            .lock()
            .push((event.handle().id(), event.attempt()));
        if !self.rescheduled.swap(true, Ordering::SeqCst) {
            let derived = event.reschedule(spaced(2, 5)).await?;
            *self.derived.lock() = Some(derived);
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_reschedule_from_done_starts_independent_series() {
    let executor = ManagedExecutor::new();
    let listener = Arc::new(RescheduleOnce::default());
    let counter = Arc::new(AtomicU32::new(0));

    let task = counting_task("relay", Arc::clone(&counter)).with_listener(listener.clone());
    let original = executor.submit(task).await.unwrap();
    assert_eq!(original.get().await.unwrap(), 1);

    wait_until(|| listener.derived.lock().is_some()).await;
    let derived = listener
        .derived
        .lock()
        .clone()
        .and_then(|h| h.downcast::<u32>())
        .unwrap();
    assert_ne!(derived, original);
    assert!(derived.is_repeating());
    assert!(!original.is_repeating());

    wait_until(|| listener.done.lock().len() == 3).await;
    assert_eq!(
        *listener.done.lock(),
        vec![(original.id(), 1), (derived.id(), 1), (derived.id(), 2)]
    );
    assert!(derived.is_done());
    assert_eq!(derived.get().await.unwrap(), 3);
    assert_eq!(original.get().await.unwrap(), 1);
}

/// Shuts the executor down while its submission is in flight
struct ShutdownOnSubmit(Arc<Recorder>);

#[async_trait]
impl TaskListener for ShutdownOnSubmit {
    async fn submitted(&self, event: &TaskEvent<'_>) -> anyhow::Result<()> {
        self.0.submitted(event).await?;
        event.executor().shutdown()?;
        Ok(())
    }

    async fn aborted(&self, event: &TaskEvent<'_>, error: &ExecutionError) -> anyhow::Result<()> {
        self.0.aborted(event, error).await
    }

    async fn done(
        &self,
        event: &TaskEvent<'_>,
        error: Option<&ExecutionError>,
    ) -> anyhow::Result<()> {
        self.0.done(event, error).await
    }
}

#[tokio::test]
async fn test_shutdown_during_submitted_rejects_submission() {
    let executor = ExecutorBuilder::new()
        .config(ExecutorConfig::unmanaged())
        .build()
        .unwrap();
    let recorder = Arc::new(Recorder::default());
    let counter = Arc::new(AtomicU32::new(0));

    let task = counting_task("late", Arc::clone(&counter))
        .with_listener(Arc::new(ShutdownOnSubmit(recorder.clone())));
    let err = executor.submit(task).await.unwrap_err();

    assert!(matches!(err, ExecutionError::SubmissionRejected { .. }));
    assert_eq!(
        recorder.events(),
        vec!["1:submitted", "1:aborted:rejected", "1:done:rejected"]
    );
    assert_eq!(executor.stats().submitted, 0);
    assert!(executor.is_terminated());

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Calendar range
// ============================================================================

#[tokio::test]
async fn test_out_of_range_delay_rejects_submission() {
    let executor = ManagedExecutor::new();
    let err = executor
        .schedule(
            Task::new("far", |_ctx| async { Ok(()) }),
            ChronoDuration::days(200_000_000),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ExecutionError::SubmissionRejected { .. }));
    assert_eq!(executor.stats().submitted, 0);
}

#[tokio::test]
async fn test_out_of_range_period_ends_series_with_trigger_failure() {
    let executor = ManagedExecutor::new();
    let recorder = Arc::new(Recorder::default());

    let task = Task::new("eon", |_ctx| async { Ok(1u8) }).with_listener(recorder.clone());
    let handle = executor
        .schedule_at_fixed_rate(task, ChronoDuration::zero(), ChronoDuration::days(200_000_000))
        .await
        .unwrap();

    recorder.wait_for_done(1).await;
    assert!(handle.get().await.unwrap_err().is_trigger_failure());
    assert!(handle.is_done());
    assert_eq!(
        recorder.events(),
        vec![
            "1:submitted",
            "1:starting",
            "1:aborted:trigger-failed",
            "1:done:trigger-failed"
        ]
    );
}
