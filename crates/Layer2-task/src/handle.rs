//! Task handles - future-like views over an attempt or a series
//!
//! One `TaskHandle` spans every attempt of a series. Cancellation and
//! completion race through the same short critical section on the handle's
//! state, so exactly one of them latches the outcome.

use crate::error::{ExecutionError, Result};
use crate::result_store::{Completion, Outcome, ResultStore};
use crate::state::{AttemptPhase, TaskState};
use crate::task::TaskInfo;
use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Handle identifier, allocated in submission order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(pub u64);

impl HandleId {
    pub(crate) fn next() -> Self {
        Self(NEXT_HANDLE_ID.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

// ============================================================================
// Shared state
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub(crate) struct CancelRecord {
    pub was_running: bool,
    pub interrupted: bool,
}

pub(crate) struct CoreState {
    pub attempt: u64,
    pub phase: AttemptPhase,
    pub next_run: DateTime<Utc>,
    pub cancel: Option<CancelRecord>,
    pub finished: bool,
    pub interrupt: CancellationToken,
}

/// Result of trying to latch an attempt outcome
pub(crate) enum Latch {
    Won,
    Cancelled(CancelRecord),
}

pub(crate) struct Shared<T> {
    pub id: HandleId,
    pub info: Arc<TaskInfo>,
    pub repeating: bool,
    pub state: Mutex<CoreState>,
    pub wake: Notify,
    pub results: ResultStore<T>,
}

impl<T> Shared<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(info: Arc<TaskInfo>, repeating: bool, first_run: DateTime<Utc>) -> Self {
        Self {
            id: HandleId::next(),
            info,
            repeating,
            state: Mutex::new(CoreState {
                attempt: 1,
                phase: AttemptPhase::Created,
                next_run: first_run,
                cancel: None,
                finished: false,
                interrupt: CancellationToken::new(),
            }),
            wake: Notify::new(),
            results: ResultStore::new(),
        }
    }

    pub fn cancel_error(&self, record: CancelRecord) -> ExecutionError {
        ExecutionError::cancelled(&self.info.name, record.was_running, record.interrupted)
    }

    /// Latch cancellation if the handle is not terminal yet
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        let mut state = self.state.lock();
        if state.finished || state.cancel.is_some() {
            return false;
        }

        let was_running = match state.phase {
            AttemptPhase::Created
            | AttemptPhase::Submitted
            | AttemptPhase::Queued
            | AttemptPhase::Starting => false,
            AttemptPhase::Running => true,
            // outcome of the current attempt is already decided
            AttemptPhase::Finishing | AttemptPhase::Completed(_) if !self.repeating => {
                return false
            }
            AttemptPhase::Finishing | AttemptPhase::Completed(_) => false,
        };
        let interrupted = was_running && may_interrupt;
        let record = CancelRecord {
            was_running,
            interrupted,
        };

        state.cancel = Some(record);
        state.finished = true;
        if interrupted {
            state.interrupt.cancel();
        }
        self.results
            .publish(state.attempt, Err(self.cancel_error(record)));
        let attempt = state.attempt;
        drop(state);

        self.wake.notify_one();
        debug!(
            "Cancelled {} {} at attempt {} (running: {}, interrupted: {})",
            self.info, self.id, attempt, was_running, interrupted
        );
        true
    }

    /// Move the current attempt to `phase` unless a cancel was latched
    pub fn enter(&self, phase: AttemptPhase) -> std::result::Result<(), CancelRecord> {
        let mut state = self.state.lock();
        if let Some(record) = state.cancel {
            return Err(record);
        }
        state.phase = phase;
        Ok(())
    }

    pub fn cancelled(&self) -> Option<CancelRecord> {
        self.state.lock().cancel
    }

    /// Latch the current attempt's outcome unless cancellation won first
    pub fn latch(
        &self,
        outcome: Outcome<T>,
        state_after: TaskState,
        next_run: Option<DateTime<Utc>>,
    ) -> Latch {
        let mut state = self.state.lock();
        if let Some(record) = state.cancel {
            return Latch::Cancelled(record);
        }
        state.phase = AttemptPhase::Completed(state_after);
        match next_run {
            Some(at) => state.next_run = at,
            None => state.finished = true,
        }
        self.results.publish(state.attempt, outcome);
        Latch::Won
    }

    /// Allocate the next attempt of the series
    pub fn begin_attempt(&self) -> Option<(u64, DateTime<Utc>, CancellationToken)> {
        let mut state = self.state.lock();
        if state.finished || state.cancel.is_some() {
            return None;
        }
        state.attempt += 1;
        state.phase = AttemptPhase::Submitted;
        state.interrupt = CancellationToken::new();
        Some((state.attempt, state.next_run, state.interrupt.clone()))
    }

    pub fn current_attempt(&self) -> (u64, DateTime<Utc>, CancellationToken) {
        let state = self.state.lock();
        (state.attempt, state.next_run, state.interrupt.clone())
    }

    fn task_state(&self) -> TaskState {
        let state = self.state.lock();
        if state.cancel.is_some() {
            TaskState::Cancelled
        } else if state.finished {
            TaskState::Done
        } else {
            state.phase.as_task_state()
        }
    }

    fn is_done(&self) -> bool {
        self.state.lock().finished
    }

    fn attempt(&self) -> u64 {
        self.state.lock().attempt
    }

    fn next_run_time(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock();
        (!state.finished).then_some(state.next_run)
    }

    fn delay(&self) -> Duration {
        let state = self.state.lock();
        if state.finished {
            return Duration::zero();
        }
        state.next_run - Utc::now()
    }

    /// Ordering key; stays fixed once the handle is terminal
    fn schedule_key(&self) -> (DateTime<Utc>, HandleId) {
        (self.state.lock().next_run, self.id)
    }
}

// ============================================================================
// TaskHandle
// ============================================================================

/// Handle over a submitted task or repeating series
pub struct TaskHandle<T> {
    inner: Arc<Shared<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> TaskHandle<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn from_shared(inner: Arc<Shared<T>>) -> Self {
        Self { inner }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared<T>> {
        &self.inner
    }

    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    pub fn task(&self) -> &TaskInfo {
        &self.inner.info
    }

    /// Current attempt number (1-based)
    pub fn attempt(&self) -> u64 {
        self.inner.attempt()
    }

    pub fn state(&self) -> TaskState {
        self.inner.task_state()
    }

    pub fn is_repeating(&self) -> bool {
        self.inner.repeating
    }

    /// No further attempts will run
    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled().is_some()
    }

    /// Cancel the pending or running attempt; `false` once terminal
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        self.inner.cancel(may_interrupt)
    }

    /// Outcome of the most recently completed attempt, waiting for the first
    pub async fn get(&self) -> Outcome<T> {
        self.inner.results.wait().await
    }

    /// `get()` bounded by a relative timeout
    pub async fn get_timeout(&self, timeout: std::time::Duration) -> Outcome<T> {
        tokio::time::timeout(timeout, self.inner.results.wait())
            .await
            .map_err(|_| ExecutionError::Timeout(timeout))?
    }

    /// Wait until attempt `attempt` (or a later one) has completed
    pub async fn wait_for_attempt(&self, attempt: u64) -> Result<Completion<T>> {
        self.inner.results.wait_for_attempt(attempt).await
    }

    /// Latest completion without waiting
    pub fn last_result(&self) -> Option<Completion<T>> {
        self.inner.results.latest()
    }

    /// Scheduled start of the pending attempt; `None` once done
    pub fn next_run_time(&self) -> Option<DateTime<Utc>> {
        self.inner.next_run_time()
    }

    /// Time until the next run; never positive once done
    pub fn delay(&self) -> Duration {
        self.inner.delay()
    }

    /// Type-erased view of this handle
    pub fn erase(&self) -> AnyHandle {
        AnyHandle::new(Arc::clone(&self.inner))
    }
}

impl<T> PartialEq for TaskHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl<T> Eq for TaskHandle<T> {}

impl<T> PartialOrd for TaskHandle<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for TaskHandle<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn cmp(&self, other: &Self) -> Ordering {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return Ordering::Equal;
        }
        self.inner.schedule_key().cmp(&other.inner.schedule_key())
    }
}

impl<T> fmt::Debug for TaskHandle<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.inner.id)
            .field("task", &self.inner.info.name)
            .field("state", &self.state())
            .finish()
    }
}

impl<T> fmt::Display for TaskHandle<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.state(), self.inner.info, self.inner.id)
    }
}

// ============================================================================
// AnyHandle
// ============================================================================

trait ErasedHandle: Send + Sync {
    fn id(&self) -> HandleId;
    fn info(&self) -> &TaskInfo;
    fn attempt(&self) -> u64;
    fn state(&self) -> TaskState;
    fn is_done(&self) -> bool;
    fn is_cancelled(&self) -> bool;
    fn cancel(&self, may_interrupt: bool) -> bool;
    fn next_run_time(&self) -> Option<DateTime<Utc>>;
    fn delay(&self) -> Duration;
    fn schedule_key(&self) -> (DateTime<Utc>, HandleId);
    fn wait(&self) -> BoxFuture<'_, Result<()>>;
}

impl<T> ErasedHandle for Shared<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> HandleId {
        self.id
    }

    fn info(&self) -> &TaskInfo {
        &self.info
    }

    fn attempt(&self) -> u64 {
        Shared::attempt(self)
    }

    fn state(&self) -> TaskState {
        self.task_state()
    }

    fn is_done(&self) -> bool {
        Shared::is_done(self)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled().is_some()
    }

    fn cancel(&self, may_interrupt: bool) -> bool {
        Shared::cancel(self, may_interrupt)
    }

    fn next_run_time(&self) -> Option<DateTime<Utc>> {
        Shared::next_run_time(self)
    }

    fn delay(&self) -> Duration {
        Shared::delay(self)
    }

    fn schedule_key(&self) -> (DateTime<Utc>, HandleId) {
        Shared::schedule_key(self)
    }

    fn wait(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.results.wait().await.map(|_| ()) })
    }
}

/// Type-erased handle handed to listeners
#[derive(Clone)]
pub struct AnyHandle {
    inner: Arc<dyn ErasedHandle>,
    typed: Arc<dyn Any + Send + Sync>,
}

impl AnyHandle {
    fn new<T>(shared: Arc<Shared<T>>) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        let typed: Arc<dyn Any + Send + Sync> = shared.clone();
        Self {
            inner: shared,
            typed,
        }
    }

    /// Recover the typed handle
    pub fn downcast<T>(&self) -> Option<TaskHandle<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        Arc::clone(&self.typed)
            .downcast::<Shared<T>>()
            .ok()
            .map(TaskHandle::from_shared)
    }

    pub fn id(&self) -> HandleId {
        self.inner.id()
    }

    pub fn task(&self) -> &TaskInfo {
        self.inner.info()
    }

    pub fn attempt(&self) -> u64 {
        self.inner.attempt()
    }

    pub fn state(&self) -> TaskState {
        self.inner.state()
    }

    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    pub fn cancel(&self, may_interrupt: bool) -> bool {
        self.inner.cancel(may_interrupt)
    }

    pub fn next_run_time(&self) -> Option<DateTime<Utc>> {
        self.inner.next_run_time()
    }

    pub fn delay(&self) -> Duration {
        self.inner.delay()
    }

    /// Wait for the latest outcome, discarding the value
    pub async fn wait(&self) -> Result<()> {
        self.inner.wait().await
    }
}

impl PartialEq for AnyHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for AnyHandle {}

impl PartialOrd for AnyHandle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AnyHandle {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.id() == other.id() {
            return Ordering::Equal;
        }
        self.inner.schedule_key().cmp(&other.inner.schedule_key())
    }
}

impl fmt::Debug for AnyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyHandle")
            .field("id", &self.id())
            .field("task", &self.task().name)
            .field("state", &self.state())
            .finish()
    }
}
