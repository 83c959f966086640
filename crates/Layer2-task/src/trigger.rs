//! Triggers - next-run computation and skip decisions
//!
//! A `Trigger` is pure policy. The `TriggerEngine` owns the execution
//! history of one series and feeds it back into every decision.
//!
//! Built-in triggers:
//! - `FixedRate` - runs are spaced from their scheduled starts
//! - `FixedDelay` - runs are spaced from the previous run's end

use crate::error::{panic_message, Cause};
use chrono::{DateTime, Duration, Utc};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

// ============================================================================
// LastExecution
// ============================================================================

/// How a recorded attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Skipped,
}

/// Record of one attempt, fed back into trigger decisions
#[derive(Clone)]
pub struct LastExecution {
    identity_name: String,
    attempt: u64,
    status: ExecutionStatus,
    scheduled_start: DateTime<Utc>,
    run_start: Option<DateTime<Utc>>,
    run_end: Option<DateTime<Utc>>,
    result: Option<Arc<dyn Any + Send + Sync>>,
}

impl LastExecution {
    pub fn completed<T: Send + Sync + 'static>(
        identity_name: impl Into<String>,
        attempt: u64,
        scheduled_start: DateTime<Utc>,
        run_start: DateTime<Utc>,
        run_end: DateTime<Utc>,
        result: T,
    ) -> Self {
        Self {
            identity_name: identity_name.into(),
            attempt,
            status: ExecutionStatus::Completed,
            scheduled_start,
            run_start: Some(run_start),
            run_end: Some(run_end),
            result: Some(Arc::new(result)),
        }
    }

    pub fn failed(
        identity_name: impl Into<String>,
        attempt: u64,
        scheduled_start: DateTime<Utc>,
        run_start: DateTime<Utc>,
        run_end: DateTime<Utc>,
    ) -> Self {
        Self {
            identity_name: identity_name.into(),
            attempt,
            status: ExecutionStatus::Failed,
            scheduled_start,
            run_start: Some(run_start),
            run_end: Some(run_end),
            result: None,
        }
    }

    pub fn skipped(
        identity_name: impl Into<String>,
        attempt: u64,
        scheduled_start: DateTime<Utc>,
    ) -> Self {
        Self {
            identity_name: identity_name.into(),
            attempt,
            status: ExecutionStatus::Skipped,
            scheduled_start,
            run_start: None,
            run_end: None,
            result: None,
        }
    }

    pub fn identity_name(&self) -> &str {
        &self.identity_name
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn scheduled_start(&self) -> DateTime<Utc> {
        self.scheduled_start
    }

    pub fn run_start(&self) -> Option<DateTime<Utc>> {
        self.run_start
    }

    pub fn run_end(&self) -> Option<DateTime<Utc>> {
        self.run_end
    }

    /// Result of a completed attempt, if it has type `R`
    pub fn result<R: 'static>(&self) -> Option<&R> {
        self.result.as_deref().and_then(|r| r.downcast_ref::<R>())
    }

    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }
}

impl fmt::Debug for LastExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LastExecution")
            .field("identity_name", &self.identity_name)
            .field("attempt", &self.attempt)
            .field("status", &self.status)
            .field("scheduled_start", &self.scheduled_start)
            .field("run_start", &self.run_start)
            .field("run_end", &self.run_end)
            .field("has_result", &self.result.is_some())
            .finish()
    }
}

/// Bounded history of a series
#[derive(Debug, Clone)]
pub struct ExecutionHistory {
    records: VecDeque<LastExecution>,
    limit: usize,
    attempts: u64,
}

impl ExecutionHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            records: VecDeque::new(),
            limit: limit.max(1),
            attempts: 0,
        }
    }

    pub fn push(&mut self, record: LastExecution) {
        if self.records.len() == self.limit {
            self.records.pop_front();
        }
        self.records.push_back(record);
        self.attempts += 1;
    }

    pub fn last(&self) -> Option<&LastExecution> {
        self.records.back()
    }

    /// Total attempts recorded, including ones dropped from the window
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Attempts that ran the body
    pub fn runs(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status != ExecutionStatus::Skipped)
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LastExecution> {
        self.records.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ============================================================================
// Trigger
// ============================================================================

/// Scheduling policy of a repeating series
pub trait Trigger: Send + Sync {
    /// Next run time, or `None` when the series should end.
    /// `scheduled_at` is when the series was submitted.
    fn next_run_time(
        &self,
        history: &ExecutionHistory,
        scheduled_at: DateTime<Utc>,
    ) -> anyhow::Result<Option<DateTime<Utc>>>;

    /// Whether the run due at `scheduled_for` should be skipped
    fn skip_run(
        &self,
        _last: Option<&LastExecution>,
        _scheduled_for: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// `base + by`, failing instead of overflowing the calendar
fn offset(base: DateTime<Utc>, by: Duration) -> anyhow::Result<DateTime<Utc>> {
    base.checked_add_signed(by)
        .ok_or_else(|| anyhow::anyhow!("{} + {}s is out of range", base, by.num_seconds()))
}

fn clamp_non_negative(delay: Duration) -> Duration {
    if delay < Duration::zero() {
        Duration::zero()
    } else {
        delay
    }
}

/// Runs spaced by `period` from each run's scheduled start
#[derive(Debug, Clone, Copy)]
pub struct FixedRate {
    initial_delay: Duration,
    period: Duration,
}

impl FixedRate {
    pub fn new(initial_delay: Duration, period: Duration) -> Self {
        Self {
            initial_delay: clamp_non_negative(initial_delay),
            period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Trigger for FixedRate {
    fn next_run_time(
        &self,
        history: &ExecutionHistory,
        scheduled_at: DateTime<Utc>,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(match history.last() {
            None => Some(offset(scheduled_at, self.initial_delay)?),
            Some(last) if last.status() == ExecutionStatus::Failed => None,
            Some(last) => Some(offset(last.scheduled_start(), self.period)?),
        })
    }
}

/// Runs spaced by `period` from the end of the previous run
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay {
    initial_delay: Duration,
    period: Duration,
}

impl FixedDelay {
    pub fn new(initial_delay: Duration, period: Duration) -> Self {
        Self {
            initial_delay: clamp_non_negative(initial_delay),
            period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Trigger for FixedDelay {
    fn next_run_time(
        &self,
        history: &ExecutionHistory,
        scheduled_at: DateTime<Utc>,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(match history.last() {
            None => Some(offset(scheduled_at, self.initial_delay)?),
            Some(last) if last.status() == ExecutionStatus::Failed => None,
            Some(last) => {
                let base = last.run_end().unwrap_or_else(Utc::now);
                Some(offset(base, self.period)?)
            }
        })
    }
}

// ============================================================================
// TriggerEngine
// ============================================================================

/// Result of consulting `skip_run`
#[derive(Debug, Clone)]
pub enum SkipDecision {
    Run,
    Skip(Option<Cause>),
}

/// Trigger plus the history of one series
pub struct TriggerEngine {
    trigger: Arc<dyn Trigger>,
    history: ExecutionHistory,
    scheduled_at: DateTime<Utc>,
}

impl TriggerEngine {
    pub fn new(trigger: Arc<dyn Trigger>, history_limit: usize, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            trigger,
            history: ExecutionHistory::new(history_limit),
            scheduled_at,
        }
    }

    pub fn trigger(&self) -> &Arc<dyn Trigger> {
        &self.trigger
    }

    pub fn history(&self) -> &ExecutionHistory {
        &self.history
    }

    pub fn scheduled_at(&self) -> DateTime<Utc> {
        self.scheduled_at
    }

    /// Next run time given the recorded history
    pub fn next_run(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        let trigger = &self.trigger;
        let history = &self.history;
        let scheduled_at = self.scheduled_at;
        guarded(|| trigger.next_run_time(history, scheduled_at))?
    }

    /// Ask the trigger whether the run due at `scheduled_for` is skipped.
    /// A failing `skip_run` skips the run with the failure as its cause.
    pub fn skip_decision(&self, scheduled_for: DateTime<Utc>) -> SkipDecision {
        let trigger = &self.trigger;
        let last = self.history.last();
        match guarded(|| trigger.skip_run(last, scheduled_for)) {
            Ok(Ok(false)) => SkipDecision::Run,
            Ok(Ok(true)) => SkipDecision::Skip(None),
            Ok(Err(e)) | Err(e) => SkipDecision::Skip(Some(Cause::new(e))),
        }
    }

    pub fn record(&mut self, execution: LastExecution) {
        self.history.push(execution);
    }
}

/// Run a trigger callback, turning a panic into an error
fn guarded<R>(f: impl FnOnce() -> R) -> anyhow::Result<R> {
    catch_unwind(AssertUnwindSafe(f))
        .map_err(|panic| anyhow::anyhow!("trigger panicked: {}", panic_message(panic.as_ref())))
}
