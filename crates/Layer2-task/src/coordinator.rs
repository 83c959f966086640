//! Execution coordinator - drives the attempts of one series
//!
//! Per attempt:
//!
//! ```text
//! CREATED → SUBMITTED → QUEUED → STARTING → RUNNING → {SUCCEEDED, FAILED}
//!              │           │         │          │
//!              └───────────┴─────────┴──────────┴──▶ CANCELLED / ABORTED(reason)
//! ```
//!
//! `submitted` is dispatched inside the submitting call. Waiting for the
//! scheduled time happens on a driver task; only the starting/body phase
//! occupies the worker pool. The outcome is latched before `done` fires, and
//! `done(N)` always precedes `submitted(N + 1)`.

use crate::error::{panic_message, Cause, ExecutionError, Result};
use crate::executor::{Counters, ManagedExecutor};
use crate::handle::{AnyHandle, CancelRecord, Latch, Shared, TaskHandle};
use crate::listener::{EventSource, ListenerDispatcher, Resubmitter};
use crate::result_store::Outcome;
use crate::state::{AbortReason, AttemptPhase, TaskState};
use crate::task::{Task, TaskBody, TaskContext};
use crate::trigger::{LastExecution, SkipDecision, Trigger, TriggerEngine};
use cadence_foundation::{ContextSnapshot, WithContext};
use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a submission is scheduled
pub(crate) enum Plan {
    /// Single run after a delay
    Once(Duration),

    /// Repeating series governed by a trigger
    Trigger(Arc<dyn Trigger>),
}

impl Plan {
    pub fn once(delay: Duration) -> Self {
        Plan::Once(delay.max(Duration::zero()))
    }
}

/// Validate, create the handle, dispatch `submitted` and start the driver.
///
/// Returns a boxed future so that listeners can submit derived handles
/// from inside their callbacks.
pub(crate) fn submit<T>(
    executor: ManagedExecutor,
    task: Task<T>,
    plan: Plan,
) -> BoxFuture<'static, Result<TaskHandle<T>>>
where
    T: Clone + Send + Sync + 'static,
{
    Box::pin(async move {
        let name = task.name().to_string();
        task.info()
            .validate()
            .map_err(|reason| ExecutionError::rejected(&name, reason))?;
        if executor.is_shutdown() {
            return Err(ExecutionError::rejected(
                &name,
                format!("executor '{}' is shut down", executor.name()),
            ));
        }

        let submitted_at = Utc::now();
        let (first_run, engine) = match plan {
            Plan::Once(delay) => match submitted_at.checked_add_signed(delay) {
                Some(at) => (at, None),
                None => {
                    return Err(ExecutionError::rejected(
                        &name,
                        format!("delay of {}s is out of range", delay.num_seconds()),
                    ))
                }
            },
            Plan::Trigger(trigger) => {
                let engine =
                    TriggerEngine::new(trigger, executor.config().history_limit, submitted_at);
                let first = {
                    let _suspended = executor.context().suspend_transaction();
                    engine.next_run()
                };
                match first {
                    Ok(Some(at)) => (at, Some(engine)),
                    Ok(None) => {
                        return Err(ExecutionError::rejected(
                            &name,
                            "trigger declined the first run",
                        ))
                    }
                    Err(e) => {
                        return Err(ExecutionError::rejected_by(
                            &name,
                            "trigger failed to compute the first run",
                            Cause::new(e),
                        ))
                    }
                }
            }
        };

        let info = Arc::new(task.info().clone());
        let shared = Arc::new(Shared::new(Arc::clone(&info), engine.is_some(), first_run));
        let handle = TaskHandle::from_shared(Arc::clone(&shared));

        let context = Arc::clone(executor.context());
        let snapshot = context.capture();
        // listeners keep the context they were registered with, if any
        let listener_snapshot = task
            .listener_context()
            .cloned()
            .unwrap_or_else(|| Arc::clone(&snapshot));
        let dispatcher = ListenerDispatcher::new(
            task.listener().cloned(),
            context,
            listener_snapshot,
            executor.config().listener_failure_log,
        );
        let series = Series {
            body: Arc::clone(task.body()),
            shared,
            engine,
            dispatcher,
            source: EventSource {
                handle: handle.erase(),
                executor: executor.clone(),
                info,
                resubmitter: resubmitter(&task),
            },
            snapshot,
        };

        if let Err(record) = series.shared.enter(AttemptPhase::Submitted) {
            debug!("{} cancelled before submission: {:?}", handle.id(), record);
        }
        if let Err(error) = series.dispatcher.submitted(&series.source.event(1)).await {
            info!("Submission of {} rejected: {}", series.source.info, error);
            series.abort(1, error.clone(), AbortReason::SubmitFailed).await;
            return Err(error);
        }

        if let Err(error) = executor.register(series.source.handle.clone()) {
            info!("Submission of {} rejected: {}", series.source.info, error);
            series.abort(1, error.clone(), AbortReason::SubmitFailed).await;
            return Err(error);
        }
        info!(
            "Submitted {} as {} (first run at {})",
            series.source.info,
            handle.id(),
            first_run
        );
        tokio::spawn(series.drive());
        Ok(handle)
    })
}

fn resubmitter<T>(task: &Task<T>) -> Resubmitter
where
    T: Clone + Send + Sync + 'static,
{
    let task = task.clone();
    Arc::new(
        move |executor: ManagedExecutor,
              trigger: Option<Arc<dyn Trigger>>|
              -> BoxFuture<'static, Result<AnyHandle>> {
            let plan = match trigger {
                Some(trigger) => Plan::Trigger(trigger),
                None => Plan::once(Duration::zero()),
            };
            let submission = submit(executor, task.clone(), plan);
            Box::pin(async move { submission.await.map(|handle| handle.erase()) })
        },
    )
}

/// Resolves `grace` after the attempt was interrupted
async fn overdue(interrupt: &CancellationToken, grace: std::time::Duration) {
    interrupt.cancelled().await;
    tokio::time::sleep(grace).await;
}

/// What the worker reports back for one attempt
enum RunReport<T> {
    /// Cancelled before the body was entered, or abandoned after ignoring
    /// its interrupt
    Cancelled(CancelRecord),

    /// The `starting` listener failed
    StartFailed(ExecutionError),

    Ran {
        started: DateTime<Utc>,
        ended: DateTime<Utc>,
        outcome: anyhow::Result<T>,
    },
}

/// One submitted task and everything its attempts need
struct Series<T> {
    body: Arc<dyn TaskBody<T>>,
    shared: Arc<Shared<T>>,
    engine: Option<TriggerEngine>,
    dispatcher: ListenerDispatcher,
    source: EventSource,
    snapshot: Arc<dyn ContextSnapshot>,
}

impl<T> Series<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn counters(&self) -> &Counters {
        self.source.executor.counters()
    }

    async fn drive(mut self) {
        loop {
            let (attempt, scheduled_for, interrupt) = self.shared.current_attempt();
            if !self.run_attempt(attempt, scheduled_for, interrupt).await {
                break;
            }
            if !self.advance().await {
                break;
            }
        }

        let handle = &self.source.handle;
        info!(
            "Series {} {} finished after {} attempt(s): {}",
            self.source.info,
            handle.id(),
            handle.attempt(),
            handle.state()
        );
        self.source.executor.unregister(handle.id());
    }

    /// Run one attempt to its `done`; `true` if another run is due
    async fn run_attempt(
        &mut self,
        attempt: u64,
        scheduled_for: DateTime<Utc>,
        interrupt: CancellationToken,
    ) -> bool {
        if let Err(record) = self.wait_until(scheduled_for).await {
            self.finish_cancelled(attempt, record, None).await;
            return false;
        }

        if let Some(engine) = &self.engine {
            let decision = {
                let _suspended = self.source.executor.context().suspend_transaction();
                engine.skip_decision(scheduled_for)
            };
            if let SkipDecision::Skip(cause) = decision {
                return self.skip(attempt, scheduled_for, cause).await;
            }
        }

        if let Err(record) = self.shared.enter(AttemptPhase::Queued) {
            self.finish_cancelled(attempt, record, None).await;
            return false;
        }

        match self.execute(attempt, scheduled_for, interrupt).await {
            RunReport::Cancelled(record) => {
                self.finish_cancelled(attempt, record, None).await;
                false
            }
            RunReport::StartFailed(error) => {
                self.abort(attempt, error, AbortReason::StartFailed).await;
                false
            }
            RunReport::Ran {
                started,
                ended,
                outcome,
            } => {
                self.complete(attempt, scheduled_for, started, ended, outcome)
                    .await
            }
        }
    }

    /// Sleep until `at`, waking early on cancellation
    async fn wait_until(&self, at: DateTime<Utc>) -> std::result::Result<(), CancelRecord> {
        loop {
            if let Some(record) = self.shared.cancelled() {
                return Err(record);
            }
            let Ok(remaining) = (at - Utc::now()).to_std() else {
                return Ok(());
            };
            if remaining.is_zero() {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = self.shared.wake.notified() => {}
            }
        }
    }

    /// Hand the starting/body phase to the worker pool and wait for its report
    async fn execute(
        &self,
        attempt: u64,
        scheduled_for: DateTime<Utc>,
        interrupt: CancellationToken,
    ) -> RunReport<T> {
        let shared = Arc::clone(&self.shared);
        let dispatcher = self.dispatcher.clone();
        let source = self.source.clone();
        let body = Arc::clone(&self.body);
        let snapshot = Arc::clone(&self.snapshot);
        let watched = interrupt.clone();

        let unit = async move {
            if let Err(record) = shared.enter(AttemptPhase::Starting) {
                return RunReport::Cancelled(record);
            }
            if let Err(error) = dispatcher.starting(&source.event(attempt)).await {
                return RunReport::StartFailed(error);
            }
            // a cancel may have raced in while `starting` ran
            if let Err(record) = shared.enter(AttemptPhase::Running) {
                return RunReport::Cancelled(record);
            }

            let running = source.executor.counters().enter_running();
            debug!("Running {} attempt {}", source.info, attempt);

            let ctx = TaskContext::new(
                Arc::clone(&source.info),
                shared.id,
                attempt,
                scheduled_for,
                interrupt,
            );
            let started = Utc::now();
            let result = AssertUnwindSafe(body.call(ctx).with_context(snapshot))
                .catch_unwind()
                .await;
            let ended = Utc::now();
            drop(running);

            if shared.enter(AttemptPhase::Finishing).is_err() {
                debug!("{} attempt {} was cancelled while running", source.info, attempt);
            }
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(panic) => Err(anyhow::anyhow!(
                    "task panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };
            RunReport::Ran {
                started,
                ended,
                outcome,
            }
        };

        let (tx, mut rx) = oneshot::channel();
        let worker = self.source.executor.pool().submit(Box::pin(async move {
            let _ = tx.send(unit.await);
        }));

        let grace = self.source.executor.config().interrupt_grace();
        let reported = tokio::select! {
            received = &mut rx => Some(received),
            _ = overdue(&watched, grace) => None,
        };
        let received = match reported {
            Some(received) => received,
            None => {
                warn!(
                    "{} attempt {} ignored its interrupt for {:?}, aborting worker unit",
                    self.source.info, attempt, grace
                );
                worker.abort();
                rx.await
            }
        };

        match received {
            Ok(report) => report,
            Err(_) => {
                let joined = worker.join().await;
                if let Some(record) = self.shared.cancelled() {
                    return RunReport::Cancelled(record);
                }
                let now = Utc::now();
                RunReport::Ran {
                    started: now,
                    ended: now,
                    outcome: Err(anyhow::anyhow!(
                        "worker dropped the attempt before reporting (joined: {})",
                        joined
                    )),
                }
            }
        }
    }

    /// Latch the body's outcome and consult the trigger for the next run
    async fn complete(
        &mut self,
        attempt: u64,
        scheduled_for: DateTime<Utc>,
        started: DateTime<Utc>,
        ended: DateTime<Utc>,
        outcome: anyhow::Result<T>,
    ) -> bool {
        let name = self.source.info.name.clone();
        let outcome: Outcome<T> = outcome.map_err(|e| ExecutionError::Failed {
            task: name.clone(),
            cause: Cause::new(e),
        });
        let body_error = outcome.as_ref().err().cloned();

        if let Some(record) = self.shared.cancelled() {
            if outcome.is_ok() {
                warn!(
                    "Discarding result of {} attempt {}: cancelled while running",
                    self.source.info, attempt
                );
            }
            self.finish_cancelled(attempt, record, body_error).await;
            return false;
        }

        let next = if self.engine.is_some() {
            let record = match &outcome {
                Ok(value) => LastExecution::completed(
                    &name,
                    attempt,
                    scheduled_for,
                    started,
                    ended,
                    value.clone(),
                ),
                Err(_) => LastExecution::failed(&name, attempt, scheduled_for, started, ended),
            };
            self.consult_trigger(record)
        } else {
            Ok(None)
        };

        let (latched, state, abort, next) = match (outcome, next) {
            (Ok(value), Ok(next)) => (Ok(value), TaskState::Succeeded, None, next),
            (Ok(_), Err(e)) => {
                let error = self.trigger_failed(e);
                (
                    Err(error.clone()),
                    TaskState::Aborted(AbortReason::TriggerFailed),
                    Some(error),
                    None,
                )
            }
            (Err(error), Ok(next)) => (Err(error), TaskState::Failed, None, next),
            (Err(error), Err(e)) => {
                warn!(
                    "Trigger for {} failed after a failed attempt: {:#}",
                    self.source.info, e
                );
                (Err(error), TaskState::Failed, None, None)
            }
        };
        let done_error = latched.as_ref().err().cloned();

        match self.shared.latch(latched, state, next) {
            Latch::Won => {
                let counters = self.counters();
                match state {
                    TaskState::Succeeded => Counters::bump(&counters.succeeded),
                    TaskState::Failed => Counters::bump(&counters.failed),
                    _ => Counters::bump(&counters.aborted),
                }
                debug!(
                    "{} attempt {} latched {} (next run: {:?})",
                    self.source.info, attempt, state, next
                );

                let event = self.source.event(attempt);
                if let Some(error) = &abort {
                    self.dispatcher.aborted(&event, error).await;
                }
                self.dispatcher.done(&event, done_error.as_ref()).await;
                next.is_some()
            }
            Latch::Cancelled(record) => {
                self.finish_cancelled(attempt, record, body_error).await;
                false
            }
        }
    }

    /// The trigger skipped this run; record it and keep the series going
    async fn skip(
        &mut self,
        attempt: u64,
        scheduled_for: DateTime<Utc>,
        cause: Option<Cause>,
    ) -> bool {
        let name = self.source.info.name.clone();
        let error = ExecutionError::skipped(&name, cause);
        Counters::bump(&self.counters().skipped);
        debug!("{} attempt {} skipped by trigger", self.source.info, attempt);

        let (latched, next) =
            match self.consult_trigger(LastExecution::skipped(&name, attempt, scheduled_for)) {
                Ok(next) => (error.clone(), next),
                Err(e) => (self.trigger_failed(e), None),
            };

        let state = TaskState::Aborted(AbortReason::Skipped);
        let (done_error, continues) = match self.shared.latch(Err(latched.clone()), state, next) {
            Latch::Won => (latched, next.is_some()),
            Latch::Cancelled(record) => (self.shared.cancel_error(record), false),
        };

        let event = self.source.event(attempt);
        self.dispatcher.aborted(&event, &error).await;
        self.dispatcher.done(&event, Some(&done_error)).await;
        continues
    }

    /// Latch a scheduler-side failure and fire `aborted` then `done`
    async fn abort(&self, attempt: u64, error: ExecutionError, reason: AbortReason) {
        let done_error = match self
            .shared
            .latch(Err(error.clone()), TaskState::Aborted(reason), None)
        {
            Latch::Won => error.clone(),
            Latch::Cancelled(record) => self.shared.cancel_error(record),
        };
        Counters::bump(&self.counters().aborted);
        warn!("{} attempt {} aborted: {}", self.source.info, attempt, error);

        let event = self.source.event(attempt);
        self.dispatcher.aborted(&event, &error).await;
        self.dispatcher.done(&event, Some(&done_error)).await;
    }

    /// Notify a cancelled attempt; `done` reports the body's own error if it
    /// ended with one
    async fn finish_cancelled(
        &self,
        attempt: u64,
        record: CancelRecord,
        body_error: Option<ExecutionError>,
    ) {
        let cancelled = self.shared.cancel_error(record);
        Counters::bump(&self.counters().cancelled);
        debug!("{} attempt {}: {}", self.source.info, attempt, cancelled);

        let event = self.source.event(attempt);
        self.dispatcher.aborted(&event, &cancelled).await;
        let done_error = body_error.unwrap_or_else(|| cancelled.clone());
        self.dispatcher.done(&event, Some(&done_error)).await;
    }

    /// Allocate the next attempt and dispatch its `submitted`
    async fn advance(&self) -> bool {
        let Some((attempt, next_run, _)) = self.shared.begin_attempt() else {
            debug!("{} cancelled between attempts", self.source.info);
            return false;
        };
        debug!(
            "{} attempt {} scheduled for {}",
            self.source.info, attempt, next_run
        );

        match self.dispatcher.submitted(&self.source.event(attempt)).await {
            Ok(()) => true,
            Err(error) => {
                self.abort(attempt, error, AbortReason::SubmitFailed).await;
                false
            }
        }
    }

    /// Record `execution` and ask the trigger for the next run
    fn consult_trigger(
        &mut self,
        execution: LastExecution,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        let Some(engine) = &mut self.engine else {
            return Ok(None);
        };
        engine.record(execution);

        let _suspended = self.source.executor.context().suspend_transaction();
        let next = engine.next_run();
        debug!("Trigger for {} decided {:?}", self.source.info, next);
        next
    }

    fn trigger_failed(&self, cause: anyhow::Error) -> ExecutionError {
        ExecutionError::TriggerFailed {
            task: self.source.info.name.clone(),
            cause: Cause::new(cause),
        }
    }
}
