//! Lifecycle listeners
//!
//! Per attempt the callbacks fire in the order
//! `submitted -> starting? -> aborted? -> done`, with `done` exactly once.
//!
//! Every callback runs with the submitter's transaction suspended and the
//! listener's registration context applied, re-entered on every poll.
//! Listeners attached without their own snapshot use the context captured
//! at submission. Failures from `submitted` and
//! `starting` change the attempt's outcome; failures from `aborted` and
//! `done` are logged and counted, never surfaced.

use crate::error::{panic_message, Cause, ExecutionError, Result};
use crate::executor::ManagedExecutor;
use crate::handle::AnyHandle;
use crate::task::TaskInfo;
use crate::trigger::Trigger;
use async_trait::async_trait;
use cadence_foundation::{ContextProvider, ContextSnapshot, ListenerFailureLog, WithContext};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

/// Observer of a task's attempts, attached at submission
#[async_trait]
pub trait TaskListener: Send + Sync {
    /// Within the submitting call, before the handle is returned.
    /// An error fails the submission.
    async fn submitted(&self, _event: &TaskEvent<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// On the worker, right before the body. An error aborts the attempt.
    async fn starting(&self, _event: &TaskEvent<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// The attempt will not reach a normal completed outcome
    async fn aborted(&self, _event: &TaskEvent<'_>, _error: &ExecutionError) -> anyhow::Result<()> {
        Ok(())
    }

    /// The attempt's outcome is latched
    async fn done(
        &self,
        _event: &TaskEvent<'_>,
        _error: Option<&ExecutionError>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Submits a derived handle for the same task
pub(crate) type Resubmitter = Arc<
    dyn Fn(ManagedExecutor, Option<Arc<dyn Trigger>>) -> BoxFuture<'static, Result<AnyHandle>>
        + Send
        + Sync,
>;

/// What a listener callback sees
pub struct TaskEvent<'a> {
    handle: &'a AnyHandle,
    executor: &'a ManagedExecutor,
    task: &'a TaskInfo,
    attempt: u64,
    resubmitter: &'a Resubmitter,
}

impl<'a> TaskEvent<'a> {
    pub fn handle(&self) -> &AnyHandle {
        self.handle
    }

    pub fn executor(&self) -> &ManagedExecutor {
        self.executor
    }

    pub fn task(&self) -> &TaskInfo {
        self.task
    }

    /// Attempt the callback belongs to
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Submit the task again as an independent one-shot handle
    pub async fn resubmit(&self) -> Result<AnyHandle> {
        (self.resubmitter)(self.executor.clone(), None).await
    }

    /// Schedule the task again under `trigger` as an independent handle
    pub async fn reschedule(&self, trigger: Arc<dyn Trigger>) -> Result<AnyHandle> {
        (self.resubmitter)(self.executor.clone(), Some(trigger)).await
    }
}

/// Everything needed to build a `TaskEvent` for one series
#[derive(Clone)]
pub(crate) struct EventSource {
    pub handle: AnyHandle,
    pub executor: ManagedExecutor,
    pub info: Arc<TaskInfo>,
    pub resubmitter: Resubmitter,
}

impl EventSource {
    pub fn event(&self, attempt: u64) -> TaskEvent<'_> {
        TaskEvent {
            handle: &self.handle,
            executor: &self.executor,
            task: &self.info,
            attempt,
            resubmitter: &self.resubmitter,
        }
    }
}

// ============================================================================
// ListenerDispatcher
// ============================================================================

/// Invokes one task's listener with context isolation
#[derive(Clone)]
pub(crate) struct ListenerDispatcher {
    listener: Option<Arc<dyn TaskListener>>,
    context: Arc<dyn ContextProvider>,
    snapshot: Arc<dyn ContextSnapshot>,
    failure_log: ListenerFailureLog,
}

impl ListenerDispatcher {
    pub fn new(
        listener: Option<Arc<dyn TaskListener>>,
        context: Arc<dyn ContextProvider>,
        snapshot: Arc<dyn ContextSnapshot>,
        failure_log: ListenerFailureLog,
    ) -> Self {
        Self {
            listener,
            context,
            snapshot,
            failure_log,
        }
    }

    /// Fails with `SubmissionRejected` when the listener fails
    pub async fn submitted(&self, event: &TaskEvent<'_>) -> Result<()> {
        let Some(listener) = &self.listener else {
            return Ok(());
        };
        self.invoke("submitted", listener.submitted(event))
            .await
            .map_err(|e| {
                ExecutionError::rejected_by(
                    &event.task.name,
                    "submitted listener failed",
                    Cause::new(e),
                )
            })
    }

    /// Fails with `StartAborted` when the listener fails
    pub async fn starting(&self, event: &TaskEvent<'_>) -> Result<()> {
        let Some(listener) = &self.listener else {
            return Ok(());
        };
        self.invoke("starting", listener.starting(event))
            .await
            .map_err(|e| ExecutionError::StartAborted {
                task: event.task.name.clone(),
                cause: Cause::new(e),
            })
    }

    pub async fn aborted(&self, event: &TaskEvent<'_>, error: &ExecutionError) {
        let Some(listener) = &self.listener else {
            return;
        };
        if let Err(e) = self.invoke("aborted", listener.aborted(event, error)).await {
            self.swallow(event, "aborted", e);
        }
    }

    pub async fn done(&self, event: &TaskEvent<'_>, error: Option<&ExecutionError>) {
        let Some(listener) = &self.listener else {
            return;
        };
        if let Err(e) = self.invoke("done", listener.done(event, error)).await {
            self.swallow(event, "done", e);
        }
    }

    async fn invoke<F>(&self, callback: &'static str, call: F) -> anyhow::Result<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send,
    {
        let scoped = call
            .with_context(Arc::clone(&self.snapshot))
            .suspending(Arc::clone(&self.context));

        match AssertUnwindSafe(scoped).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!(
                "{} listener panicked: {}",
                callback,
                panic_message(panic.as_ref())
            )),
        }
    }

    fn swallow(&self, event: &TaskEvent<'_>, callback: &'static str, cause: anyhow::Error) {
        let error = ExecutionError::ListenerFailed {
            task: event.task.name.clone(),
            callback,
            cause: Cause::new(cause),
        };
        event.executor.record_listener_failure();

        match self.failure_log {
            ListenerFailureLog::Warn => warn!("{} (attempt {})", error, event.attempt),
            ListenerFailureLog::Debug => debug!("{} (attempt {})", error, event.attempt),
        }
    }
}
