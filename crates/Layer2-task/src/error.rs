//! Execution errors
//!
//! Every outcome a caller can observe through a handle, plus the synchronous
//! rejections raised by the submitting call. Errors are `Clone` because one
//! latched outcome is handed to every `get()` caller.

use crate::state::AbortReason;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, ExecutionError>;

// ============================================================================
// Cause
// ============================================================================

/// Shared, cloneable wrapper around an error raised by user code
#[derive(Clone)]
pub struct Cause(Arc<anyhow::Error>);

impl Cause {
    pub fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }

    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self::new(anyhow::Error::msg(message))
    }

    /// Look for a concrete error type in the wrapped error
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl From<anyhow::Error> for Cause {
    fn from(error: anyhow::Error) -> Self {
        Self::new(error)
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl fmt::Debug for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Cause {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let inner: &(dyn std::error::Error + Send + Sync + 'static) = (*self.0).as_ref();
        inner.source()
    }
}

// ============================================================================
// ExecutionError
// ============================================================================

/// Outcome errors of submitted work
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    // ========================================================================
    // Scheduler declined
    // ========================================================================
    #[error("Submission of '{task}' rejected: {reason}")]
    SubmissionRejected {
        task: String,
        reason: String,
        #[source]
        cause: Option<Cause>,
    },

    #[error("Start of '{task}' aborted: {cause}")]
    StartAborted {
        task: String,
        #[source]
        cause: Cause,
    },

    #[error("Execution of '{task}' skipped")]
    Skipped {
        task: String,
        #[source]
        cause: Option<Cause>,
    },

    // ========================================================================
    // Task outcomes
    // ========================================================================
    #[error("Task '{task}' failed: {cause}")]
    Failed {
        task: String,
        #[source]
        cause: Cause,
    },

    #[error("Task '{task}' cancelled {}", cancel_phase(.was_running, .interrupted))]
    Cancelled {
        task: String,
        was_running: bool,
        interrupted: bool,
    },

    #[error("Trigger for '{task}' could not compute the next run: {cause}")]
    TriggerFailed {
        task: String,
        #[source]
        cause: Cause,
    },

    // ========================================================================
    // Diagnostics only
    // ========================================================================
    #[error("Listener callback '{callback}' for '{task}' failed: {cause}")]
    ListenerFailed {
        task: String,
        callback: &'static str,
        #[source]
        cause: Cause,
    },

    // ========================================================================
    // Caller-side
    // ========================================================================
    #[error("Timed out after {0:?} waiting for the task outcome")]
    Timeout(Duration),

    #[error("Lifecycle operation '{0}' is not permitted on a managed executor")]
    LifecycleManaged(&'static str),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn cancel_phase(was_running: &bool, interrupted: &bool) -> &'static str {
    match (*was_running, *interrupted) {
        (true, true) => "while running (interrupted)",
        (true, false) => "while running",
        _ => "before running",
    }
}

impl ExecutionError {
    pub fn rejected(task: impl Into<String>, reason: impl Into<String>) -> Self {
        ExecutionError::SubmissionRejected {
            task: task.into(),
            reason: reason.into(),
            cause: None,
        }
    }

    pub fn rejected_by(task: impl Into<String>, reason: impl Into<String>, cause: Cause) -> Self {
        ExecutionError::SubmissionRejected {
            task: task.into(),
            reason: reason.into(),
            cause: Some(cause),
        }
    }

    pub fn cancelled(task: impl Into<String>, was_running: bool, interrupted: bool) -> Self {
        ExecutionError::Cancelled {
            task: task.into(),
            was_running,
            interrupted,
        }
    }

    pub fn skipped(task: impl Into<String>, cause: Option<Cause>) -> Self {
        ExecutionError::Skipped {
            task: task.into(),
            cause,
        }
    }

    /// Cancelled through `cancel()`
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ExecutionError::Cancelled { .. })
    }

    /// The scheduler declined to run the body
    pub fn is_declined(&self) -> bool {
        matches!(
            self,
            ExecutionError::SubmissionRejected { .. }
                | ExecutionError::StartAborted { .. }
                | ExecutionError::Skipped { .. }
        )
    }

    /// The task body itself failed
    pub fn is_task_failure(&self) -> bool {
        matches!(self, ExecutionError::Failed { .. })
    }

    /// The trigger could not compute the next run
    pub fn is_trigger_failure(&self) -> bool {
        matches!(self, ExecutionError::TriggerFailed { .. })
    }

    /// Abort classification for outcomes that never completed normally
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            ExecutionError::Skipped { .. } => Some(AbortReason::Skipped),
            ExecutionError::SubmissionRejected { .. } => Some(AbortReason::SubmitFailed),
            ExecutionError::StartAborted { .. } => Some(AbortReason::StartFailed),
            ExecutionError::TriggerFailed { .. } => Some(AbortReason::TriggerFailed),
            _ => None,
        }
    }

    /// Underlying user error, if any
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            ExecutionError::SubmissionRejected { cause, .. }
            | ExecutionError::Skipped { cause, .. } => cause.as_ref(),
            ExecutionError::StartAborted { cause, .. }
            | ExecutionError::Failed { cause, .. }
            | ExecutionError::TriggerFailed { cause, .. }
            | ExecutionError::ListenerFailed { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

/// Readable message from a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
