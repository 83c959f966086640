//! Task state machine

use serde::{Deserialize, Serialize};

/// Why an attempt ended without a normal completed outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbortReason {
    /// The trigger asked to skip this run
    Skipped,

    /// The `submitted` listener failed
    SubmitFailed,

    /// The `starting` listener failed
    StartFailed,

    /// The trigger failed to compute the next run
    TriggerFailed,
}

/// Externally visible state of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Submitted, waiting for its scheduled time or a worker
    Pending,

    /// Starting or running on a worker
    Running,

    /// The current attempt returned normally
    Succeeded,

    /// The current attempt's body failed
    Failed,

    /// Cancelled through the handle
    Cancelled,

    /// The current attempt was aborted without running to completion
    Aborted(AbortReason),

    /// No further attempts will run
    Done,
}

impl TaskState {
    /// Check if this is a terminal state (cannot transition further)
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Cancelled | TaskState::Done)
    }

    /// Check if the current attempt is running
    pub fn is_running(&self) -> bool {
        matches!(self, TaskState::Running)
    }

    /// Check if the current attempt has not started yet
    pub fn is_pending(&self) -> bool {
        matches!(self, TaskState::Pending)
    }

    /// Check if the current attempt completed successfully
    pub fn is_success(&self) -> bool {
        matches!(self, TaskState::Succeeded)
    }

    /// Get display name for the state
    pub fn display_name(&self) -> &'static str {
        match self {
            TaskState::Pending => "Pending",
            TaskState::Running => "Running",
            TaskState::Succeeded => "Succeeded",
            TaskState::Failed => "Failed",
            TaskState::Cancelled => "Cancelled",
            TaskState::Aborted(AbortReason::Skipped) => "Skipped",
            TaskState::Aborted(_) => "Aborted",
            TaskState::Done => "Done",
        }
    }

    /// Get a symbol for the state
    pub fn symbol(&self) -> &'static str {
        match self {
            TaskState::Pending => "◯",
            TaskState::Running => "⟳",
            TaskState::Succeeded => "✓",
            TaskState::Failed => "✗",
            TaskState::Cancelled => "⊘",
            TaskState::Aborted(_) => "↷",
            TaskState::Done => "■",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.symbol(), self.display_name())
    }
}

/// Internal phase of the attempt a handle currently tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttemptPhase {
    Created,
    Submitted,
    Queued,
    Starting,
    Running,
    /// Body returned; outcome not latched yet
    Finishing,
    Completed(TaskState),
}

impl AttemptPhase {
    pub(crate) fn as_task_state(&self) -> TaskState {
        match self {
            AttemptPhase::Created | AttemptPhase::Submitted | AttemptPhase::Queued => {
                TaskState::Pending
            }
            AttemptPhase::Starting | AttemptPhase::Running | AttemptPhase::Finishing => {
                TaskState::Running
            }
            AttemptPhase::Completed(state) => *state,
        }
    }
}
