//! # cadence-task
//!
//! Managed task execution engine for Cadence.
//! Accepts one-shot and repeating work, schedules it, runs it on a worker
//! pool and notifies lifecycle listeners along the way.
//!
//! ## Features
//!
//! - One-shot, delayed, fixed-rate, fixed-delay and trigger-driven schedules
//! - Future-like handles spanning a whole series (`get`, `cancel`, ordering)
//! - Four lifecycle callbacks with exactly-once `done`
//! - Listener-driven resubmit / reschedule into independent handles
//! - **Race-free cancel vs. completion latching**
//! - **Context propagation into task bodies and listeners**
//!
//! ## Example
//!
//! ```ignore
//! let executor = ManagedExecutor::new();
//! let handle = executor
//!     .schedule_at_fixed_rate(task, Duration::zero(), Duration::seconds(5))
//!     .await?;
//! let latest = handle.get().await?;
//! ```

mod coordinator;
pub mod error;
pub mod executor;
pub mod handle;
pub mod listener;
pub mod pool;
pub mod result_store;
pub mod state;
pub mod task;
pub mod trigger;

// Engine
pub use executor::{ExecutorBuilder, ExecutorStats, ManagedExecutor};
pub use pool::{TokioWorkerPool, WorkerHandle, WorkerPool};

// Handles and outcomes
pub use error::{Cause, ExecutionError, Result};
pub use handle::{AnyHandle, HandleId, TaskHandle};
pub use result_store::{Completion, Outcome};
pub use state::{AbortReason, TaskState};

// Tasks and listeners
pub use listener::{TaskEvent, TaskListener};
pub use task::{Interrupted, Task, TaskBody, TaskContext, TaskId, TaskInfo};

// Triggers
pub use trigger::{
    ExecutionHistory, ExecutionStatus, FixedDelay, FixedRate, LastExecution, Trigger,
};
