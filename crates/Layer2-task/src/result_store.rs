//! Result store - latest completed outcome of a series
//!
//! Publishing goes through a `watch` channel, so a value written by the
//! thread that dispatches `done` is visible to every later `get()`.

use crate::error::{ExecutionError, Result};
use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Outcome of one attempt
pub type Outcome<T> = std::result::Result<T, ExecutionError>;

/// A latched attempt outcome
#[derive(Debug, Clone)]
pub struct Completion<T> {
    /// Attempt number that produced the outcome
    pub attempt: u64,

    /// When the outcome was latched
    pub completed_at: DateTime<Utc>,

    pub outcome: Outcome<T>,
}

/// Holds the most recently completed attempt outcome
pub struct ResultStore<T> {
    tx: watch::Sender<Option<Completion<T>>>,
}

impl<T: Clone> ResultStore<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Latch the outcome of `attempt`, replacing the previous one
    pub fn publish(&self, attempt: u64, outcome: Outcome<T>) {
        self.tx.send_replace(Some(Completion {
            attempt,
            completed_at: Utc::now(),
            outcome,
        }));
    }

    /// Peek at the latest completion without waiting
    pub fn latest(&self) -> Option<Completion<T>> {
        self.tx.borrow().clone()
    }

    pub fn has_result(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait until some attempt has completed and return the latest outcome
    pub async fn wait(&self) -> Outcome<T> {
        let mut rx = self.tx.subscribe();
        let completion = {
            let latest = rx
                .wait_for(Option::is_some)
                .await
                .map_err(|_| ExecutionError::Internal("result store closed".to_string()))?;
            (*latest).clone()
        };

        match completion {
            Some(c) => c.outcome,
            None => Err(ExecutionError::Internal("result store empty".to_string())),
        }
    }

    /// Wait until an attempt numbered `attempt` or later has completed
    pub async fn wait_for_attempt(&self, attempt: u64) -> Result<Completion<T>> {
        let mut rx = self.tx.subscribe();
        let completion = {
            let latest = rx
                .wait_for(|c| c.as_ref().is_some_and(|c| c.attempt >= attempt))
                .await
                .map_err(|_| ExecutionError::Internal("result store closed".to_string()))?;
            (*latest).clone()
        };

        completion.ok_or_else(|| ExecutionError::Internal("result store empty".to_string()))
    }
}

impl<T: Clone> Default for ResultStore<T> {
    fn default() -> Self {
        Self::new()
    }
}
