//! Worker pool - executes attempt units
//!
//! The engine only hands the pool ready-to-run units. Waiting for a
//! scheduled time happens outside the pool and never holds a permit.

use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::warn;

/// Worker pool trait - implement to plug in another execution backend
pub trait WorkerPool: Send + Sync {
    /// Queue a unit for eventual execution
    fn submit(&self, unit: BoxFuture<'static, ()>) -> WorkerHandle;

    /// Get pool name
    fn name(&self) -> &'static str;
}

/// Handle over a unit handed to a worker pool
pub struct WorkerHandle {
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn new(join: JoinHandle<()>) -> Self {
        Self { join }
    }

    /// Wait for the unit to finish; `false` if it was aborted or panicked
    pub async fn join(self) -> bool {
        match self.join.await {
            Ok(()) => true,
            Err(e) => {
                if e.is_panic() {
                    warn!("Worker unit panicked: {}", e);
                }
                false
            }
        }
    }

    /// Best-effort abort of the unit; used when an interrupted body
    /// overstays its grace period
    pub fn abort(&self) {
        self.join.abort();
    }
}

/// Tokio-backed pool bounded by a semaphore
pub struct TokioWorkerPool {
    permits: Arc<Semaphore>,
}

impl TokioWorkerPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }
}

impl WorkerPool for TokioWorkerPool {
    fn submit(&self, unit: BoxFuture<'static, ()>) -> WorkerHandle {
        let permits = Arc::clone(&self.permits);
        WorkerHandle::new(tokio::spawn(async move {
            // The semaphore is never closed
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            unit.await;
        }))
    }

    fn name(&self) -> &'static str {
        "tokio"
    }
}
