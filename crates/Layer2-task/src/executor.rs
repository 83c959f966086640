//! Managed Executor - submission and scheduling facade
//!
//! Features:
//! - One-shot submission, optionally with a fixed result
//! - Delayed, fixed-rate, fixed-delay and trigger-driven schedules
//! - Registry of active series for shutdown and termination
//! - Execution statistics

use crate::coordinator::{self, Plan};
use crate::error::{ExecutionError, Result};
use crate::handle::{AnyHandle, HandleId, TaskHandle};
use crate::pool::{TokioWorkerPool, WorkerPool};
use crate::result_store::Outcome;
use crate::task::Task;
use crate::trigger::{FixedDelay, FixedRate, Trigger};
use cadence_foundation::{ContextProvider, ExecutorConfig, NoopContextProvider};
use chrono::Duration;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Execution statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStats {
    /// Handles accepted by a submitting call
    pub submitted: u64,

    /// Attempts currently running a task body
    pub running: u64,

    /// Series that have not finished dispatching
    pub active: u64,

    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub skipped: u64,

    /// Attempts aborted by a listener or trigger failure
    pub aborted: u64,

    /// Swallowed `aborted`/`done` listener failures
    pub listener_failures: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub submitted: AtomicU64,
    pub running: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
    pub skipped: AtomicU64,
    pub aborted: AtomicU64,
    pub listener_failures: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an attempt as running until the guard drops
    pub fn enter_running(&self) -> RunningGuard<'_> {
        Self::bump(&self.running);
        RunningGuard(&self.running)
    }
}

pub(crate) struct RunningGuard<'a>(&'a AtomicU64);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

struct ExecutorInner {
    config: ExecutorConfig,
    pool: Arc<dyn WorkerPool>,
    context: Arc<dyn ContextProvider>,
    counters: Counters,
    active: Mutex<HashMap<HandleId, AnyHandle>>,
    idle: Notify,
    shutdown: AtomicBool,
}

/// Task execution engine instance
///
/// Cheap to clone; clones share the same pool, registry and statistics.
#[derive(Clone)]
pub struct ManagedExecutor {
    inner: Arc<ExecutorInner>,
}

impl ManagedExecutor {
    /// Create with the default configuration and a tokio worker pool
    pub fn new() -> Self {
        Self::from_parts(
            ExecutorConfig::default(),
            None,
            Arc::new(NoopContextProvider),
        )
    }

    fn from_parts(
        config: ExecutorConfig,
        pool: Option<Arc<dyn WorkerPool>>,
        context: Arc<dyn ContextProvider>,
    ) -> Self {
        let pool =
            pool.unwrap_or_else(|| Arc::new(TokioWorkerPool::new(config.max_concurrent)));
        Self {
            inner: Arc::new(ExecutorInner {
                config,
                pool,
                context,
                counters: Counters::default(),
                active: Mutex::new(HashMap::new()),
                idle: Notify::new(),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub(crate) fn pool(&self) -> &Arc<dyn WorkerPool> {
        &self.inner.pool
    }

    pub(crate) fn context(&self) -> &Arc<dyn ContextProvider> {
        &self.inner.context
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.inner.counters
    }

    pub(crate) fn record_listener_failure(&self) {
        Counters::bump(&self.inner.counters.listener_failures);
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Run `task` once, as soon as a worker is free
    pub async fn submit<T>(&self, task: Task<T>) -> Result<TaskHandle<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        coordinator::submit(self.clone(), task, Plan::once(Duration::zero())).await
    }

    /// Run a unit task once and yield `value` as its result
    pub async fn submit_with_result<R>(&self, task: Task<()>, value: R) -> Result<TaskHandle<R>>
    where
        R: Clone + Send + Sync + 'static,
    {
        self.submit(task.with_result(value)).await
    }

    /// Fire-and-forget submission
    pub async fn execute(&self, task: Task<()>) -> Result<()> {
        self.submit(task).await.map(|_| ())
    }

    /// Submit every task, then wait for all outcomes in submission order
    pub async fn invoke_all<T>(&self, tasks: Vec<Task<T>>) -> Result<Vec<Outcome<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            handles.push(self.submit(task).await?);
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in &handles {
            outcomes.push(handle.get().await);
        }
        Ok(outcomes)
    }

    /// Run `task` once after `delay`; a negative delay runs it immediately
    pub async fn schedule<T>(&self, task: Task<T>, delay: Duration) -> Result<TaskHandle<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        coordinator::submit(self.clone(), task, Plan::once(delay)).await
    }

    /// Run `task` whenever `trigger` says so
    pub async fn schedule_with_trigger<T>(
        &self,
        task: Task<T>,
        trigger: Arc<dyn Trigger>,
    ) -> Result<TaskHandle<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        coordinator::submit(self.clone(), task, Plan::Trigger(trigger)).await
    }

    /// Runs spaced by `period` from each scheduled start
    pub async fn schedule_at_fixed_rate<T>(
        &self,
        task: Task<T>,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<TaskHandle<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        check_period(task.name(), period)?;
        self.schedule_with_trigger(task, Arc::new(FixedRate::new(initial_delay, period)))
            .await
    }

    /// Runs spaced by `period` from the end of the previous run
    pub async fn schedule_with_fixed_delay<T>(
        &self,
        task: Task<T>,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<TaskHandle<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        check_period(task.name(), period)?;
        self.schedule_with_trigger(task, Arc::new(FixedDelay::new(initial_delay, period)))
            .await
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Track a submitted series; fails if a shutdown started while its
    /// `submitted` callback ran
    pub(crate) fn register(&self, handle: AnyHandle) -> Result<()> {
        {
            // checked under the registry lock so `shutdown_now` sees the handle
            let mut active = self.inner.active.lock();
            if self.is_shutdown() {
                return Err(ExecutionError::rejected(
                    &handle.task().name,
                    format!("executor '{}' shut down during submission", self.name()),
                ));
            }
            active.insert(handle.id(), handle);
        }
        Counters::bump(&self.inner.counters.submitted);
        Ok(())
    }

    pub(crate) fn unregister(&self, id: HandleId) {
        let now_idle = {
            let mut active = self.inner.active.lock();
            active.remove(&id);
            active.is_empty()
        };
        if now_idle {
            self.inner.idle.notify_waiters();
        }
    }

    /// Handles of every series that has not finished dispatching
    pub fn active_handles(&self) -> Vec<AnyHandle> {
        let mut handles: Vec<_> = self.inner.active.lock().values().cloned().collect();
        handles.sort();
        handles
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    fn ensure_unmanaged(&self, operation: &'static str) -> Result<()> {
        if self.inner.config.managed {
            return Err(ExecutionError::LifecycleManaged(operation));
        }
        Ok(())
    }

    /// Stop accepting submissions; running series continue
    pub fn shutdown(&self) -> Result<()> {
        self.ensure_unmanaged("shutdown")?;
        if !self.inner.shutdown.swap(true, Ordering::SeqCst) {
            info!("Executor '{}' shutting down", self.name());
        }
        Ok(())
    }

    /// Stop accepting submissions and cancel every active series
    pub fn shutdown_now(&self) -> Result<Vec<AnyHandle>> {
        self.ensure_unmanaged("shutdown_now")?;
        self.inner.shutdown.store(true, Ordering::SeqCst);

        let cancelled: Vec<AnyHandle> = self
            .active_handles()
            .into_iter()
            .filter(|handle| handle.cancel(true))
            .collect();

        info!(
            "Executor '{}' shut down now, cancelled {} series",
            self.name(),
            cancelled.len()
        );
        Ok(cancelled)
    }

    /// Wait until every series has finished; `false` on timeout
    pub async fn await_termination(&self, timeout: std::time::Duration) -> Result<bool> {
        self.ensure_unmanaged("await_termination")?;

        let wait = async {
            loop {
                let idle = self.inner.idle.notified();
                if self.inner.active.lock().is_empty() {
                    return;
                }
                idle.await;
            }
        };
        let terminated = tokio::time::timeout(timeout, wait).await.is_ok();
        debug!(
            "Executor '{}' await_termination: terminated = {}",
            self.name(),
            terminated
        );
        Ok(terminated)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.is_shutdown() && self.inner.active.lock().is_empty()
    }

    pub fn stats(&self) -> ExecutorStats {
        let c = &self.inner.counters;
        ExecutorStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            running: c.running.load(Ordering::Relaxed),
            active: self.inner.active.lock().len() as u64,
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            aborted: c.aborted.load(Ordering::Relaxed),
            listener_failures: c.listener_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for ManagedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ManagedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedExecutor")
            .field("name", &self.inner.config.name)
            .field("pool", &self.inner.pool.name())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

fn check_period(task: &str, period: Duration) -> Result<()> {
    if period <= Duration::zero() {
        return Err(ExecutionError::rejected(
            task,
            format!("period must be positive, got {}ms", period.num_milliseconds()),
        ));
    }
    Ok(())
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for `ManagedExecutor`
#[derive(Default)]
pub struct ExecutorBuilder {
    config: ExecutorConfig,
    pool: Option<Arc<dyn WorkerPool>>,
    context: Option<Arc<dyn ContextProvider>>,
}

impl ExecutorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default tokio pool sized from `maxConcurrent`
    pub fn worker_pool(mut self, pool: Arc<dyn WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn context_provider(mut self, context: Arc<dyn ContextProvider>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn build(self) -> cadence_foundation::Result<ManagedExecutor> {
        self.config.validate()?;
        let context = self
            .context
            .unwrap_or_else(|| Arc::new(NoopContextProvider));
        debug!(
            "Building executor '{}' (max_concurrent: {}, managed: {})",
            self.config.name, self.config.max_concurrent, self.config.managed
        );
        Ok(ManagedExecutor::from_parts(self.config, self.pool, context))
    }
}
