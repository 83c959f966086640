//! Schedule runner - submits a demo series and logs its lifecycle

use async_trait::async_trait;
use cadence_task::{
    ExecutionError, ExecutionHistory, FixedDelay, FixedRate, Interrupted, LastExecution,
    ManagedExecutor, Task, TaskContext, TaskEvent, TaskHandle, TaskListener, Trigger,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub enum Periodic {
    FixedRate,
    FixedDelay,
}

/// Simulated work done by each run
#[derive(Debug, Clone, Copy)]
pub struct Work {
    pub work_ms: u64,
    pub fail_on: Option<u64>,
}

/// Task that sleeps for `work_ms` and returns its attempt number
fn tick_task(work: Work) -> Task<u64> {
    Task::new("tick", move |ctx: TaskContext| async move {
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_millis(work.work_ms)) => {}
            _ = ctx.interrupted() => return Err(anyhow::Error::new(Interrupted)),
        }
        if work.fail_on == Some(ctx.attempt()) {
            anyhow::bail!("simulated failure on attempt {}", ctx.attempt());
        }
        Ok(ctx.attempt())
    })
    .with_property("source", "cli")
}

// ============================================================================
// Triggers
// ============================================================================

/// Ends a series after `runs` attempts
struct Limited<T> {
    inner: T,
    runs: u64,
}

impl<T: Trigger> Trigger for Limited<T> {
    fn next_run_time(
        &self,
        history: &ExecutionHistory,
        scheduled_at: DateTime<Utc>,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        if history.attempts() >= self.runs {
            return Ok(None);
        }
        self.inner.next_run_time(history, scheduled_at)
    }
}

/// Runs at fixed offsets from submission, skipping listed attempts
struct Offsets {
    at: Vec<i64>,
    skip: BTreeSet<u64>,
}

impl Trigger for Offsets {
    fn next_run_time(
        &self,
        history: &ExecutionHistory,
        scheduled_at: DateTime<Utc>,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        let index = usize::try_from(history.attempts())?;
        Ok(self
            .at
            .get(index)
            .map(|ms| scheduled_at + Duration::milliseconds(*ms)))
    }

    fn skip_run(
        &self,
        last: Option<&LastExecution>,
        _scheduled_for: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let attempt = last.map_or(1, |l| l.attempt() + 1);
        Ok(self.skip.contains(&attempt))
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Logs every callback and signals when the series is over
#[derive(Default)]
struct LoggingListener {
    finished: Notify,
}

#[async_trait]
impl TaskListener for LoggingListener {
    async fn submitted(&self, event: &TaskEvent<'_>) -> anyhow::Result<()> {
        let handle = event.handle();
        info!(
            "{} #{} submitted, runs in {}ms",
            handle.id(),
            event.attempt(),
            handle.delay().num_milliseconds().max(0)
        );
        Ok(())
    }

    async fn starting(&self, event: &TaskEvent<'_>) -> anyhow::Result<()> {
        info!("{} #{} starting", event.handle().id(), event.attempt());
        Ok(())
    }

    async fn aborted(&self, event: &TaskEvent<'_>, error: &ExecutionError) -> anyhow::Result<()> {
        warn!("{} #{} aborted: {}", event.handle().id(), event.attempt(), error);
        Ok(())
    }

    async fn done(
        &self,
        event: &TaskEvent<'_>,
        error: Option<&ExecutionError>,
    ) -> anyhow::Result<()> {
        let handle = event.handle();
        match error {
            None => info!("{} #{} done", handle.id(), event.attempt()),
            Some(e) => info!("{} #{} done: {}", handle.id(), event.attempt(), e),
        }
        if handle.is_done() {
            self.finished.notify_one();
        }
        Ok(())
    }
}

// ============================================================================
// Runners
// ============================================================================

pub async fn run_periodic(
    executor: &ManagedExecutor,
    kind: Periodic,
    initial_delay_ms: i64,
    period_ms: i64,
    runs: u64,
    work: Work,
) -> anyhow::Result<()> {
    let listener = Arc::new(LoggingListener::default());
    let task = tick_task(work).with_listener(listener.clone());
    let initial_delay = Duration::milliseconds(initial_delay_ms);
    let period = Duration::milliseconds(period_ms);

    let handle = match (kind, runs) {
        (Periodic::FixedRate, 0) => {
            executor
                .schedule_at_fixed_rate(task, initial_delay, period)
                .await?
        }
        (Periodic::FixedDelay, 0) => {
            executor
                .schedule_with_fixed_delay(task, initial_delay, period)
                .await?
        }
        (kind, runs) => {
            anyhow::ensure!(period_ms > 0, "period must be positive, got {}ms", period_ms);
            let trigger: Arc<dyn Trigger> = match kind {
                Periodic::FixedRate => Arc::new(Limited {
                    inner: FixedRate::new(initial_delay, period),
                    runs,
                }),
                Periodic::FixedDelay => Arc::new(Limited {
                    inner: FixedDelay::new(initial_delay, period),
                    runs,
                }),
            };
            executor.schedule_with_trigger(task, trigger).await?
        }
    };

    info!("Scheduled {:?} series {} ({} runs)", kind, handle, runs);
    finish(executor, handle, &listener).await
}

pub async fn run_offsets(
    executor: &ManagedExecutor,
    at: Vec<i64>,
    skip: Vec<u64>,
    work: Work,
) -> anyhow::Result<()> {
    let listener = Arc::new(LoggingListener::default());
    let trigger = Arc::new(Offsets {
        at,
        skip: skip.into_iter().collect(),
    });
    let task = tick_task(work).with_listener(listener.clone());

    let handle = executor.schedule_with_trigger(task, trigger).await?;
    info!("Scheduled trigger series {}", handle);
    finish(executor, handle, &listener).await
}

/// Wait for the series to end (or Ctrl-C), then report
async fn finish(
    executor: &ManagedExecutor,
    handle: TaskHandle<u64>,
    listener: &LoggingListener,
) -> anyhow::Result<()> {
    tokio::select! {
        _ = listener.finished.notified() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling {}", handle.id());
            handle.cancel(true);
            listener.finished.notified().await;
        }
    }

    match handle.get().await {
        Ok(value) => info!("Series {} finished, last result: {}", handle.id(), value),
        Err(e) => warn!("Series {} finished: {}", handle.id(), e),
    }

    if !executor.config().managed {
        executor.shutdown()?;
        executor
            .await_termination(std::time::Duration::from_secs(5))
            .await?;
    }

    println!("{}", serde_json::to_string_pretty(&executor.stats())?);
    Ok(())
}
