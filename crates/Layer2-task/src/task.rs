//! Task definition and types

use crate::handle::HandleId;
use crate::listener::TaskListener;
use async_trait::async_trait;
use cadence_foundation::ContextSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a new random TaskId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Identity and properties attached to a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Unique task identifier
    pub id: TaskId,

    /// Identity name used in logs and `LastExecution` records
    pub name: String,

    /// Free-form execution properties
    pub properties: BTreeMap<String, String>,
}

impl TaskInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Check identity and property keys; returns the reason on failure
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("identity name must not be empty".to_string());
        }
        if self.name.chars().any(char::is_control) {
            return Err(format!(
                "identity name {:?} contains control characters",
                self.name
            ));
        }
        if self.properties.keys().any(|k| k.trim().is_empty()) {
            return Err("property keys must not be empty".to_string());
        }
        Ok(())
    }
}

impl std::fmt::Display for TaskInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.name, self.id)
    }
}

// ============================================================================
// Interruption
// ============================================================================

/// Returned by a task body that honors an interruption request
#[derive(Debug, Clone, Copy, Error)]
#[error("task interrupted")]
pub struct Interrupted;

/// Per-attempt context handed to the task body
#[derive(Clone)]
pub struct TaskContext {
    info: Arc<TaskInfo>,
    handle_id: HandleId,
    attempt: u64,
    scheduled_for: DateTime<Utc>,
    interrupt: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(
        info: Arc<TaskInfo>,
        handle_id: HandleId,
        attempt: u64,
        scheduled_for: DateTime<Utc>,
        interrupt: CancellationToken,
    ) -> Self {
        Self {
            info,
            handle_id,
            attempt,
            scheduled_for,
            interrupt,
        }
    }

    pub fn task(&self) -> &TaskInfo {
        &self.info
    }

    pub fn handle_id(&self) -> HandleId {
        self.handle_id
    }

    /// 1-based attempt number within the series
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn scheduled_for(&self) -> DateTime<Utc> {
        self.scheduled_for
    }

    /// Whether `cancel(true)` interrupted this attempt
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    /// Resolves once the attempt is interrupted
    pub async fn interrupted(&self) {
        self.interrupt.cancelled().await
    }

    pub fn check_interrupted(&self) -> std::result::Result<(), Interrupted> {
        if self.is_interrupted() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Task body
// ============================================================================

/// Work executed by an attempt
#[async_trait]
pub trait TaskBody<T>: Send + Sync {
    async fn call(&self, ctx: TaskContext) -> anyhow::Result<T>;
}

struct FnBody<F>(F);

#[async_trait]
impl<T, F, Fut> TaskBody<T> for FnBody<F>
where
    T: Send + 'static,
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    async fn call(&self, ctx: TaskContext) -> anyhow::Result<T> {
        (self.0)(ctx).await
    }
}

struct WithResult<R> {
    inner: Arc<dyn TaskBody<()>>,
    value: R,
}

#[async_trait]
impl<R> TaskBody<R> for WithResult<R>
where
    R: Clone + Send + Sync + 'static,
{
    async fn call(&self, ctx: TaskContext) -> anyhow::Result<R> {
        self.inner.call(ctx).await?;
        Ok(self.value.clone())
    }
}

// ============================================================================
// Task
// ============================================================================

/// A unit of work to be submitted; immutable once submitted
pub struct Task<T> {
    info: TaskInfo,
    body: Arc<dyn TaskBody<T>>,
    listener: Option<Arc<dyn TaskListener>>,
    listener_context: Option<Arc<dyn ContextSnapshot>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            info: self.info.clone(),
            body: Arc::clone(&self.body),
            listener: self.listener.clone(),
            listener_context: self.listener_context.clone(),
        }
    }
}

impl<T: Send + 'static> Task<T> {
    /// Create a task from an async closure
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self::from_body(name, FnBody(f))
    }

    /// Create a task from a body implementation
    pub fn from_body(name: impl Into<String>, body: impl TaskBody<T> + 'static) -> Self {
        Self {
            info: TaskInfo::new(name),
            body: Arc::new(body),
            listener: None,
            listener_context: None,
        }
    }

    /// Add an execution property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.info.properties.insert(key.into(), value.into());
        self
    }

    /// Attach the lifecycle listener; its callbacks see the context
    /// captured at submission
    pub fn with_listener(mut self, listener: Arc<dyn TaskListener>) -> Self {
        self.listener = Some(listener);
        self.listener_context = None;
        self
    }

    /// Attach the lifecycle listener together with the context it was
    /// registered in, applied around each of its callbacks
    pub fn with_listener_context(
        mut self,
        listener: Arc<dyn TaskListener>,
        context: Arc<dyn ContextSnapshot>,
    ) -> Self {
        self.listener = Some(listener);
        self.listener_context = Some(context);
        self
    }

    pub fn info(&self) -> &TaskInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn listener(&self) -> Option<&Arc<dyn TaskListener>> {
        self.listener.as_ref()
    }

    pub(crate) fn listener_context(&self) -> Option<&Arc<dyn ContextSnapshot>> {
        self.listener_context.as_ref()
    }

    pub(crate) fn body(&self) -> &Arc<dyn TaskBody<T>> {
        &self.body
    }
}

impl Task<()> {
    /// Run this unit task and yield `value` as its result
    pub fn with_result<R>(self, value: R) -> Task<R>
    where
        R: Clone + Send + Sync + 'static,
    {
        Task {
            info: self.info,
            body: Arc::new(WithResult {
                inner: self.body,
                value,
            }),
            listener: self.listener,
            listener_context: self.listener_context,
        }
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("info", &self.info)
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}
