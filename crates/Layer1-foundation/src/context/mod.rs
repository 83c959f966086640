//! Context capture - propagation of the submitter's execution context
//!
//! The executor captures a snapshot when work is submitted and applies it
//! around task bodies and listener callbacks. Transactional context is
//! suspended around every user callback (listeners and triggers).
//!
//! ```text
//! submit()  ──capture()──▶  ContextSnapshot
//!                               │
//!   worker: poll ─▶ apply() ─▶ body.poll() ─▶ guard dropped (restore previous)
//! ```
//!
//! Snapshots act on the current thread, so async work is wrapped in
//! [`Contextual`], which applies and restores the context inside every
//! `poll`. A suspended future leaves nothing behind on its worker thread.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

// ============================================================================
// ContextGuard
// ============================================================================

/// Restores the previous context when dropped
#[must_use = "the context is restored as soon as the guard is dropped"]
pub struct ContextGuard {
    restore: Option<Box<dyn FnOnce() + Send>>,
}

impl ContextGuard {
    /// Guard that runs `restore` on drop
    pub fn new(restore: impl FnOnce() + Send + 'static) -> Self {
        Self {
            restore: Some(Box::new(restore)),
        }
    }

    /// Guard with nothing to restore
    pub fn noop() -> Self {
        Self { restore: None }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(restore) = self.restore.take() {
            restore();
        }
    }
}

impl fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGuard")
            .field("pending_restore", &self.restore.is_some())
            .finish()
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Captured context that can be applied to the current task
pub trait ContextSnapshot: Send + Sync {
    /// Apply the snapshot; the returned guard restores what was there before
    fn apply(&self) -> ContextGuard;
}

/// Source of context snapshots
pub trait ContextProvider: Send + Sync {
    /// Capture the caller's context
    fn capture(&self) -> Arc<dyn ContextSnapshot>;

    /// Suspend the caller's transaction until the guard is dropped
    fn suspend_transaction(&self) -> ContextGuard {
        ContextGuard::noop()
    }
}

// ============================================================================
// Noop implementation
// ============================================================================

/// Provider that propagates nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopContextProvider;

struct NoopSnapshot;

impl ContextSnapshot for NoopSnapshot {
    fn apply(&self) -> ContextGuard {
        ContextGuard::noop()
    }
}

impl ContextProvider for NoopContextProvider {
    fn capture(&self) -> Arc<dyn ContextSnapshot> {
        Arc::new(NoopSnapshot)
    }
}

// ============================================================================
// Future adapter
// ============================================================================

/// Future that polls `F` with a snapshot applied
///
/// Created by [`WithContext::with_context`].
#[must_use = "futures do nothing unless polled"]
pub struct Contextual<F> {
    future: Pin<Box<F>>,
    snapshot: Arc<dyn ContextSnapshot>,
    suspend: Option<Arc<dyn ContextProvider>>,
}

impl<F> Contextual<F> {
    /// Also suspend `provider`'s transaction around every poll
    pub fn suspending(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.suspend = Some(provider);
        self
    }
}

impl<F: Future> Future for Contextual<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        // dropped in reverse: restore, then resume
        let _suspended = this.suspend.as_ref().map(|p| p.suspend_transaction());
        let _applied = this.snapshot.apply();
        this.future.as_mut().poll(cx)
    }
}

/// Attach a context snapshot to a future
pub trait WithContext: Future + Sized {
    fn with_context(self, snapshot: Arc<dyn ContextSnapshot>) -> Contextual<Self> {
        Contextual {
            future: Box::pin(self),
            snapshot,
            suspend: None,
        }
    }
}

impl<F: Future> WithContext for F {}
