//! # cadence-foundation
//!
//! Foundation layer for Cadence:
//! - Error: configuration and IO errors
//! - Config: managed executor settings (JSON / TOML)
//! - Context: capture and propagation of the submitter's execution context
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Layer4-cli (cadence binary)                            │
//! ├─────────────────────────────────────────────────────────┤
//! │  Layer2-task                                            │
//! │  ├── ManagedExecutor (submit / schedule)                │
//! │  ├── ExecutionCoordinator ─▶ WorkerPool                 │
//! │  └── TaskHandle · Trigger · ResultStore · Listeners     │
//! ├─────────────────────────────────────────────────────────┤
//! │  Layer1-foundation (this layer)                         │
//! │  ├── ExecutorConfig                                     │
//! │  └── ContextProvider / ContextSnapshot                  │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod context;
pub mod error;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config
// ============================================================================
pub use config::{ExecutorConfig, ListenerFailureLog, EXECUTOR_CONFIG_FILE};

// ============================================================================
// Context
// ============================================================================
pub use context::{
    ContextGuard, ContextProvider, ContextSnapshot, Contextual, NoopContextProvider, WithContext,
};
