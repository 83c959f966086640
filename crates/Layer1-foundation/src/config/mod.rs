//! Config - executor configuration
//!
//! - `executor.rs` - ExecutorConfig (worker pool size, lifecycle, history)

mod executor;

pub use executor::{ExecutorConfig, ListenerFailureLog, EXECUTOR_CONFIG_FILE};
