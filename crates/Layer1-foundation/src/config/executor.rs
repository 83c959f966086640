//! Executor Config - managed executor settings
//!
//! Loaded from JSON or TOML; the format is picked from the file extension.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file name
pub const EXECUTOR_CONFIG_FILE: &str = "executor.json";

/// How swallowed `aborted`/`done` listener failures are logged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerFailureLog {
    #[default]
    Warn,
    Debug,
}

/// Managed executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorConfig {
    /// Executor name, used in logs and diagnostics
    #[serde(default = "default_name")]
    pub name: String,

    /// Maximum attempts running task bodies at the same time
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Container-managed executors refuse lifecycle operations
    #[serde(default = "default_managed")]
    pub managed: bool,

    /// Number of `LastExecution` records kept per series
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Log level for listener failures that are swallowed
    #[serde(default)]
    pub listener_failure_log: ListenerFailureLog,

    /// How long an interrupted body may keep running before its worker
    /// unit is aborted
    #[serde(default = "default_interrupt_grace_ms")]
    pub interrupt_grace_ms: u64,
}

fn default_name() -> String {
    "default".to_string()
}

fn default_max_concurrent() -> usize {
    4
}

fn default_managed() -> bool {
    true
}

fn default_history_limit() -> usize {
    64
}

fn default_interrupt_grace_ms() -> u64 {
    1000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            max_concurrent: default_max_concurrent(),
            managed: default_managed(),
            history_limit: default_history_limit(),
            listener_failure_log: ListenerFailureLog::default(),
            interrupt_grace_ms: default_interrupt_grace_ms(),
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unmanaged executors own their lifecycle and accept shutdown requests
    pub fn unmanaged() -> Self {
        Self {
            managed: false,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = history_limit;
        self
    }

    pub fn with_interrupt_grace_ms(mut self, interrupt_grace_ms: u64) -> Self {
        self.interrupt_grace_ms = interrupt_grace_ms;
        self
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// Load from a `.json` or `.toml` file and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content)?,
            Some("toml") => Self::from_toml_str(&content)?,
            other => {
                return Err(Error::UnsupportedFormat(
                    other.unwrap_or("<none>").to_string(),
                ))
            }
        };

        tracing::debug!("Loaded executor config '{}' from {}", config.name, path.display());
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("executor name must not be empty".into()));
        }
        if self.max_concurrent == 0 {
            return Err(Error::Validation("maxConcurrent must be at least 1".into()));
        }
        if self.history_limit == 0 {
            return Err(Error::Validation("historyLimit must be at least 1".into()));
        }
        Ok(())
    }
}
