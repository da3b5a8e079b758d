//! Multiplexer configuration
//!
//! The ordering mode is mandatory. It may be given as `ordered` (bool) or
//! `mode` (`"ordered"` / `"unordered"`); giving both with different answers
//! is rejected.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::errors::{MultiplexError, MultiplexResult};
use super::event::OrderingMode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiplexerConfig {
    /// Whether documents carry a position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordered: Option<bool>,

    /// Same choice, spelled as a mode name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<OrderingMode>,

    /// Name of the worker thread
    #[serde(default = "default_worker_name")]
    pub worker_name: String,
}

fn default_worker_name() -> String {
    "observe-multiplex".to_string()
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            ordered: None,
            mode: None,
            worker_name: default_worker_name(),
        }
    }
}

impl MultiplexerConfig {
    /// Config for an explicit mode
    pub fn with_mode(mode: OrderingMode) -> Self {
        Self {
            mode: Some(mode),
            ..Self::default()
        }
    }

    /// Ordered config with defaults
    pub fn ordered() -> Self {
        Self::with_mode(OrderingMode::Ordered)
    }

    /// Unordered config with defaults
    pub fn unordered() -> Self {
        Self::with_mode(OrderingMode::Unordered)
    }

    /// Override the worker thread name
    pub fn worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    /// Resolve the ordering mode
    pub fn resolve_mode(&self) -> MultiplexResult<OrderingMode> {
        match (self.ordered, self.mode) {
            (Some(ordered), Some(mode)) if ordered != mode.is_ordered() => {
                Err(MultiplexError::config(format!(
                    "ordered = {} contradicts mode = {}",
                    ordered, mode
                )))
            }
            (_, Some(mode)) => Ok(mode),
            (Some(ordered), None) => Ok(OrderingMode::from_ordered(ordered)),
            (None, None) => Err(MultiplexError::config("must specify ordered or mode")),
        }
    }

    /// Check the mode resolves and the worker name is usable
    pub fn validate(&self) -> MultiplexResult<()> {
        self.resolve_mode()?;
        if self.worker_name.trim().is_empty() {
            return Err(MultiplexError::config("worker_name must not be empty"));
        }
        Ok(())
    }

    /// Parse and validate a JSON config
    pub fn from_json_str(json: &str) -> MultiplexResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| MultiplexError::config(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub fn from_file(path: &Path) -> MultiplexResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            MultiplexError::config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&content)
    }
}
