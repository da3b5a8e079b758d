//! # Multiplexer Errors
//!
//! Error types for the observe multiplexer. Every variant is a contract
//! violation surfaced immediately; nothing here is transient or retried.

use thiserror::Error;

/// Result type for multiplexer operations
pub type MultiplexResult<T> = Result<T, MultiplexError>;

/// Multiplexer errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MultiplexError {
    /// The caller broke the event protocol (unknown id, early change,
    /// double ready, detach before ready, kind not valid for the mode)
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// An operation that waits on the worker was invoked from the worker
    #[error("Reentrancy violation: {0}")]
    ReentrancyViolation(String),

    /// The multiplexer is in the wrong lifecycle state for the operation
    #[error("Lifecycle violation: {0}")]
    LifecycleViolation(String),

    /// The ordering mode is missing or contradictory
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MultiplexError {
    /// Caller broke the event protocol
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    /// Blocking call made from the worker
    pub fn reentrancy(msg: impl Into<String>) -> Self {
        Self::ReentrancyViolation(msg.into())
    }

    /// Operation invalid in the current lifecycle state
    pub fn lifecycle(msg: impl Into<String>) -> Self {
        Self::LifecycleViolation(msg.into())
    }

    /// Bad or missing configuration
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Invariant broken inside the crate
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable error code for logs and CLI output
    pub fn code(&self) -> &'static str {
        match self {
            Self::ProtocolViolation(_) => "OBSERVE_PROTOCOL_VIOLATION",
            Self::ReentrancyViolation(_) => "OBSERVE_REENTRANCY_VIOLATION",
            Self::LifecycleViolation(_) => "OBSERVE_LIFECYCLE_VIOLATION",
            Self::ConfigError(_) => "OBSERVE_CONFIG_ERROR",
            Self::Internal(_) => "OBSERVE_INTERNAL_ERROR",
        }
    }

    /// A lock was poisoned by a panicking holder
    pub(crate) fn poisoned() -> Self {
        Self::Internal("Lock poisoned".into())
    }
}
