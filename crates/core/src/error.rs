//! Shared error model.

use thiserror::Error;

/// Result type used across the pure layer.
pub type CoreResult<T> = Result<T, CoreError>;

/// Core-level error.
///
/// Keep this focused on deterministic failures (parsing, illegal state
/// transitions). Storage and transport concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A state machine was asked to perform a transition it does not allow.
    #[error("illegal transition: {from} -> {event}")]
    IllegalTransition { from: String, event: String },
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn illegal_transition(from: impl ToString, event: impl ToString) -> Self {
        Self::IllegalTransition {
            from: from.to_string(),
            event: event.to_string(),
        }
    }
}
