use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Result of an AI inference.
///
/// Analysis writes are idempotent on the application side, so the same result
/// may be produced more than once under at-least-once delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiResult {
    /// Primary score for the inference (model-specific meaning).
    pub score: f64,

    /// Confidence in \[0, 1\] (recommended convention; not enforced).
    pub confidence: f64,

    /// Optional human-readable explanation.
    pub explanation: Option<String>,

    /// Free-form metadata (model name, timings, etc).
    pub metadata: JsonValue,
}

impl AiResult {
    pub fn new(score: f64, confidence: f64) -> Self {
        Self {
            score,
            confidence,
            explanation: None,
            metadata: JsonValue::Null,
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Failure reported by (or on behalf of) a dependency.
///
/// Retry classification maps each variant to a category. The rendered
/// message is what gets stored as the job's last error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AiError {
    #[error("request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("invalid_input: {0}")]
    InvalidInput(String),

    #[error("api error: {0}")]
    Api(String),

    /// Raw downstream message, passed through verbatim.
    #[error("{0}")]
    Failed(String),
}

impl AiError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}
