//! Failure categorization and retry scheduling.
//!
//! Transient failures (timeout, network, rate limits, generic API errors,
//! expiry, anything unrecognized) retry with exponential backoff
//! `2^retry_count * base_delay` until `max_retries` is used up. Validation,
//! authentication, and cancellation failures, plus messages matching a
//! permanently non-recoverable pattern, never retry.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use inferq_ai::AiError;

/// Message fragments that mark a failure as permanent regardless of category.
pub const NON_RECOVERABLE_PATTERNS: [&str; 4] = [
    "invalid_input",
    "malformed_request",
    "quota_permanently_exceeded",
    "user_cancelled",
];

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    Network,
    RateLimit,
    Authentication,
    ApiError,
    Cancelled,
    Validation,
    Expired,
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Network => "network",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::ApiError => "api_error",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Expired => "expired",
            ErrorCategory::Other => "other",
        }
    }

    /// Categories that are never retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Validation | ErrorCategory::Authentication | ErrorCategory::Cancelled
        )
    }

    /// Whether a failure in this category says something about the dependency's health.
    pub fn counts_against_dependency(&self) -> bool {
        !matches!(self, ErrorCategory::Validation | ErrorCategory::Cancelled)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Status codes only count as standalone tokens, so `40300ms` or `:4030` never match `403`.
fn has_code(haystack: &str, codes: &[&str]) -> bool {
    haystack
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| codes.contains(&token))
}

/// Categorize a failure by its message text.
///
/// Used for free-form downstream messages. Typed failures go through
/// [`classify_error`].
pub fn categorize(message: &str) -> ErrorCategory {
    let m = message.to_lowercase();

    if m.contains("cancel") {
        ErrorCategory::Cancelled
    } else if contains_any(&m, &["invalid", "validation", "malformed"]) {
        ErrorCategory::Validation
    } else if contains_any(&m, &["unauthorized", "authentication", "forbidden", "api key"])
        || has_code(&m, &["401", "403"])
    {
        ErrorCategory::Authentication
    } else if contains_any(&m, &["rate limit", "rate_limit", "too many requests", "quota"])
        || has_code(&m, &["429"])
    {
        ErrorCategory::RateLimit
    } else if contains_any(&m, &["timeout", "timed out", "deadline"]) {
        ErrorCategory::Timeout
    } else if contains_any(&m, &["network", "connection", "econnreset", "econnrefused", "socket", "dns"]) {
        ErrorCategory::Network
    } else if m.contains("expired") {
        ErrorCategory::Expired
    } else if contains_any(&m, &["api", "server error", "overload", "capacity"])
        || has_code(&m, &["500", "502", "503"])
    {
        ErrorCategory::ApiError
    } else {
        ErrorCategory::Other
    }
}

/// Category plus the recoverability verdict for one failure message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureClassification {
    pub category: ErrorCategory,
    pub recoverable: bool,
}

impl FailureClassification {
    fn of(category: ErrorCategory, detail: &str) -> Self {
        let recoverable =
            !category.is_permanent() && !contains_any(&detail.to_lowercase(), &NON_RECOVERABLE_PATTERNS);
        Self { category, recoverable }
    }
}

pub fn classify(message: &str) -> FailureClassification {
    FailureClassification::of(categorize(message), message)
}

/// Classify a typed invocation failure.
///
/// The variant decides the category; only `Failed` carries raw downstream
/// text that needs [`categorize`]. Timeouts and transport errors are always
/// transient, whatever their message contains.
pub fn classify_error(error: &AiError) -> FailureClassification {
    match error {
        AiError::Timeout { .. } => FailureClassification {
            category: ErrorCategory::Timeout,
            recoverable: true,
        },
        AiError::Network(_) => FailureClassification {
            category: ErrorCategory::Network,
            recoverable: true,
        },
        AiError::RateLimited(detail) => FailureClassification::of(ErrorCategory::RateLimit, detail),
        AiError::Authentication(detail) => FailureClassification::of(ErrorCategory::Authentication, detail),
        AiError::InvalidInput(detail) => FailureClassification::of(ErrorCategory::Validation, detail),
        AiError::Api(detail) => FailureClassification::of(ErrorCategory::ApiError, detail),
        AiError::Failed(message) => classify(message),
    }
}

/// Retry limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum RetryAction {
    Retry { after: Duration },
    GiveUp,
}

/// Decides what happens after a failed attempt.
#[derive(Debug, Clone, Default)]
pub struct RetryScheduler {
    config: RetryConfig,
}

impl RetryScheduler {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// `2^retry_count * base_delay`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count);
        self.config.base_delay.saturating_mul(factor)
    }

    /// `retry_count` is the number of retries already used.
    pub fn next_action(&self, failure: &FailureClassification, retry_count: u32) -> RetryAction {
        if !failure.recoverable || retry_count >= self.config.max_retries {
            return RetryAction::GiveUp;
        }
        RetryAction::Retry {
            after: self.backoff(retry_count),
        }
    }
}
