//! Dead-letter store for exhausted and non-recoverable jobs.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use inferq_core::JobId;

use super::types::QueueItem;
use crate::resilience::retry::{ErrorCategory, FailureClassification};

/// A job that will not be retried automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub item: QueueItem,
    /// Category-prefixed reason, e.g. `timeout_max_retries_exceeded`.
    pub dead_letter_reason: String,
    pub category: ErrorCategory,
    pub recoverable: bool,
    pub recommendation: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(item: QueueItem, classification: FailureClassification, now: DateTime<Utc>) -> Self {
        let suffix = if classification.recoverable {
            "max_retries_exceeded"
        } else {
            "non_recoverable"
        };
        let dead_letter_reason = format!("{}_{}", classification.category.as_str(), suffix);
        let message = item.last_error_message.clone().unwrap_or_default();
        let recommendation =
            recommendation_for(&dead_letter_reason, &message, classification.recoverable).to_string();

        Self {
            item,
            dead_letter_reason,
            category: classification.category,
            recoverable: classification.recoverable,
            recommendation,
            dead_lettered_at: now,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.item.id
    }
}

/// Operator guidance for a dead-lettered job, derived from its reason and last error.
pub fn recommendation_for(reason: &str, message: &str, recoverable: bool) -> &'static str {
    if !recoverable {
        return "Manual review required: fix the request before requeueing";
    }

    let text = format!("{} {}", reason, message).to_lowercase();
    if text.contains("timeout") || text.contains("timed out") {
        "Retry with increased timeout"
    } else if text.contains("network") {
        "Retry when network conditions improve"
    } else if text.contains("rate_limit") || text.contains("rate limit") {
        "Retry with exponential backoff"
    } else if text.contains("capacity") {
        "Retry during low-load period"
    } else if text.contains("overload") {
        "Retry with reduced priority"
    } else {
        "Retry with standard parameters"
    }
}

/// What an operator decided to do with a dead-lettered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterResolution {
    /// Put the job back in the queue with a fresh retry budget.
    Requeue,
    /// Drop the entry; the job stays terminal.
    Discard,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeadLetterError {
    #[error("dead letter not found: {0}")]
    NotFound(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Dead-letter store abstraction.
pub trait DeadLetterStore: Send + Sync {
    /// Insert an entry keyed by job id.
    ///
    /// Idempotent: re-inserting an existing job id keeps the original entry and
    /// returns `false`.
    fn insert(&self, entry: DeadLetterEntry) -> Result<bool, DeadLetterError>;

    fn get(&self, id: JobId) -> Result<Option<DeadLetterEntry>, DeadLetterError>;

    /// Oldest first.
    fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, DeadLetterError>;

    fn remove(&self, id: JobId) -> Result<DeadLetterEntry, DeadLetterError>;

    /// Drop entries dead-lettered before `cutoff`. Returns how many were removed.
    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DeadLetterError>;

    fn count(&self) -> Result<usize, DeadLetterError>;
}

/// In-memory dead-letter store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    entries: RwLock<HashMap<JobId, DeadLetterEntry>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> DeadLetterError {
    DeadLetterError::Storage("dead letter store lock poisoned".to_string())
}

impl DeadLetterStore for InMemoryDeadLetterStore {
    fn insert(&self, entry: DeadLetterEntry) -> Result<bool, DeadLetterError> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let id = entry.job_id();
        if entries.contains_key(&id) {
            return Ok(false);
        }
        entries.insert(id, entry);
        Ok(true)
    }

    fn get(&self, id: JobId) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.get(&id).cloned())
    }

    fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = entries.values().cloned().collect();
        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    fn remove(&self, id: JobId) -> Result<DeadLetterEntry, DeadLetterError> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.remove(&id).ok_or(DeadLetterError::NotFound(id))
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DeadLetterError> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let before = entries.len();
        entries.retain(|_, e| e.dead_lettered_at >= cutoff);
        Ok(before - entries.len())
    }

    fn count(&self) -> Result<usize, DeadLetterError> {
        Ok(self.entries.read().map_err(|_| poisoned())?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::NewJob;
    use crate::resilience::retry::classify;
    use inferq_core::{Priority, UserId};

    fn failed_item(message: &str) -> QueueItem {
        let mut item = QueueItem::new(NewJob::new(UserId::new(), "post", Priority::Normal), Utc::now());
        item.last_error_message = Some(message.to_string());
        item
    }

    #[test]
    fn exhausted_timeout_is_recoverable_with_timeout_advice() {
        let message = "Request timed out after 30 seconds";
        let entry = DeadLetterEntry::new(failed_item(message), classify(message), Utc::now());

        assert!(entry.dead_letter_reason.contains("timeout"));
        assert!(entry.recoverable);
        assert_eq!(entry.recommendation, "Retry with increased timeout");
    }

    #[test]
    fn validation_failure_is_not_recoverable() {
        let message = "invalid_input: empty body";
        let entry = DeadLetterEntry::new(failed_item(message), classify(message), Utc::now());

        assert_eq!(entry.dead_letter_reason, "validation_non_recoverable");
        assert!(!entry.recoverable);
        assert_eq!(
            entry.recommendation,
            "Manual review required: fix the request before requeueing"
        );
    }

    #[test]
    fn recommendations_follow_reason_keywords() {
        assert_eq!(
            recommendation_for("network_max_retries_exceeded", "", true),
            "Retry when network conditions improve"
        );
        assert_eq!(
            recommendation_for("rate_limit_max_retries_exceeded", "", true),
            "Retry with exponential backoff"
        );
        assert_eq!(
            recommendation_for("api_error_max_retries_exceeded", "model at capacity", true),
            "Retry during low-load period"
        );
        assert_eq!(
            recommendation_for("api_error_max_retries_exceeded", "server overloaded", true),
            "Retry with reduced priority"
        );
        assert_eq!(
            recommendation_for("other_max_retries_exceeded", "boom", true),
            "Retry with standard parameters"
        );
    }

    #[test]
    fn insert_is_idempotent() {
        let store = InMemoryDeadLetterStore::new();
        let message = "network error: reset";
        let entry = DeadLetterEntry::new(failed_item(message), classify(message), Utc::now());

        assert!(store.insert(entry.clone()).unwrap());
        assert!(!store.insert(entry.clone()).unwrap());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn purge_respects_retention_cutoff() {
        let store = InMemoryDeadLetterStore::new();
        let now = Utc::now();
        let message = "boom";
        let old = DeadLetterEntry::new(failed_item(message), classify(message), now - chrono::Duration::days(8));
        let fresh = DeadLetterEntry::new(failed_item(message), classify(message), now);
        store.insert(old).unwrap();
        store.insert(fresh.clone()).unwrap();

        assert_eq!(store.purge_before(now - chrono::Duration::days(7)).unwrap(), 1);
        assert_eq!(store.list(10).unwrap()[0].job_id(), fresh.job_id());
    }
}
