//! Queue storage.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;

use inferq_core::{CoreError, JobId, Priority};

use super::types::{QueueItem, QueueStatus};

/// Range/index filter for listing queue items.
#[derive(Debug, Clone, Default)]
pub struct QueueFilter {
    pub status: Option<QueueStatus>,
    pub priority: Option<Priority>,
    pub queued_after: Option<DateTime<Utc>>,
    pub queued_before: Option<DateTime<Utc>>,
}

impl QueueFilter {
    pub fn status(mut self, status: QueueStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn queued_after(mut self, at: DateTime<Utc>) -> Self {
        self.queued_after = Some(at);
        self
    }

    pub fn queued_before(mut self, at: DateTime<Utc>) -> Self {
        self.queued_before = Some(at);
        self
    }

    pub fn matches(&self, item: &QueueItem) -> bool {
        self.status.is_none_or(|s| item.status == s)
            && self.priority.is_none_or(|p| item.priority == p)
            && self.queued_after.is_none_or(|t| item.queued_at >= t)
            && self.queued_before.is_none_or(|t| item.queued_at < t)
    }
}

/// Queue store abstraction.
///
/// Every method is a single-record atomic operation; no multi-record
/// transactions are assumed.
pub trait QueueStore: Send + Sync {
    /// Insert a new item.
    fn enqueue(&self, item: QueueItem) -> Result<JobId, QueueStoreError>;

    /// Point lookup.
    fn get(&self, id: JobId) -> Result<Option<QueueItem>, QueueStoreError>;

    /// Atomically read-modify-write one item.
    ///
    /// `f` runs under the store's write lock; if it fails nothing is written.
    fn modify(
        &self,
        id: JobId,
        f: &mut dyn FnMut(&mut QueueItem) -> Result<(), CoreError>,
    ) -> Result<QueueItem, QueueStoreError>;

    /// Claim the most urgent ready item, flipping it to `processing`.
    ///
    /// Two concurrent callers never receive the same item.
    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<QueueItem>, QueueStoreError>;

    /// Range scan, ordered by `queued_at`.
    fn list(&self, filter: &QueueFilter, limit: usize) -> Result<Vec<QueueItem>, QueueStoreError>;

    /// Item counts per status.
    fn counts(&self) -> Result<QueueCounts, QueueStoreError>;

    /// Drop terminal items that finished before `cutoff`. Returns how many
    /// were removed.
    fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, QueueStoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error(transparent)]
    Transition(#[from] CoreError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Item counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_letter: usize,
    pub cancelled: usize,
}

impl QueueCounts {
    /// Items still held by the queue (not terminal).
    pub fn depth(&self) -> usize {
        self.queued + self.processing + self.failed
    }

    fn bump(&mut self, status: QueueStatus) {
        match status {
            QueueStatus::Queued => self.queued += 1,
            QueueStatus::Processing => self.processing += 1,
            QueueStatus::Completed => self.completed += 1,
            QueueStatus::Failed => self.failed += 1,
            QueueStatus::DeadLetter => self.dead_letter += 1,
            QueueStatus::Cancelled => self.cancelled += 1,
        }
    }
}

/// In-memory queue store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    items: RwLock<HashMap<JobId, QueueItem>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> QueueStoreError {
    QueueStoreError::Storage("queue store lock poisoned".to_string())
}

impl QueueStore for InMemoryQueueStore {
    fn enqueue(&self, item: QueueItem) -> Result<JobId, QueueStoreError> {
        let mut items = self.items.write().map_err(|_| poisoned())?;
        if items.contains_key(&item.id) {
            return Err(QueueStoreError::AlreadyExists(item.id));
        }
        let id = item.id;
        items.insert(id, item);
        Ok(id)
    }

    fn get(&self, id: JobId) -> Result<Option<QueueItem>, QueueStoreError> {
        let items = self.items.read().map_err(|_| poisoned())?;
        Ok(items.get(&id).cloned())
    }

    fn modify(
        &self,
        id: JobId,
        f: &mut dyn FnMut(&mut QueueItem) -> Result<(), CoreError>,
    ) -> Result<QueueItem, QueueStoreError> {
        let mut items = self.items.write().map_err(|_| poisoned())?;
        let slot = items.get_mut(&id).ok_or(QueueStoreError::NotFound(id))?;

        let mut draft = slot.clone();
        f(&mut draft)?;
        *slot = draft.clone();
        Ok(draft)
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<QueueItem>, QueueStoreError> {
        let mut items = self.items.write().map_err(|_| poisoned())?;

        // Most urgent first, FIFO within a priority.
        let next = items
            .values()
            .filter(|item| item.is_ready(now))
            .min_by(|a, b| b.priority.cmp(&a.priority).then(a.queued_at.cmp(&b.queued_at)))
            .map(|item| item.id);

        let Some(id) = next else {
            return Ok(None);
        };

        let item = items.get_mut(&id).ok_or(QueueStoreError::NotFound(id))?;
        item.mark_processing(now)?;
        Ok(Some(item.clone()))
    }

    fn list(&self, filter: &QueueFilter, limit: usize) -> Result<Vec<QueueItem>, QueueStoreError> {
        let items = self.items.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = items.values().filter(|i| filter.matches(i)).cloned().collect();

        result.sort_by_key(|i| i.queued_at);
        result.truncate(limit);
        Ok(result)
    }

    fn counts(&self) -> Result<QueueCounts, QueueStoreError> {
        let items = self.items.read().map_err(|_| poisoned())?;
        let mut counts = QueueCounts::default();
        for item in items.values() {
            counts.bump(item.status);
        }
        Ok(counts)
    }

    fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, QueueStoreError> {
        let mut items = self.items.write().map_err(|_| poisoned())?;
        let before = items.len();
        items.retain(|_, item| {
            !(item.status.is_terminal() && item.completed_at.is_some_and(|at| at < cutoff))
        });
        Ok(before - items.len())
    }
}
