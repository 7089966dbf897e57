//! Rollout outcome records and their store.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One evaluated unit of work that ran under a flag. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutMetric {
    pub flag: String,
    pub success: bool,
    pub created_at: DateTime<Utc>,
    pub processing_time_ms: Option<u64>,
}

impl RolloutMetric {
    pub fn new(flag: impl Into<String>, success: bool, created_at: DateTime<Utc>) -> Self {
        Self {
            flag: flag.into(),
            success,
            created_at,
            processing_time_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RolloutStoreError {
    #[error("storage error: {0}")]
    Storage(String),
}

pub trait RolloutMetricStore: Send + Sync {
    fn record(&self, metric: RolloutMetric) -> Result<(), RolloutStoreError>;

    /// The `limit` most recent metrics for `flag`, newest first.
    fn recent(&self, flag: &str, limit: usize) -> Result<Vec<RolloutMetric>, RolloutStoreError>;

    /// Metrics for `flag` created at or after `since`.
    fn since(&self, flag: &str, since: DateTime<Utc>) -> Result<Vec<RolloutMetric>, RolloutStoreError>;

    /// Drop metrics for `flag` that are older than `before` and not among the
    /// `keep_latest` newest. Returns how many were removed.
    fn prune(&self, flag: &str, keep_latest: usize, before: DateTime<Utc>) -> Result<usize, RolloutStoreError>;

    /// Drop every metric for `flag`.
    fn clear(&self, flag: &str) -> Result<usize, RolloutStoreError>;
}

/// In-memory metric store for tests/dev. Insertion order is creation order.
#[derive(Debug, Default)]
pub struct InMemoryRolloutMetricStore {
    metrics: RwLock<Vec<RolloutMetric>>,
}

impl InMemoryRolloutMetricStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> RolloutStoreError {
    RolloutStoreError::Storage("rollout metric store lock poisoned".to_string())
}

impl RolloutMetricStore for InMemoryRolloutMetricStore {
    fn record(&self, metric: RolloutMetric) -> Result<(), RolloutStoreError> {
        self.metrics.write().map_err(|_| poisoned())?.push(metric);
        Ok(())
    }

    fn recent(&self, flag: &str, limit: usize) -> Result<Vec<RolloutMetric>, RolloutStoreError> {
        let metrics = self.metrics.read().map_err(|_| poisoned())?;
        Ok(metrics
            .iter()
            .rev()
            .filter(|m| m.flag == flag)
            .take(limit)
            .cloned()
            .collect())
    }

    fn since(&self, flag: &str, since: DateTime<Utc>) -> Result<Vec<RolloutMetric>, RolloutStoreError> {
        let metrics = self.metrics.read().map_err(|_| poisoned())?;
        Ok(metrics
            .iter()
            .filter(|m| m.flag == flag && m.created_at >= since)
            .cloned()
            .collect())
    }

    fn prune(&self, flag: &str, keep_latest: usize, before: DateTime<Utc>) -> Result<usize, RolloutStoreError> {
        let mut metrics = self.metrics.write().map_err(|_| poisoned())?;
        let mut newer = metrics.iter().filter(|m| m.flag == flag).count();
        let len = metrics.len();
        metrics.retain(|m| {
            if m.flag != flag {
                return true;
            }
            // Walks oldest first, so `newer` counts this one and everything after it.
            let keep = newer <= keep_latest || m.created_at >= before;
            newer -= 1;
            keep
        });
        Ok(len - metrics.len())
    }

    fn clear(&self, flag: &str) -> Result<usize, RolloutStoreError> {
        let mut metrics = self.metrics.write().map_err(|_| poisoned())?;
        let len = metrics.len();
        metrics.retain(|m| m.flag != flag);
        Ok(len - metrics.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_is_newest_first_and_scoped_by_flag() {
        let store = InMemoryRolloutMetricStore::new();
        let t0 = Utc::now();
        store.record(RolloutMetric::new("a", true, t0)).unwrap();
        store.record(RolloutMetric::new("b", false, t0)).unwrap();
        store
            .record(RolloutMetric::new("a", false, t0 + chrono::Duration::seconds(1)))
            .unwrap();

        let recent = store.recent("a", 10).unwrap();
        assert_eq!(recent.len(), 2);
        assert!(!recent[0].success);
        assert_eq!(store.recent("a", 1).unwrap().len(), 1);
        assert_eq!(store.since("a", t0 + chrono::Duration::seconds(1)).unwrap().len(), 1);
    }

    #[test]
    fn prune_keeps_the_newest_and_the_recent() {
        let store = InMemoryRolloutMetricStore::new();
        let t0 = Utc::now();
        for s in 0..20 {
            store
                .record(RolloutMetric::new("a", true, t0 + chrono::Duration::seconds(s)))
                .unwrap();
        }
        store.record(RolloutMetric::new("b", true, t0)).unwrap();

        // Seconds 15..20 are recent; the 8 newest reach back to second 12.
        let removed = store.prune("a", 8, t0 + chrono::Duration::seconds(15)).unwrap();
        assert_eq!(removed, 12);
        let left = store.recent("a", 100).unwrap();
        assert_eq!(left.len(), 8);
        assert_eq!(left.last().unwrap().created_at, t0 + chrono::Duration::seconds(12));
        assert_eq!(store.recent("b", 10).unwrap().len(), 1);

        // Everything newer than the cutoff survives even past `keep_latest`.
        assert_eq!(store.prune("a", 2, t0 + chrono::Duration::seconds(15)).unwrap(), 3);
        assert_eq!(store.recent("a", 100).unwrap().len(), 5);

        assert_eq!(store.clear("a").unwrap(), 5);
        assert!(store.recent("a", 10).unwrap().is_empty());
    }
}
