//! Shared load counters read by admission decisions.
//!
//! Decision functions stay pure; the only shared mutable state they consult is
//! a point-in-time [`LoadSnapshot`] taken from these atomics.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

/// Live queue depth and worker activity.
#[derive(Debug)]
pub struct LoadCounters {
    /// Non-terminal items currently held by the queue (waiting + processing).
    queue_depth: AtomicUsize,
    /// Workers currently executing a downstream call.
    active_workers: AtomicUsize,
    capacity_limit: usize,
    max_workers: usize,
}

/// Point-in-time view of the counters.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct LoadSnapshot {
    pub queue_depth: usize,
    pub capacity_limit: usize,
    pub active_workers: usize,
    pub max_workers: usize,
}

impl LoadSnapshot {
    /// `queue_depth / capacity_limit * 100`. A zero limit reads as full.
    pub fn capacity_utilization(&self) -> f64 {
        utilization(self.queue_depth, self.capacity_limit)
    }

    /// `active_workers / max_workers * 100`. Zero workers reads as full.
    pub fn processing_utilization(&self) -> f64 {
        utilization(self.active_workers, self.max_workers)
    }

    pub fn at_capacity(&self) -> bool {
        self.queue_depth >= self.capacity_limit
    }
}

fn utilization(used: usize, limit: usize) -> f64 {
    if limit == 0 {
        return 100.0;
    }
    used as f64 * 100.0 / limit as f64
}

impl LoadCounters {
    pub fn new(capacity_limit: usize, max_workers: usize) -> Self {
        Self {
            queue_depth: AtomicUsize::new(0),
            active_workers: AtomicUsize::new(0),
            capacity_limit,
            max_workers,
        }
    }

    /// Start from an existing depth (items already held by a durable store).
    pub fn seeded(capacity_limit: usize, max_workers: usize, queue_depth: usize) -> Self {
        let counters = Self::new(capacity_limit, max_workers);
        counters.queue_depth.store(queue_depth, Ordering::SeqCst);
        counters
    }

    pub fn snapshot(&self) -> LoadSnapshot {
        LoadSnapshot {
            queue_depth: self.queue_depth.load(Ordering::SeqCst),
            capacity_limit: self.capacity_limit,
            active_workers: self.active_workers.load(Ordering::SeqCst),
            max_workers: self.max_workers,
        }
    }

    /// Reserve one queue slot unless the queue is at `capacity_limit`.
    ///
    /// Compare-and-swap so concurrent submitters can never push the depth past
    /// the hard cap.
    pub fn try_reserve_slot(&self) -> bool {
        let limit = self.capacity_limit;
        self.queue_depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| {
                (depth < limit).then_some(depth + 1)
            })
            .is_ok()
    }

    /// Release a slot when an item reaches a terminal state (or enqueue failed).
    pub fn release_slot(&self) {
        let _ = self
            .queue_depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| Some(d.saturating_sub(1)));
    }

    pub fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub fn worker_finished(&self) {
        let _ = self
            .active_workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }
}
