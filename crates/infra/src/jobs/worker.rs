//! Bounded tokio worker pool.
//!
//! `max_concurrent_processing` tasks each loop on [`Pipeline::process_one`].
//! Claims go through the queue store, so two workers never hold the same item.
//! Shutdown is signalled over a `watch` channel and waits for in-flight items.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::pipeline::{Pipeline, ProcessOutcome};

/// Counters shared by every worker in a pool.
#[derive(Debug, Default)]
pub struct WorkerStats {
    processed: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    deferred: AtomicU64,
    cancelled: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub processed: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub deferred: u64,
    pub cancelled: u64,
    pub errors: u64,
}

impl WorkerStats {
    fn record(&self, outcome: &ProcessOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            ProcessOutcome::Completed { .. } => &self.completed,
            ProcessOutcome::RetryScheduled { .. } => &self.retried,
            ProcessOutcome::DeadLettered { .. } => &self.dead_lettered,
            ProcessOutcome::Deferred { .. } => &self.deferred,
            ProcessOutcome::Cancelled { .. } => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl WorkerPoolHandle {
    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Stop claiming new work and wait for every worker to finish its current item.
    pub async fn shutdown(self) -> WorkerStatsSnapshot {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "worker task panicked");
            }
        }
        let stats = self.stats.snapshot();
        info!(processed = stats.processed, "worker pool stopped");
        stats
    }
}

pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `max_concurrent_processing` workers on the current runtime.
    pub fn spawn(pipeline: Arc<Pipeline>) -> WorkerPoolHandle {
        let size = pipeline.config().admission.max_concurrent_processing;
        let (shutdown, rx) = watch::channel(false);
        let stats = Arc::new(WorkerStats::default());

        let workers = (0..size)
            .map(|worker_id| {
                tokio::spawn(worker_loop(worker_id, pipeline.clone(), rx.clone(), stats.clone()))
            })
            .collect();

        info!(workers = size, "worker pool started");
        WorkerPoolHandle {
            shutdown,
            workers,
            stats,
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    pipeline: Arc<Pipeline>,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<WorkerStats>,
) {
    let poll_interval = pipeline.config().worker.poll_interval;
    debug!(worker_id, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let idle = match pipeline.process_one().await {
            Ok(Some(outcome)) => {
                stats.record(&outcome);
                false
            }
            Ok(None) => true,
            Err(e) => {
                stats.errors.fetch_add(1, Ordering::Relaxed);
                error!(worker_id, error = %e, "job processing failed");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    debug!(worker_id, "worker stopped");
}
