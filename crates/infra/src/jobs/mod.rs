//! Queue model, storage, load counters, dead letters, and the worker pool.
//!
//! ```text
//! submit ──► QueueStore (queued) ──claim──► worker ──► completed
//!                 ▲                            │
//!                 └──── failed (backoff) ◄─────┤
//!                                              └──► DeadLetterStore
//! ```

pub mod counters;
pub mod dead_letter;
pub mod store;
pub mod types;
pub mod worker;

pub use counters::{LoadCounters, LoadSnapshot};
pub use dead_letter::{
    recommendation_for, DeadLetterEntry, DeadLetterError, DeadLetterResolution, DeadLetterStore,
    InMemoryDeadLetterStore,
};
pub use store::{InMemoryQueueStore, QueueCounts, QueueFilter, QueueStore, QueueStoreError};
pub use types::{NewJob, QueueItem, QueueStatus, StatusEvent};
pub use worker::{WorkerPool, WorkerPoolHandle, WorkerStats, WorkerStatsSnapshot};
