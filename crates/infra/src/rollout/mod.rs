//! Feature-flag rollout of the experimental analysis path.

pub mod gate;
pub mod metric;

pub use gate::{bucket_for, percentile, GateEvaluation, GateReason, RolloutConfig, RolloutGate};
pub use metric::{InMemoryRolloutMetricStore, RolloutMetric, RolloutMetricStore, RolloutStoreError};
