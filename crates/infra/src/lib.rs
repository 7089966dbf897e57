//! Reliability core of the analysis pipeline: queue, admission, backpressure,
//! circuit breakers, retries, dead letters, rollout gating, and metrics.

pub mod config;
pub mod jobs;
pub mod metrics;
pub mod pipeline;
pub mod resilience;
pub mod rollout;

pub use config::{ConfigError, PipelineConfig};
pub use pipeline::{Disposition, Pipeline, PipelineBuilder, PipelineError, ProcessOutcome, SubmitOutcome};
