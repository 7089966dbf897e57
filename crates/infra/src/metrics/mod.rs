//! Queue metrics: aggregation and export.

pub mod engine;
pub mod export;

pub use engine::{
    health_score, sla_target, ErrorFrequency, HealthInputs, HealthReport, HealthStatus, MetricsConfig,
    PriorityBreakdown, QueueMetricsEngine, QueueSnapshot, SlaCompliance, ThroughputBucket, WaitBucket,
    WaitTimeStats,
};
pub use export::{ExportError, ExportFormat, MetricsExporter};
