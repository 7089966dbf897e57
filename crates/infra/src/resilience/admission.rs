//! Admission control for new submissions.
//!
//! Policy, in order:
//! 1. Hard cap: `queue_depth >= capacity_limit` rejects everything, urgent included.
//! 2. Urgent fast path: urgent work is admitted while capacity utilization < 98%.
//! 3. Otherwise the per-priority threshold, lowered by the current backpressure
//!    level and floored at 50%, decides.

use serde::{Deserialize, Serialize};

use inferq_core::Priority;

use super::backpressure::{BackpressureLevel, backpressure_level};
use crate::jobs::counters::LoadSnapshot;

/// Why an admission decision came out the way it did.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionReason {
    AtCapacity,
    UrgentFastPath,
    WithinThreshold,
    Backpressure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: AdmissionReason,
    pub message: String,
    pub capacity_utilization: f64,
    /// Computed only when the threshold rule ran.
    pub level: Option<BackpressureLevel>,
    pub threshold: Option<f64>,
}

/// Threshold configuration. Defaults are the production policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionPolicy {
    pub urgent_threshold: f64,
    pub high_threshold: f64,
    pub normal_threshold: f64,
    /// Urgent jobs bypass thresholds below this utilization.
    pub urgent_fast_path_limit: f64,
    pub threshold_floor: f64,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            urgent_threshold: 95.0,
            high_threshold: 85.0,
            normal_threshold: 75.0,
            urgent_fast_path_limit: 98.0,
            threshold_floor: 50.0,
        }
    }
}

/// How much each backpressure level lowers the admission threshold.
pub fn threshold_adjustment(level: BackpressureLevel) -> f64 {
    match level {
        BackpressureLevel::None => 0.0,
        BackpressureLevel::Light => -5.0,
        BackpressureLevel::Moderate => -10.0,
        BackpressureLevel::Heavy => -15.0,
        BackpressureLevel::Critical => -20.0,
    }
}

/// Stateless admission controller.
#[derive(Debug, Clone, Default)]
pub struct AdmissionController {
    policy: AdmissionPolicy,
}

impl AdmissionController {
    pub fn new(policy: AdmissionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    fn base_threshold(&self, priority: Priority) -> f64 {
        match priority {
            Priority::Urgent => self.policy.urgent_threshold,
            Priority::High => self.policy.high_threshold,
            Priority::Normal => self.policy.normal_threshold,
        }
    }

    /// Effective threshold for `priority` under `level`.
    pub fn threshold(&self, priority: Priority, level: BackpressureLevel) -> f64 {
        (self.base_threshold(priority) + threshold_adjustment(level)).max(self.policy.threshold_floor)
    }

    /// Decide whether a job of `priority` may enter the queue right now.
    ///
    /// No side effects; the caller enqueues.
    pub fn admit(&self, priority: Priority, load: &LoadSnapshot) -> AdmissionDecision {
        let capacity_utilization = load.capacity_utilization();

        if load.at_capacity() {
            return AdmissionDecision {
                allowed: false,
                reason: AdmissionReason::AtCapacity,
                message: "queue at maximum capacity".to_string(),
                capacity_utilization,
                level: None,
                threshold: None,
            };
        }

        if priority == Priority::Urgent && capacity_utilization < self.policy.urgent_fast_path_limit {
            return AdmissionDecision {
                allowed: true,
                reason: AdmissionReason::UrgentFastPath,
                message: "urgent job admitted".to_string(),
                capacity_utilization,
                level: None,
                threshold: None,
            };
        }

        let level = backpressure_level(capacity_utilization, load.processing_utilization());
        let threshold = self.threshold(priority, level);

        if capacity_utilization <= threshold {
            AdmissionDecision {
                allowed: true,
                reason: AdmissionReason::WithinThreshold,
                message: format!(
                    "admitted at {capacity_utilization:.1}% utilization (threshold {threshold:.0}%)"
                ),
                capacity_utilization,
                level: Some(level),
                threshold: Some(threshold),
            }
        } else {
            AdmissionDecision {
                allowed: false,
                reason: AdmissionReason::Backpressure,
                message: format!(
                    "{level} backpressure: utilization {capacity_utilization:.1}% exceeds {threshold:.0}% threshold for {priority} priority"
                ),
                capacity_utilization,
                level: Some(level),
                threshold: Some(threshold),
            }
        }
    }
}
