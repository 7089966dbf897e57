//! Load-based backpressure levels.
//!
//! | Level      | `max(capacity%, processing%)` |
//! |------------|-------------------------------|
//! | `critical` | `>= 95`                       |
//! | `heavy`    | `>= 85`                       |
//! | `moderate` | `>= 70`                       |
//! | `light`    | `>= 50`                       |
//! | `none`     | `< 50`                        |

use serde::{Deserialize, Serialize};

/// Discrete pressure level, ordered from calm to saturated.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureLevel {
    None,
    Light,
    Moderate,
    Heavy,
    Critical,
}

impl BackpressureLevel {
    pub const ALL: [BackpressureLevel; 5] = [
        BackpressureLevel::None,
        BackpressureLevel::Light,
        BackpressureLevel::Moderate,
        BackpressureLevel::Heavy,
        BackpressureLevel::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackpressureLevel::None => "none",
            BackpressureLevel::Light => "light",
            BackpressureLevel::Moderate => "moderate",
            BackpressureLevel::Heavy => "heavy",
            BackpressureLevel::Critical => "critical",
        }
    }

    /// Numeric rank (0..=4), used by gauges.
    pub fn rank(&self) -> i64 {
        *self as i64
    }
}

impl std::fmt::Display for BackpressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map utilization percentages to a level. Pure and deterministic.
pub fn backpressure_level(capacity_utilization: f64, processing_utilization: f64) -> BackpressureLevel {
    let load = capacity_utilization.max(processing_utilization);

    if load >= 95.0 {
        BackpressureLevel::Critical
    } else if load >= 85.0 {
        BackpressureLevel::Heavy
    } else if load >= 70.0 {
        BackpressureLevel::Moderate
    } else if load >= 50.0 {
        BackpressureLevel::Light
    } else {
        BackpressureLevel::None
    }
}
