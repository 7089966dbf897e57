//! Staged-rollout gate for the experimental analysis path.
//!
//! Evaluation order for `enabled(user)`:
//!
//! 1. flag off → `false`
//! 2. percent 0 → `false`, percent 100 → `true` (metrics are not consulted)
//! 3. user bucket (`blake3(user) mod 100`) at or above percent → `false`
//! 4. success rate over the last `window_size` outcomes below
//!    `min_success_rate` → `false` + alert
//! 5. if a baseline p95 is configured: trailing p95 above
//!    `baseline + tolerance` → `false` + alert
//!
//! Samples only come from work that ran on the experimental path, so a
//! success-rate disable holds until an operator clears the outcome window
//! with [`RolloutGate::reset_outcomes`]. The latency guard ages out on its
//! own as slow samples leave `latency_window`. While a guard holds, alerts
//! repeat at most once per `alert_cooldown`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use inferq_core::{Clock, UserId};
use inferq_observability::{AlertDispatcher, AlertLevel};

use super::metric::{RolloutMetric, RolloutMetricStore, RolloutStoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutConfig {
    pub flag: String,
    pub enabled: bool,
    /// 0..=100.
    pub rollout_percent: u8,
    /// Number of most recent outcomes the success-rate check looks at.
    pub window_size: usize,
    pub min_success_rate: f64,
    /// Latency guard only runs when this is set.
    pub baseline_p95_ms: Option<u64>,
    pub latency_window: Duration,
    pub latency_tolerance_ms: u64,
    /// Minimum spacing between two alerts for the same reason.
    pub alert_cooldown: Duration,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            flag: "experimental-analysis".to_string(),
            enabled: false,
            rollout_percent: 0,
            window_size: 10,
            min_success_rate: 0.9,
            baseline_p95_ms: None,
            latency_window: Duration::from_secs(600),
            latency_tolerance_ms: 2000,
            alert_cooldown: Duration::from_secs(300),
        }
    }
}

/// Why the gate answered the way it did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum GateReason {
    FlagOff,
    ZeroPercent,
    FullRollout,
    OutsideBucket { bucket: u8 },
    InsideBucket { bucket: u8 },
    SuccessRateLow { success_rate: f64, samples: usize },
    LatencyRegression { p95_ms: u64, limit_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateEvaluation {
    pub enabled: bool,
    pub reason: GateReason,
}

impl GateEvaluation {
    fn on(reason: GateReason) -> Self {
        Self { enabled: true, reason }
    }

    fn off(reason: GateReason) -> Self {
        Self { enabled: false, reason }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
enum AlertKind {
    SuccessRate,
    Latency,
}

/// Deterministic rollout bucket in `[0, 100)` for a user.
pub fn bucket_for(user: &UserId) -> u8 {
    let hash = blake3::hash(user.to_string().as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash.as_bytes()[..8]);
    (u64::from_le_bytes(head) % 100) as u8
}

/// Nearest-rank percentile over unsorted samples.
pub fn percentile(samples: &[u64], pct: f64) -> Option<u64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

pub struct RolloutGate {
    config: RwLock<RolloutConfig>,
    store: Arc<dyn RolloutMetricStore>,
    clock: Arc<dyn Clock>,
    alerts: AlertDispatcher,
    last_alert: Mutex<HashMap<AlertKind, DateTime<Utc>>>,
}

impl std::fmt::Debug for RolloutGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RolloutGate")
            .field("config", &self.config())
            .finish_non_exhaustive()
    }
}

impl RolloutGate {
    pub fn new(
        config: RolloutConfig,
        store: Arc<dyn RolloutMetricStore>,
        clock: Arc<dyn Clock>,
        alerts: AlertDispatcher,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            store,
            clock,
            alerts,
            last_alert: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> RolloutConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn flag(&self) -> String {
        self.config.read().unwrap_or_else(|e| e.into_inner()).flag.clone()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.config.write().unwrap_or_else(|e| e.into_inner()).enabled = enabled;
    }

    pub fn set_rollout_percent(&self, percent: u8) {
        self.config.write().unwrap_or_else(|e| e.into_inner()).rollout_percent = percent.min(100);
    }

    /// Forget recorded outcomes so the guards start from an empty window.
    pub fn reset_outcomes(&self) -> Result<usize, RolloutStoreError> {
        let flag = self.flag();
        let cleared = self.store.clear(&flag)?;
        self.last_alert.lock().unwrap_or_else(|e| e.into_inner()).clear();
        info!(flag = %flag, cleared, "rollout outcomes reset");
        Ok(cleared)
    }

    /// Whether the experimental path runs for `user`. Store failures fail closed.
    pub fn enabled(&self, user: &UserId) -> bool {
        match self.evaluate(user) {
            Ok(evaluation) => evaluation.enabled,
            Err(e) => {
                warn!(user_id = %user, error = %e, "rollout evaluation failed, path disabled");
                false
            }
        }
    }

    pub fn evaluate(&self, user: &UserId) -> Result<GateEvaluation, RolloutStoreError> {
        let config = self.config();

        if !config.enabled {
            return Ok(GateEvaluation::off(GateReason::FlagOff));
        }
        match config.rollout_percent {
            0 => return Ok(GateEvaluation::off(GateReason::ZeroPercent)),
            p if p >= 100 => return Ok(GateEvaluation::on(GateReason::FullRollout)),
            _ => {}
        }

        let bucket = bucket_for(user);
        if bucket >= config.rollout_percent {
            return Ok(GateEvaluation::off(GateReason::OutsideBucket { bucket }));
        }

        if let Some(off) = self.check_success_rate(&config)? {
            return Ok(off);
        }
        if let Some(off) = self.check_latency(&config)? {
            return Ok(off);
        }

        debug!(user_id = %user, flag = %config.flag, bucket, "rollout enabled for user");
        Ok(GateEvaluation::on(GateReason::InsideBucket { bucket }))
    }

    fn check_success_rate(&self, config: &RolloutConfig) -> Result<Option<GateEvaluation>, RolloutStoreError> {
        let window = self.store.recent(&config.flag, config.window_size)?;
        if window.is_empty() {
            return Ok(None);
        }

        let successes = window.iter().filter(|m| m.success).count();
        let success_rate = successes as f64 / window.len() as f64;
        if success_rate >= config.min_success_rate {
            return Ok(None);
        }

        warn!(
            flag = %config.flag,
            success_rate,
            samples = window.len(),
            "rollout success rate below threshold, disabling"
        );
        self.alert_once(
            config,
            AlertKind::SuccessRate,
            format!(
                "{} disabled: success rate {:.1}% over last {} runs",
                config.flag,
                success_rate * 100.0,
                window.len()
            ),
        );
        Ok(Some(GateEvaluation::off(GateReason::SuccessRateLow {
            success_rate,
            samples: window.len(),
        })))
    }

    fn check_latency(&self, config: &RolloutConfig) -> Result<Option<GateEvaluation>, RolloutStoreError> {
        let Some(baseline) = config.baseline_p95_ms else {
            return Ok(None);
        };

        let since = self.clock.now() - chrono::Duration::from_std(config.latency_window).unwrap_or_default();
        let samples: Vec<u64> = self
            .store
            .since(&config.flag, since)?
            .iter()
            .filter_map(|m| m.processing_time_ms)
            .collect();
        let Some(p95_ms) = percentile(&samples, 95.0) else {
            return Ok(None);
        };

        let limit_ms = baseline.saturating_add(config.latency_tolerance_ms);
        if p95_ms <= limit_ms {
            return Ok(None);
        }

        warn!(flag = %config.flag, p95_ms, limit_ms, "rollout latency regression, disabling");
        self.alert_once(
            config,
            AlertKind::Latency,
            format!("{} disabled: p95 {p95_ms}ms exceeds {limit_ms}ms", config.flag),
        );
        Ok(Some(GateEvaluation::off(GateReason::LatencyRegression { p95_ms, limit_ms })))
    }

    fn alert_once(&self, config: &RolloutConfig, kind: AlertKind, message: String) {
        let now = self.clock.now();
        let cooldown = chrono::Duration::from_std(config.alert_cooldown).unwrap_or_default();
        {
            let mut last = self.last_alert.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(at) = last.get(&kind) {
                if now < *at + cooldown {
                    return;
                }
            }
            last.insert(kind, now);
        }
        self.alerts.raise(AlertLevel::Critical, message, config.flag.clone());
    }

    /// Record the outcome of one unit of work that ran under the flag.
    ///
    /// Samples that neither guard can see any more are pruned on the way.
    pub fn record_outcome(&self, success: bool, processing_time_ms: Option<u64>) -> Result<(), RolloutStoreError> {
        let config = self.config();
        let now = self.clock.now();
        let mut metric = RolloutMetric::new(config.flag.clone(), success, now);
        metric.processing_time_ms = processing_time_ms;
        self.store.record(metric)?;

        let horizon = now - chrono::Duration::from_std(config.latency_window).unwrap_or_default();
        self.store.prune(&config.flag, config.window_size, horizon)?;
        Ok(())
    }
}
