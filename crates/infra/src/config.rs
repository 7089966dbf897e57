//! Pipeline configuration.
//!
//! Defaults are the production policy. `from_env` overlays `INFERQ_*`
//! variables on top of them.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::engine::MetricsConfig;
use crate::resilience::admission::AdmissionPolicy;
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::retry::RetryConfig;
use crate::rollout::gate::RolloutConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    pub capacity_limit: usize,
    /// Worker pool size.
    pub max_concurrent_processing: usize,
    #[serde(default)]
    pub policy: AdmissionPolicy,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            capacity_limit: 1000,
            max_concurrent_processing: 10,
            policy: AdmissionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Idle sleep between empty polls.
    pub poll_interval: Duration,
    /// Deadline for one downstream call.
    pub call_timeout: Duration,
    pub dependency: String,
    /// Used instead of `dependency` when the rollout gate is on for the user.
    pub experimental_dependency: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            call_timeout: Duration::from_secs(30),
            dependency: "ai-analysis".to_string(),
            experimental_dependency: "ai-analysis-experimental".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    pub retention: Duration,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// How long terminal jobs stay readable in the queue store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRetentionConfig {
    pub finished: Duration,
}

impl Default for JobRetentionConfig {
    fn default() -> Self {
        Self {
            finished: Duration::from_secs(48 * 3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub rollout: RolloutConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
    #[serde(default)]
    pub job_retention: JobRetentionConfig,
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::invalid(key, format!("{raw:?}: {e}")))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::invalid(key, format!("{other:?} is not a boolean"))),
    }
}

impl PipelineConfig {
    /// Defaults overlaid with process environment variables, then validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("INFERQ_CAPACITY_LIMIT") {
            cfg.admission.capacity_limit = parse("INFERQ_CAPACITY_LIMIT", &v)?;
        }
        if let Some(v) = get("INFERQ_MAX_CONCURRENT") {
            cfg.admission.max_concurrent_processing = parse("INFERQ_MAX_CONCURRENT", &v)?;
        }
        if let Some(v) = get("INFERQ_POLL_INTERVAL_MS") {
            cfg.worker.poll_interval = Duration::from_millis(parse("INFERQ_POLL_INTERVAL_MS", &v)?);
        }
        if let Some(v) = get("INFERQ_CALL_TIMEOUT_MS") {
            cfg.worker.call_timeout = Duration::from_millis(parse("INFERQ_CALL_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("INFERQ_DEPENDENCY") {
            cfg.worker.dependency = v;
        }
        if let Some(v) = get("INFERQ_EXPERIMENTAL_DEPENDENCY") {
            cfg.worker.experimental_dependency = v;
        }
        if let Some(v) = get("INFERQ_MAX_RETRIES") {
            cfg.retry.max_retries = parse("INFERQ_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("INFERQ_BREAKER_FAILURE_THRESHOLD") {
            cfg.circuit_breaker.failure_threshold = parse("INFERQ_BREAKER_FAILURE_THRESHOLD", &v)?;
        }
        if let Some(v) = get("INFERQ_BREAKER_COOLDOWN_MS") {
            cfg.circuit_breaker.base_cooldown = Duration::from_millis(parse("INFERQ_BREAKER_COOLDOWN_MS", &v)?);
        }
        if let Some(v) = get("INFERQ_ROLLOUT_FLAG") {
            cfg.rollout.flag = v;
        }
        if let Some(v) = get("INFERQ_ROLLOUT_ENABLED") {
            cfg.rollout.enabled = parse_bool("INFERQ_ROLLOUT_ENABLED", &v)?;
        }
        if let Some(v) = get("INFERQ_ROLLOUT_PERCENT") {
            cfg.rollout.rollout_percent = parse("INFERQ_ROLLOUT_PERCENT", &v)?;
        }
        if let Some(v) = get("INFERQ_BASELINE_P95_MS") {
            cfg.rollout.baseline_p95_ms = Some(parse("INFERQ_BASELINE_P95_MS", &v)?);
        }
        if let Some(v) = get("INFERQ_DEAD_LETTER_RETENTION_HOURS") {
            let hours: u64 = parse("INFERQ_DEAD_LETTER_RETENTION_HOURS", &v)?;
            cfg.dead_letter.retention = Duration::from_secs(hours * 3600);
        }
        if let Some(v) = get("INFERQ_JOB_RETENTION_HOURS") {
            let hours: u64 = parse("INFERQ_JOB_RETENTION_HOURS", &v)?;
            cfg.job_retention.finished = Duration::from_secs(hours * 3600);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admission.capacity_limit == 0 {
            return Err(ConfigError::invalid("admission.capacity_limit", "must be > 0"));
        }
        if self.admission.max_concurrent_processing == 0 {
            return Err(ConfigError::invalid("admission.max_concurrent_processing", "must be > 0"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid("circuit_breaker.failure_threshold", "must be > 0"));
        }
        if self.circuit_breaker.warn_threshold > self.circuit_breaker.failure_threshold {
            return Err(ConfigError::invalid(
                "circuit_breaker.warn_threshold",
                "must not exceed failure_threshold",
            ));
        }
        if self.worker.call_timeout.is_zero() {
            return Err(ConfigError::invalid("worker.call_timeout", "must be > 0"));
        }
        if self.worker.dependency.is_empty() || self.worker.experimental_dependency.is_empty() {
            return Err(ConfigError::invalid("worker.dependency", "must not be empty"));
        }
        if self.rollout.rollout_percent > 100 {
            return Err(ConfigError::invalid("rollout.rollout_percent", "must be within 0..=100"));
        }
        if !(0.0..=1.0).contains(&self.rollout.min_success_rate) {
            return Err(ConfigError::invalid("rollout.min_success_rate", "must be within 0..=1"));
        }
        if self.rollout.window_size == 0 {
            return Err(ConfigError::invalid("rollout.window_size", "must be > 0"));
        }
        // Metrics read finished jobs back out of the store.
        if self.job_retention.finished < self.metrics.window {
            return Err(ConfigError::invalid(
                "job_retention.finished",
                "must cover the metrics window",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = PipelineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.admission.capacity_limit, 1000);
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.circuit_breaker.failure_threshold, 5);
        assert_eq!(cfg.rollout.baseline_p95_ms, None);
    }

    #[test]
    fn env_overlays_defaults() {
        let cfg = PipelineConfig::from_lookup(lookup(&[
            ("INFERQ_CAPACITY_LIMIT", "50"),
            ("INFERQ_CALL_TIMEOUT_MS", "1500"),
            ("INFERQ_ROLLOUT_ENABLED", "true"),
            ("INFERQ_ROLLOUT_PERCENT", "25"),
            ("INFERQ_BASELINE_P95_MS", "800"),
        ]))
        .unwrap();

        assert_eq!(cfg.admission.capacity_limit, 50);
        assert_eq!(cfg.admission.max_concurrent_processing, 10);
        assert_eq!(cfg.worker.call_timeout, Duration::from_millis(1500));
        assert!(cfg.rollout.enabled);
        assert_eq!(cfg.rollout.rollout_percent, 25);
        assert_eq!(cfg.rollout.baseline_p95_ms, Some(800));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = PipelineConfig::from_lookup(lookup(&[("INFERQ_MAX_CONCURRENT", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "INFERQ_MAX_CONCURRENT"));

        let err = PipelineConfig::from_lookup(lookup(&[("INFERQ_ROLLOUT_PERCENT", "140")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "rollout.rollout_percent"));
    }

    #[test]
    fn warn_threshold_cannot_exceed_trip_threshold() {
        let mut cfg = PipelineConfig::default();
        cfg.circuit_breaker.warn_threshold = 9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn job_retention_must_cover_the_metrics_window() {
        let cfg = PipelineConfig::from_lookup(lookup(&[("INFERQ_JOB_RETENTION_HOURS", "72")])).unwrap();
        assert_eq!(cfg.job_retention.finished, Duration::from_secs(72 * 3600));

        let err = PipelineConfig::from_lookup(lookup(&[("INFERQ_JOB_RETENTION_HOURS", "1")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "job_retention.finished"));
    }

    #[test]
    fn deserializes_partial_json() {
        let cfg: PipelineConfig = serde_json::from_str(r#"{"admission":{"capacity_limit":10,"max_concurrent_processing":2}}"#).unwrap();
        assert_eq!(cfg.admission.capacity_limit, 10);
        assert_eq!(cfg.retry, RetryConfig::default());
    }
}
