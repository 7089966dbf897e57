//! Read-only queue aggregates for dashboards.
//!
//! The engine never mutates queue state. It takes a slice of items plus a load
//! snapshot and returns a [`QueueSnapshot`]; the pipeline attaches breaker and
//! dead-letter information afterwards.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use inferq_core::{Clock, Priority};

use crate::jobs::counters::LoadSnapshot;
use crate::jobs::types::{QueueItem, QueueStatus};
use crate::resilience::circuit_breaker::CircuitBreakerStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Items queued before `now - window` are ignored.
    pub window: Duration,
    pub top_errors: usize,
    /// Waiting longer than this counts as an aging backlog.
    pub aging_threshold: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(24 * 3600),
            top_errors: 10,
            aging_threshold: Duration::from_secs(600),
        }
    }
}

/// Target wait before processing starts.
pub fn sla_target(priority: Priority) -> Duration {
    match priority {
        Priority::Urgent => Duration::from_secs(30),
        Priority::High => Duration::from_secs(120),
        Priority::Normal => Duration::from_secs(600),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PriorityBreakdown {
    pub priority: Option<Priority>,
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_letter: usize,
    pub cancelled: usize,
}

impl PriorityBreakdown {
    fn bump(&mut self, status: QueueStatus) {
        match status {
            QueueStatus::Queued => self.queued += 1,
            QueueStatus::Processing => self.processing += 1,
            QueueStatus::Completed => self.completed += 1,
            QueueStatus::Failed => self.failed += 1,
            QueueStatus::DeadLetter => self.dead_letter += 1,
            QueueStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.processing + self.completed + self.failed + self.dead_letter + self.cancelled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaitBucket {
    pub label: &'static str,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaitTimeStats {
    pub average_ms: f64,
    pub max_ms: u64,
    pub buckets: Vec<WaitBucket>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlaCompliance {
    pub priority: Priority,
    pub target_ms: u64,
    pub samples: usize,
    pub within_target: usize,
    /// 100 when there are no samples.
    pub compliance_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThroughputBucket {
    pub hour: DateTime<Utc>,
    pub completed: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorFrequency {
    pub message: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub score: u8,
    pub status: HealthStatus,
    pub recommendations: Vec<String>,
}

/// Everything the dashboards read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSnapshot {
    pub generated_at: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub load: LoadSnapshot,
    pub capacity_utilization: f64,
    pub processing_utilization: f64,
    pub priorities: Vec<PriorityBreakdown>,
    pub wait_time: WaitTimeStats,
    pub active: usize,
    pub waiting: usize,
    pub sla: Vec<SlaCompliance>,
    pub throughput: Vec<ThroughputBucket>,
    pub top_errors: Vec<ErrorFrequency>,
    /// Completed / (completed + dead-lettered), in percent. 100 with no finished items.
    pub success_rate: f64,
    pub health: HealthReport,
    pub breakers: Vec<CircuitBreakerStatus>,
    pub dead_letter_count: usize,
}

const WAIT_BUCKETS: [(&str, u64); 4] = [
    ("under_30s", 30_000),
    ("30s_to_2m", 120_000),
    ("2m_to_10m", 600_000),
    ("over_10m", u64::MAX),
];

fn millis(d: TimeDelta) -> u64 {
    d.num_milliseconds().max(0) as u64
}

/// Inputs to the health score, kept separate so the thresholds are testable alone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthInputs {
    pub capacity_utilization: f64,
    pub average_wait: Duration,
    pub success_rate: f64,
}

/// Score out of 100 plus status.
pub fn health_score(inputs: &HealthInputs) -> (u8, HealthStatus) {
    let wait_secs = inputs.average_wait.as_secs_f64();
    let mut score: i32 = 100;
    let mut critical = false;
    let mut warning = false;

    if inputs.capacity_utilization > 95.0 {
        score -= 40;
        critical = true;
    } else if inputs.capacity_utilization > 80.0 {
        score -= 20;
        warning = true;
    }

    if wait_secs > 300.0 {
        score -= 30;
        critical = true;
    } else if wait_secs > 120.0 {
        score -= 15;
        warning = true;
    }

    if inputs.success_rate < 90.0 {
        score -= 25;
        critical = true;
    } else if inputs.success_rate < 95.0 {
        score -= 10;
        warning = true;
    }

    let status = if critical {
        HealthStatus::Critical
    } else if warning {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    };
    (score.clamp(0, 100) as u8, status)
}

#[derive(Debug, Clone)]
pub struct QueueMetricsEngine {
    config: MetricsConfig,
    clock: Arc<dyn Clock>,
}

impl QueueMetricsEngine {
    pub fn new(config: MetricsConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        self.clock.now() - TimeDelta::from_std(self.config.window).unwrap_or_default()
    }

    /// Aggregate `items` (already limited to the window by the caller or not;
    /// anything queued before the window start is skipped here).
    pub fn compute(&self, items: &[QueueItem], load: LoadSnapshot) -> QueueSnapshot {
        let now = self.clock.now();
        let window_start = self.window_start();
        let items: Vec<&QueueItem> = items.iter().filter(|i| i.queued_at >= window_start).collect();

        let mut by_priority: BTreeMap<Priority, PriorityBreakdown> = Priority::ALL
            .iter()
            .map(|p| {
                (
                    *p,
                    PriorityBreakdown {
                        priority: Some(*p),
                        ..PriorityBreakdown::default()
                    },
                )
            })
            .collect();
        for item in &items {
            if let Some(b) = by_priority.get_mut(&item.priority) {
                b.bump(item.status);
            }
        }
        let priorities: Vec<PriorityBreakdown> = by_priority.into_values().rev().collect();

        let waiting_items: Vec<&&QueueItem> = items.iter().filter(|i| i.status.is_waiting()).collect();
        let active = items.iter().filter(|i| i.status == QueueStatus::Processing).count();
        let waiting = waiting_items.len();

        let waits: Vec<u64> = waiting_items.iter().map(|i| millis(i.age(now))).collect();
        let average_ms = if waits.is_empty() {
            0.0
        } else {
            waits.iter().sum::<u64>() as f64 / waits.len() as f64
        };
        let max_ms = waits.iter().copied().max().unwrap_or(0);
        let mut buckets: Vec<WaitBucket> = WAIT_BUCKETS
            .iter()
            .map(|(label, _)| WaitBucket { label: *label, count: 0 })
            .collect();
        for w in &waits {
            if let Some(idx) = WAIT_BUCKETS.iter().position(|(_, upper)| w < upper) {
                buckets[idx].count += 1;
            }
        }

        let sla = Priority::ALL
            .iter()
            .map(|p| self.sla_for(*p, &items, now))
            .collect();

        let throughput = Self::throughput(&items);
        let top_errors = self.top_errors(&items);

        let completed = items.iter().filter(|i| i.status == QueueStatus::Completed).count();
        let dead = items.iter().filter(|i| i.status == QueueStatus::DeadLetter).count();
        let success_rate = if completed + dead == 0 {
            100.0
        } else {
            completed as f64 * 100.0 / (completed + dead) as f64
        };

        let capacity_utilization = load.capacity_utilization();
        let inputs = HealthInputs {
            capacity_utilization,
            average_wait: Duration::from_millis(average_ms as u64),
            success_rate,
        };
        let (score, status) = health_score(&inputs);

        let aging_ms = self.config.aging_threshold.as_millis() as u64;
        let aging = waits.iter().filter(|w| **w > aging_ms).count();
        let backlog = items.iter().filter(|i| !i.status.is_terminal()).count();
        let urgent_backlog = items
            .iter()
            .filter(|i| !i.status.is_terminal() && i.priority == Priority::Urgent)
            .count();
        let recommendations = recommendations(&inputs, aging, self.config.aging_threshold, backlog, urgent_backlog);

        QueueSnapshot {
            generated_at: now,
            window_start,
            load,
            capacity_utilization,
            processing_utilization: load.processing_utilization(),
            priorities,
            wait_time: WaitTimeStats {
                average_ms,
                max_ms,
                buckets,
            },
            active,
            waiting,
            sla,
            throughput,
            top_errors,
            success_rate,
            health: HealthReport {
                score,
                status,
                recommendations,
            },
            breakers: Vec::new(),
            dead_letter_count: 0,
        }
    }

    /// Started items are judged by their wait before the most recent claim;
    /// still-waiting items count only once they have already missed the target.
    fn sla_for(&self, priority: Priority, items: &[&QueueItem], now: DateTime<Utc>) -> SlaCompliance {
        let target = sla_target(priority);
        let target_ms = target.as_millis() as u64;
        let mut samples = 0;
        let mut within_target = 0;

        for item in items.iter().filter(|i| i.priority == priority) {
            if let Some(wait) = item.wait_before_start() {
                samples += 1;
                if millis(wait) <= target_ms {
                    within_target += 1;
                }
            } else if item.status.is_waiting() && millis(item.age(now)) > target_ms {
                samples += 1;
            }
        }

        let compliance_percent = if samples == 0 {
            100.0
        } else {
            within_target as f64 * 100.0 / samples as f64
        };
        SlaCompliance {
            priority,
            target_ms,
            samples,
            within_target,
            compliance_percent,
        }
    }

    fn throughput(items: &[&QueueItem]) -> Vec<ThroughputBucket> {
        let mut hours: BTreeMap<DateTime<Utc>, ThroughputBucket> = BTreeMap::new();
        for item in items {
            let Some(done) = item.completed_at else {
                continue;
            };
            let hour = done.duration_trunc(TimeDelta::hours(1)).unwrap_or(done);
            let bucket = hours.entry(hour).or_insert(ThroughputBucket {
                hour,
                completed: 0,
                dead_lettered: 0,
            });
            match item.status {
                QueueStatus::Completed => bucket.completed += 1,
                QueueStatus::DeadLetter => bucket.dead_lettered += 1,
                _ => {}
            }
        }
        hours.into_values().collect()
    }

    fn top_errors(&self, items: &[&QueueItem]) -> Vec<ErrorFrequency> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for item in items {
            if let Some(msg) = item.last_error_message.as_deref() {
                *counts.entry(msg).or_default() += 1;
            }
        }
        let mut errors: Vec<ErrorFrequency> = counts
            .into_iter()
            .map(|(message, count)| ErrorFrequency {
                message: message.to_string(),
                count,
            })
            .collect();
        errors.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.message.cmp(&b.message)));
        errors.truncate(self.config.top_errors);
        errors
    }
}

/// Advisory strings only; nothing acts on these automatically.
fn recommendations(
    inputs: &HealthInputs,
    aging: usize,
    aging_threshold: Duration,
    backlog: usize,
    urgent_backlog: usize,
) -> Vec<String> {
    let mut out = Vec::new();
    let wait_secs = inputs.average_wait.as_secs_f64();

    if inputs.capacity_utilization > 95.0 {
        out.push("Queue is at critical capacity: add workers or shed normal-priority load".to_string());
    } else if inputs.capacity_utilization > 80.0 {
        out.push("Queue capacity above 80%: consider scaling workers".to_string());
    }

    if wait_secs > 300.0 {
        out.push("Average wait exceeds 5 minutes: increase processing concurrency".to_string());
    } else if wait_secs > 120.0 {
        out.push("Average wait exceeds 2 minutes: monitor worker throughput".to_string());
    }

    if inputs.success_rate < 90.0 {
        out.push("Success rate below 90%: inspect top errors and dependency health".to_string());
    } else if inputs.success_rate < 95.0 {
        out.push("Success rate below 95%: review recent failures".to_string());
    }

    if aging > 0 {
        out.push(format!(
            "{aging} jobs waiting longer than {} minutes: check for stuck workers or open breakers",
            aging_threshold.as_secs() / 60
        ));
    }

    if backlog > 0 && urgent_backlog as f64 / backlog as f64 > 0.3 {
        out.push(format!(
            "Urgent jobs make up {:.0}% of the backlog: review priority assignment",
            urgent_backlog as f64 * 100.0 / backlog as f64
        ));
    }

    out
}
