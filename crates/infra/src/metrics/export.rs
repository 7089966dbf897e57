//! Render a [`QueueSnapshot`] as Prometheus text, CSV, or JSON.

use prometheus::{Encoder, Gauge, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

use crate::resilience::circuit_breaker::CircuitState;

use super::engine::QueueSnapshot;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("prometheus: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("encoding: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Prometheus,
    Csv,
    Json,
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Prometheus => "text/plain; version=0.0.4; charset=utf-8",
            ExportFormat::Csv => "text/csv; charset=utf-8",
            ExportFormat::Json => "application/json",
        }
    }
}

const NAMESPACE: &str = "inferq";

#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsExporter;

impl MetricsExporter {
    pub fn render(&self, snapshot: &QueueSnapshot, format: ExportFormat) -> Result<String, ExportError> {
        match format {
            ExportFormat::Prometheus => self.to_prometheus(snapshot),
            ExportFormat::Csv => Ok(self.to_csv(snapshot)),
            ExportFormat::Json => self.to_json(snapshot),
        }
    }

    /// Prometheus text exposition, built from a throwaway registry.
    pub fn to_prometheus(&self, snapshot: &QueueSnapshot) -> Result<String, ExportError> {
        let registry = Registry::new_custom(Some(NAMESPACE.to_string()), None)?;

        let gauge = |name: &str, help: &str, value: f64| -> Result<(), ExportError> {
            let g = Gauge::new(name, help)?;
            g.set(value);
            registry.register(Box::new(g))?;
            Ok(())
        };
        let int_gauge = |name: &str, help: &str, value: i64| -> Result<(), ExportError> {
            let g = IntGauge::new(name, help)?;
            g.set(value);
            registry.register(Box::new(g))?;
            Ok(())
        };

        int_gauge("queue_depth", "Non-terminal items held by the queue", snapshot.load.queue_depth as i64)?;
        int_gauge("queue_capacity_limit", "Hard queue capacity", snapshot.load.capacity_limit as i64)?;
        int_gauge("active_workers", "Workers executing a downstream call", snapshot.load.active_workers as i64)?;
        int_gauge("max_workers", "Worker pool size", snapshot.load.max_workers as i64)?;
        gauge(
            "capacity_utilization_percent",
            "Queue depth over capacity limit",
            snapshot.capacity_utilization,
        )?;
        gauge(
            "processing_utilization_percent",
            "Active workers over pool size",
            snapshot.processing_utilization,
        )?;
        gauge("wait_time_avg_ms", "Average age of waiting items", snapshot.wait_time.average_ms)?;
        int_gauge("wait_time_max_ms", "Oldest waiting item age", snapshot.wait_time.max_ms as i64)?;
        gauge("success_rate_percent", "Completed over finished items", snapshot.success_rate)?;
        int_gauge("health_score", "Composite queue health score", snapshot.health.score as i64)?;
        int_gauge("dead_letters", "Entries in the dead-letter store", snapshot.dead_letter_count as i64)?;

        let jobs = IntGaugeVec::new(Opts::new("jobs", "Items by priority and status"), &["priority", "status"])?;
        for row in &snapshot.priorities {
            let priority = row.priority.map(|p| p.as_str()).unwrap_or("all");
            for (status, count) in [
                ("queued", row.queued),
                ("processing", row.processing),
                ("completed", row.completed),
                ("failed", row.failed),
                ("dead_letter", row.dead_letter),
                ("cancelled", row.cancelled),
            ] {
                jobs.with_label_values(&[priority, status]).set(count as i64);
            }
        }
        registry.register(Box::new(jobs))?;

        let waits = IntGaugeVec::new(Opts::new("wait_time_bucket", "Waiting items by age range"), &["range"])?;
        for bucket in &snapshot.wait_time.buckets {
            waits.with_label_values(&[bucket.label]).set(bucket.count as i64);
        }
        registry.register(Box::new(waits))?;

        let sla = GaugeVec::new(Opts::new("sla_compliance_percent", "Share of items started within target"), &["priority"])?;
        for row in &snapshot.sla {
            sla.with_label_values(&[row.priority.as_str()]).set(row.compliance_percent);
        }
        registry.register(Box::new(sla))?;

        let breaker_state = IntGaugeVec::new(
            Opts::new("circuit_breaker_state", "1 for the breaker's current state"),
            &["dependency", "state"],
        )?;
        let breaker_failures = IntGaugeVec::new(
            Opts::new("circuit_breaker_failures", "Consecutive failures per dependency"),
            &["dependency"],
        )?;
        for status in &snapshot.breakers {
            for state in [CircuitState::Closed, CircuitState::Open, CircuitState::HalfOpen] {
                breaker_state
                    .with_label_values(&[status.name.as_str(), state.as_str()])
                    .set(i64::from(status.state == state));
            }
            breaker_failures
                .with_label_values(&[status.name.as_str()])
                .set(status.failure_count as i64);
        }
        registry.register(Box::new(breaker_state))?;
        registry.register(Box::new(breaker_failures))?;

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// One `section,key,value` row per metric.
    pub fn to_csv(&self, snapshot: &QueueSnapshot) -> String {
        let mut rows: Vec<(&str, String, String)> = vec![
            ("load", "queue_depth".into(), snapshot.load.queue_depth.to_string()),
            ("load", "capacity_limit".into(), snapshot.load.capacity_limit.to_string()),
            ("load", "active_workers".into(), snapshot.load.active_workers.to_string()),
            ("load", "max_workers".into(), snapshot.load.max_workers.to_string()),
            ("load", "capacity_utilization".into(), format!("{:.2}", snapshot.capacity_utilization)),
            ("load", "processing_utilization".into(), format!("{:.2}", snapshot.processing_utilization)),
            ("queue", "active".into(), snapshot.active.to_string()),
            ("queue", "waiting".into(), snapshot.waiting.to_string()),
            ("wait_time", "average_ms".into(), format!("{:.0}", snapshot.wait_time.average_ms)),
            ("wait_time", "max_ms".into(), snapshot.wait_time.max_ms.to_string()),
        ];

        for bucket in &snapshot.wait_time.buckets {
            rows.push(("wait_bucket", bucket.label.into(), bucket.count.to_string()));
        }
        for row in &snapshot.priorities {
            let priority = row.priority.map(|p| p.as_str()).unwrap_or("all");
            rows.push(("priority", priority.into(), row.total().to_string()));
        }
        for row in &snapshot.sla {
            rows.push(("sla", row.priority.as_str().into(), format!("{:.2}", row.compliance_percent)));
        }
        for bucket in &snapshot.throughput {
            rows.push((
                "throughput",
                bucket.hour.format("%Y-%m-%dT%H:00Z").to_string(),
                bucket.completed.to_string(),
            ));
        }
        for error in &snapshot.top_errors {
            rows.push(("error", error.message.clone(), error.count.to_string()));
        }
        for status in &snapshot.breakers {
            rows.push(("breaker", status.name.clone(), status.state.as_str().into()));
        }
        rows.push(("dead_letter", "count".into(), snapshot.dead_letter_count.to_string()));
        rows.push(("health", "success_rate".into(), format!("{:.2}", snapshot.success_rate)));
        rows.push(("health", "score".into(), snapshot.health.score.to_string()));
        rows.push(("health", "status".into(), snapshot.health.status.as_str().into()));

        let mut out = String::from("section,key,value\n");
        for (section, key, value) in rows {
            out.push_str(&format!("{},{},{}\n", section, csv_field(&key), csv_field(&value)));
        }
        out
    }

    pub fn to_json(&self, snapshot: &QueueSnapshot) -> Result<String, ExportError> {
        Ok(serde_json::to_string_pretty(snapshot)?)
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
