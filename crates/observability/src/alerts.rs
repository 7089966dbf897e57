//! Alerting boundary.
//!
//! Components that detect operational trouble (circuit breakers tripping, a
//! rollout regressing) raise alerts through an [`AlertDispatcher`]. Dispatch is
//! fire-and-forget: it never blocks the caller and never turns a delivery
//! problem into a caller-visible error.
//!
//! ```text
//! breaker / rollout gate
//!        │ raise()          (try_send, bounded)
//!        ▼
//!   AlertDispatcher ──────► AlertReceiver task ──────► AlertSink
//!                                               (errors logged, dropped)
//! ```

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default capacity of the dispatch channel.
pub const DEFAULT_ALERT_CAPACITY: usize = 256;

/// Severity of an alert.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operational alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub level: AlertLevel,
    pub message: String,
    /// Service (dependency or feature flag) the alert is about.
    pub service: String,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(level: AlertLevel, message: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            level,
            message: message.into(),
            service: service.into(),
            raised_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AlertError {
    #[error("alert queue is full")]
    QueueFull,
    #[error("alert dispatcher is closed")]
    Closed,
    #[error("alert sink failed: {0}")]
    Sink(String),
}

/// Destination for alerts (pager, chat webhook, ...).
#[async_trait]
pub trait AlertSink: Send + Sync + 'static {
    async fn raise_alert(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Cheap-to-clone handle used by emitters.
#[derive(Debug, Clone)]
pub struct AlertDispatcher {
    tx: mpsc::Sender<Alert>,
}

/// Receiving half; drains alerts into a sink.
#[derive(Debug)]
pub struct AlertReceiver {
    rx: mpsc::Receiver<Alert>,
}

impl AlertDispatcher {
    /// Create a bounded dispatcher/receiver pair.
    pub fn channel(capacity: usize) -> (Self, AlertReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, AlertReceiver { rx })
    }

    /// Create a dispatcher and spawn the delivery task on the current tokio runtime.
    pub fn spawn<S: AlertSink>(sink: Arc<S>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (dispatcher, receiver) = Self::channel(capacity);
        let handle = tokio::spawn(receiver.run(sink));
        (dispatcher, handle)
    }

    /// A dispatcher with nobody listening. Every dispatch fails (and is swallowed by `raise`).
    pub fn disconnected() -> Self {
        let (dispatcher, _receiver) = Self::channel(1);
        dispatcher
    }

    /// Enqueue an alert without waiting.
    pub fn dispatch(&self, alert: Alert) -> Result<(), AlertError> {
        self.tx.try_send(alert).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => AlertError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => AlertError::Closed,
        })
    }

    /// Best-effort raise: failures are logged and swallowed.
    ///
    /// Returns whether the alert was accepted by the channel.
    pub fn raise(&self, level: AlertLevel, message: impl Into<String>, service: impl Into<String>) -> bool {
        let alert = Alert::new(level, message, service);
        let (alert_id, service) = (alert.id, alert.service.clone());
        match self.dispatch(alert) {
            Ok(()) => {
                debug!(alert_id = %alert_id, service = %service, level = %level, "alert queued");
                true
            }
            Err(e) => {
                warn!(service = %service, level = %level, error = %e, "alert dropped");
                false
            }
        }
    }
}

impl AlertReceiver {
    /// Take the next queued alert without waiting (tests/dev).
    pub fn try_recv(&mut self) -> Option<Alert> {
        self.rx.try_recv().ok()
    }

    /// Drain every alert currently queued.
    pub fn drain(&mut self) -> Vec<Alert> {
        let mut out = Vec::new();
        while let Some(alert) = self.try_recv() {
            out.push(alert);
        }
        out
    }

    /// Deliver alerts to `sink` until every dispatcher handle is dropped.
    pub async fn run<S: AlertSink>(mut self, sink: Arc<S>) {
        while let Some(alert) = self.rx.recv().await {
            if let Err(e) = sink.raise_alert(&alert).await {
                error!(alert_id = %alert.id, service = %alert.service, error = %e, "alert delivery failed");
            }
        }
        debug!("alert receiver stopped");
    }
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAlertSink {
    inner: Mutex<Vec<Alert>>,
    fail: std::sync::atomic::AtomicBool,
}

impl InMemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent delivery fail (alerts are not recorded).
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn all(&self) -> Vec<Alert> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl AlertSink for InMemoryAlertSink {
    async fn raise_alert(&self, alert: &Alert) -> Result<(), AlertError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(AlertError::Sink("sink unavailable".to_string()));
        }
        self.inner
            .lock()
            .map_err(|_| AlertError::Sink("poisoned".to_string()))?
            .push(alert.clone());
        Ok(())
    }
}

/// Sink that only writes alerts to the log.
#[derive(Debug, Default, Copy, Clone)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn raise_alert(&self, alert: &Alert) -> Result<(), AlertError> {
        match alert.level {
            AlertLevel::Critical => error!(service = %alert.service, alert_id = %alert.id, "{}", alert.message),
            AlertLevel::Warning => warn!(service = %alert.service, alert_id = %alert.id, "{}", alert.message),
            AlertLevel::Info => info!(service = %alert.service, alert_id = %alert.id, "{}", alert.message),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_queues_without_a_runtime() {
        let (dispatcher, mut receiver) = AlertDispatcher::channel(4);
        assert!(dispatcher.raise(AlertLevel::Warning, "failure rate rising", "ai-analysis"));

        let alert = receiver.try_recv().unwrap();
        assert_eq!(alert.level, AlertLevel::Warning);
        assert_eq!(alert.service, "ai-analysis");
    }

    #[test]
    fn full_queue_is_swallowed() {
        let (dispatcher, mut receiver) = AlertDispatcher::channel(1);
        assert!(dispatcher.raise(AlertLevel::Info, "first", "svc"));
        assert!(!dispatcher.raise(AlertLevel::Info, "second", "svc"));
        assert_eq!(receiver.drain().len(), 1);
    }

    #[test]
    fn disconnected_dispatcher_reports_closed() {
        let dispatcher = AlertDispatcher::disconnected();
        let err = dispatcher
            .dispatch(Alert::new(AlertLevel::Critical, "down", "svc"))
            .unwrap_err();
        assert_eq!(err, AlertError::Closed);
        assert!(!dispatcher.raise(AlertLevel::Critical, "down", "svc"));
    }

    #[tokio::test]
    async fn receiver_delivers_to_sink() {
        let sink = Arc::new(InMemoryAlertSink::new());
        let (dispatcher, handle) = AlertDispatcher::spawn(sink.clone(), 8);

        dispatcher.raise(AlertLevel::Critical, "breaker opened", "ai-analysis");
        drop(dispatcher);
        handle.await.unwrap();

        let alerts = sink.all();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].message, "breaker opened");
    }

    #[tokio::test]
    async fn sink_failures_do_not_stop_delivery() {
        let sink = Arc::new(InMemoryAlertSink::new());
        sink.set_failing(true);
        let (dispatcher, mut receiver) = AlertDispatcher::channel(8);
        dispatcher.raise(AlertLevel::Warning, "lost", "svc");

        let alert = receiver.try_recv().unwrap();
        assert!(sink.raise_alert(&alert).await.is_err());

        sink.set_failing(false);
        dispatcher.raise(AlertLevel::Warning, "kept", "svc");
        drop(dispatcher);
        receiver.run(sink.clone()).await;
        assert_eq!(sink.all().len(), 1);
    }
}
