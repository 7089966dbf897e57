//! Tracing, logging, alerting (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Alert sink boundary and the non-blocking dispatcher.
pub mod alerts;

pub use self::tracing::{init_for_tests, LogFormat};

pub use alerts::{
    Alert, AlertDispatcher, AlertError, AlertLevel, AlertReceiver, AlertSink, InMemoryAlertSink,
    LogAlertSink,
};
