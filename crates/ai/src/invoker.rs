use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::request::AnalysisRequest;
use crate::result::{AiError, AiResult};

/// Invocation boundary for named dependencies (the AI inference service).
///
/// Implementations perform the actual network call. The pipeline wraps every
/// invocation with a deadline and a circuit breaker keyed by `dependency`.
#[async_trait]
pub trait AiInvoker: Send + Sync + 'static {
    async fn invoke(&self, dependency: &str, request: &AnalysisRequest) -> Result<AiResult, AiError>;
}

/// Deterministic invoker for tests/dev.
///
/// Outcomes are scripted per dependency and consumed in order; once a script
/// runs dry every call succeeds with a neutral result.
#[derive(Debug, Default)]
pub struct ScriptedInvoker {
    scripts: Mutex<HashMap<String, VecDeque<Result<AiResult, AiError>>>>,
    calls: AtomicUsize,
    latency: Mutex<Duration>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome for the next call to `dependency`.
    pub fn push(&self, dependency: impl Into<String>, outcome: Result<AiResult, AiError>) {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(dependency.into())
            .or_default()
            .push_back(outcome);
    }

    /// Queue `times` identical failures for `dependency`.
    pub fn fail_times(&self, dependency: &str, times: usize, error: AiError) {
        for _ in 0..times {
            self.push(dependency, Err(error.clone()));
        }
    }

    /// Make every call take `latency` before answering.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    /// Total number of invocations observed.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AiInvoker for ScriptedInvoker {
    async fn invoke(&self, dependency: &str, _request: &AnalysisRequest) -> Result<AiResult, AiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let next = self
            .scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(dependency)
            .and_then(|q| q.pop_front());

        next.unwrap_or_else(|| Ok(AiResult::new(0.0, 1.0)))
    }
}
