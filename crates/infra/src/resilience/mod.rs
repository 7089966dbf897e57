//! Load shedding and failure policy.
//!
//! The decision functions here (`backpressure_level`, `overflow_action`,
//! `AdmissionController::admit`, `RetryScheduler::next_action`) are pure and
//! take explicit numeric inputs. The circuit breaker registry is the only
//! stateful piece.

pub mod admission;
pub mod backpressure;
pub mod circuit_breaker;
pub mod overflow;
pub mod retry;

pub use admission::{AdmissionController, AdmissionDecision, AdmissionPolicy, AdmissionReason};
pub use backpressure::{backpressure_level, BackpressureLevel};
pub use circuit_breaker::{
    BreakerCallError, BreakerStatusStore, BreakerStoreError, CallPermit, CircuitBreakerConfig,
    CircuitBreakerRegistry, CircuitBreakerStatus, CircuitOpenError, CircuitState,
    InMemoryBreakerStatusStore,
};
pub use overflow::{overflow_action, overflow_delay, OverflowAction, MAX_OVERFLOW_DELAY};
pub use retry::{
    categorize, classify, classify_error, ErrorCategory, FailureClassification, RetryAction,
    RetryConfig, RetryScheduler,
};
