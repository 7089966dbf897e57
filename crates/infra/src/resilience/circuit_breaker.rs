//! Per-dependency circuit breakers.
//!
//! ```text
//!            failures >= threshold              cooldown elapsed
//!   Closed ───────────────────────► Open ───────────────────────► HalfOpen
//!     ▲                              ▲                               │
//!     │        trial call succeeded  │     trial call failed         │
//!     └──────────────────────────────┼───────────────────────────────┤
//!                                    └───────────────────────────────┘
//! ```
//!
//! Each dependency name owns one `Mutex`-guarded state; the registry map is
//! only write-locked to create a breaker the first time a name is seen, so
//! unrelated dependencies never contend with each other.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use inferq_core::Clock;
use inferq_observability::{AlertDispatcher, AlertLevel};

/// Trip, warning, and cooldown settings shared by every breaker in a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,
    /// Consecutive failures that raise a warning while still closed.
    pub warn_threshold: u32,
    /// Cooldown after the first trip.
    pub base_cooldown: Duration,
    /// Cooldown growth factor for every failed trial call.
    pub cooldown_multiplier: u32,
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            warn_threshold: 3,
            base_cooldown: Duration::from_secs(30),
            cooldown_multiplier: 2,
            max_cooldown: Duration::from_secs(300),
        }
    }
}

impl CircuitBreakerConfig {
    /// `base_cooldown * multiplier^reopen_count`, capped at `max_cooldown`.
    pub fn cooldown(&self, reopen_count: u32) -> Duration {
        let factor = self.cooldown_multiplier.max(1).saturating_pow(reopen_count);
        self.base_cooldown.saturating_mul(factor).min(self.max_cooldown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one breaker, as persisted and reported to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Set only while `open`.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// `state == closed && failure_count < warn_threshold`.
    pub is_healthy: bool,
    /// Held open by an operator.
    pub forced: bool,
    pub updated_at: DateTime<Utc>,
}

/// Returned instead of invoking a dependency whose breaker is open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit open for {name}, retry at {retry_at}")]
pub struct CircuitOpenError {
    pub name: String,
    pub retry_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum BreakerCallError<E> {
    #[error(transparent)]
    Open(#[from] CircuitOpenError),
    #[error(transparent)]
    Inner(E),
}

/// What a caller was granted by [`CircuitBreakerRegistry::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPermit {
    Normal,
    /// The single trial call of a half-open breaker.
    Trial,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BreakerStoreError {
    #[error("storage error: {0}")]
    Storage(String),
}

/// Persistence for breaker snapshots. Upserts are keyed by name and idempotent.
pub trait BreakerStatusStore: Send + Sync {
    fn upsert(&self, status: &CircuitBreakerStatus) -> Result<(), BreakerStoreError>;
    fn get(&self, name: &str) -> Result<Option<CircuitBreakerStatus>, BreakerStoreError>;
    fn list(&self) -> Result<Vec<CircuitBreakerStatus>, BreakerStoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryBreakerStatusStore {
    statuses: RwLock<HashMap<String, CircuitBreakerStatus>>,
}

impl InMemoryBreakerStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> BreakerStoreError {
    BreakerStoreError::Storage("breaker status store lock poisoned".to_string())
}

impl BreakerStatusStore for InMemoryBreakerStatusStore {
    fn upsert(&self, status: &CircuitBreakerStatus) -> Result<(), BreakerStoreError> {
        let mut statuses = self.statuses.write().map_err(|_| poisoned())?;
        statuses.insert(status.name.clone(), status.clone());
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<CircuitBreakerStatus>, BreakerStoreError> {
        Ok(self.statuses.read().map_err(|_| poisoned())?.get(name).cloned())
    }

    fn list(&self) -> Result<Vec<CircuitBreakerStatus>, BreakerStoreError> {
        let statuses = self.statuses.read().map_err(|_| poisoned())?;
        let mut out: Vec<_> = statuses.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    /// failed trial calls since the breaker last closed.
    reopen_count: u32,
    trial_started_at: Option<DateTime<Utc>>,
    forced: bool,
    updated_at: DateTime<Utc>,
}

impl BreakerState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            next_attempt_at: None,
            reopen_count: 0,
            trial_started_at: None,
            forced: false,
            updated_at: now,
        }
    }

    fn open(&mut self, cooldown: Duration, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.next_attempt_at = Some(now + to_chrono(cooldown));
        self.trial_started_at = None;
        self.updated_at = now;
    }

    fn close(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.reopen_count = 0;
        self.next_attempt_at = None;
        self.trial_started_at = None;
        self.forced = false;
        self.updated_at = now;
    }

    fn snapshot(&self, name: &str, warn_threshold: u32) -> CircuitBreakerStatus {
        CircuitBreakerStatus {
            name: name.to_string(),
            state: self.state,
            failure_count: self.failure_count,
            last_failure_at: self.last_failure_at,
            next_attempt_at: self.next_attempt_at,
            is_healthy: self.state == CircuitState::Closed && self.failure_count < warn_threshold,
            forced: self.forced,
            updated_at: self.updated_at,
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_default()
}

/// Registry of named breakers.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    alerts: AlertDispatcher,
    store: Arc<dyn BreakerStatusStore>,
    breakers: RwLock<HashMap<String, Arc<Mutex<BreakerState>>>>,
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerRegistry {
    pub fn new(
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        alerts: AlertDispatcher,
        store: Arc<dyn BreakerStatusStore>,
    ) -> Self {
        Self {
            config,
            clock,
            alerts,
            store,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn breaker(&self, name: &str) -> Arc<Mutex<BreakerState>> {
        {
            let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
            if let Some(b) = breakers.get(name) {
                return b.clone();
            }
        }
        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BreakerState::new(self.clock.now()))))
            .clone()
    }

    /// Run `f` with the named breaker locked, after applying any cooldown expiry.
    fn with_state<R>(&self, name: &str, f: impl FnOnce(&mut BreakerState, DateTime<Utc>) -> R) -> R {
        let breaker = self.breaker(name);
        let mut state = breaker.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now();
        self.refresh(name, &mut state, now);
        f(&mut state, now)
    }

    fn refresh(&self, name: &str, state: &mut BreakerState, now: DateTime<Utc>) {
        if state.state != CircuitState::Open {
            return;
        }
        let Some(next) = state.next_attempt_at else {
            return;
        };
        if now < next {
            return;
        }
        if state.forced {
            state.next_attempt_at = Some(now + to_chrono(self.config.max_cooldown));
            return;
        }

        state.state = CircuitState::HalfOpen;
        state.next_attempt_at = None;
        state.trial_started_at = None;
        state.updated_at = now;
        info!(dependency = %name, "circuit breaker half-open, next call is a trial");
        self.persist(name, state);
    }

    fn persist(&self, name: &str, state: &BreakerState) {
        let status = state.snapshot(name, self.config.warn_threshold);
        if let Err(e) = self.store.upsert(&status) {
            warn!(dependency = %name, error = %e, "failed to persist breaker status");
        }
    }

    /// Ask permission to call `name`.
    pub fn acquire(&self, name: &str) -> Result<CallPermit, CircuitOpenError> {
        let trial_timeout = to_chrono(self.config.base_cooldown);
        self.with_state(name, |state, now| match state.state {
            CircuitState::Closed => Ok(CallPermit::Normal),
            CircuitState::Open => Err(CircuitOpenError {
                name: name.to_string(),
                retry_at: state.next_attempt_at.unwrap_or(now),
            }),
            CircuitState::HalfOpen => match state.trial_started_at {
                // A trial call whose caller never reported back must not wedge the breaker.
                Some(started) if now < started + trial_timeout => Err(CircuitOpenError {
                    name: name.to_string(),
                    retry_at: started + trial_timeout,
                }),
                _ => {
                    state.trial_started_at = Some(now);
                    debug!(dependency = %name, "circuit breaker trial call granted");
                    Ok(CallPermit::Trial)
                }
            },
        })
    }

    pub fn record_success(&self, name: &str, permit: CallPermit) {
        let closed = self.with_state(name, |state, now| match (state.state, permit) {
            (CircuitState::Closed, _) => {
                if state.failure_count > 0 {
                    state.failure_count = 0;
                    state.updated_at = now;
                    self.persist(name, state);
                }
                false
            }
            (CircuitState::HalfOpen, CallPermit::Trial) => {
                state.close(now);
                info!(dependency = %name, "circuit breaker closed after successful trial call");
                self.persist(name, state);
                true
            }
            _ => {
                debug!(dependency = %name, state = %state.state, "late success ignored");
                false
            }
        });

        if closed {
            self.alerts.raise(
                AlertLevel::Info,
                format!("circuit breaker for {name} closed after successful trial call"),
                name,
            );
        }
    }

    pub fn record_failure(&self, name: &str, permit: CallPermit) {
        let cfg = &self.config;
        let alert = self.with_state(name, |state, now| {
            state.failure_count = state.failure_count.saturating_add(1);
            state.last_failure_at = Some(now);
            state.updated_at = now;

            let alert = match (state.state, permit) {
                (CircuitState::Closed, _) if state.failure_count >= cfg.failure_threshold => {
                    state.reopen_count = 0;
                    state.open(cfg.cooldown(0), now);
                    warn!(
                        dependency = %name,
                        failures = state.failure_count,
                        "circuit breaker opened"
                    );
                    Some((
                        AlertLevel::Critical,
                        format!(
                            "circuit breaker for {name} opened after {} consecutive failures",
                            state.failure_count
                        ),
                    ))
                }
                (CircuitState::Closed, _) if state.failure_count == cfg.warn_threshold => Some((
                    AlertLevel::Warning,
                    format!("{name} has failed {} consecutive calls", state.failure_count),
                )),
                (CircuitState::HalfOpen, CallPermit::Trial) => {
                    state.reopen_count = state.reopen_count.saturating_add(1);
                    let cooldown = cfg.cooldown(state.reopen_count);
                    state.open(cooldown, now);
                    warn!(
                        dependency = %name,
                        cooldown_ms = cooldown.as_millis() as u64,
                        "circuit breaker re-opened after failed trial call"
                    );
                    Some((
                        AlertLevel::Critical,
                        format!("circuit breaker for {name} re-opened after failed trial call"),
                    ))
                }
                _ => None,
            };
            self.persist(name, state);
            alert
        });

        if let Some((level, message)) = alert {
            self.alerts.raise(level, message, name);
        }
    }

    /// Give back a permit without a verdict (e.g. the call was never made).
    pub fn release(&self, name: &str, permit: CallPermit) {
        if permit == CallPermit::Trial {
            self.with_state(name, |state, _| {
                if state.state == CircuitState::HalfOpen {
                    state.trial_started_at = None;
                }
            });
        }
    }

    /// Invoke `op` through the named breaker.
    pub async fn call<T, E, F, Fut>(&self, name: &str, op: F) -> Result<T, BreakerCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire(name)?;
        match op().await {
            Ok(v) => {
                self.record_success(name, permit);
                Ok(v)
            }
            Err(e) => {
                self.record_failure(name, permit);
                Err(BreakerCallError::Inner(e))
            }
        }
    }

    /// Hold the breaker open until [`force_close`](Self::force_close).
    pub fn force_open(&self, name: &str) -> CircuitBreakerStatus {
        let status = self.with_state(name, |state, now| {
            state.forced = true;
            state.open(self.config.max_cooldown, now);
            warn!(dependency = %name, "circuit breaker forced open");
            self.persist(name, state);
            state.snapshot(name, self.config.warn_threshold)
        });
        self.alerts.raise(
            AlertLevel::Warning,
            format!("circuit breaker for {name} forced open by operator"),
            name,
        );
        status
    }

    pub fn force_close(&self, name: &str) -> CircuitBreakerStatus {
        let status = self.with_state(name, |state, now| {
            state.close(now);
            info!(dependency = %name, "circuit breaker forced closed");
            self.persist(name, state);
            state.snapshot(name, self.config.warn_threshold)
        });
        self.alerts.raise(
            AlertLevel::Info,
            format!("circuit breaker for {name} forced closed by operator"),
            name,
        );
        status
    }

    pub fn status(&self, name: &str) -> CircuitBreakerStatus {
        let warn = self.config.warn_threshold;
        self.with_state(name, |state, _| state.snapshot(name, warn))
    }

    /// Every breaker seen so far, sorted by name.
    pub fn statuses(&self) -> Vec<CircuitBreakerStatus> {
        let mut names: Vec<String> = {
            let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
            breakers.keys().cloned().collect()
        };
        names.sort();
        names.iter().map(|n| self.status(n)).collect()
    }

    pub fn is_healthy(&self, name: &str) -> bool {
        self.status(name).is_healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inferq_ai::AiError;
    use inferq_core::ManualClock;
    use inferq_observability::AlertReceiver;

    const DEP: &str = "ai-analysis";

    fn registry() -> (CircuitBreakerRegistry, Arc<ManualClock>, AlertReceiver, Arc<InMemoryBreakerStatusStore>) {
        let clock = Arc::new(ManualClock::starting_now());
        let (alerts, rx) = AlertDispatcher::channel(64);
        let store = Arc::new(InMemoryBreakerStatusStore::new());
        let registry = CircuitBreakerRegistry::new(
            CircuitBreakerConfig::default(),
            clock.clone(),
            alerts,
            store.clone(),
        );
        (registry, clock, rx, store)
    }

    fn fail(registry: &CircuitBreakerRegistry, times: u32) {
        for _ in 0..times {
            let permit = registry.acquire(DEP).unwrap();
            registry.record_failure(DEP, permit);
        }
    }

    #[test]
    fn new_breaker_is_closed_and_healthy() {
        let (registry, ..) = registry();
        let status = registry.status(DEP);
        assert_eq!(status.state, CircuitState::Closed);
        assert!(status.is_healthy);
        assert_eq!(status.next_attempt_at, None);
    }

    #[test]
    fn trips_after_threshold_and_fails_fast() {
        let (registry, clock, mut rx, _) = registry();
        fail(&registry, 5);

        let status = registry.status(DEP);
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.next_attempt_at, Some(clock.now() + chrono::Duration::seconds(30)));
        assert!(status.next_attempt_at.unwrap() > clock.now());

        let err = registry.acquire(DEP).unwrap_err();
        assert_eq!(err.name, DEP);

        let levels: Vec<_> = rx.drain().into_iter().map(|a| a.level).collect();
        assert_eq!(levels, vec![AlertLevel::Warning, AlertLevel::Critical]);
    }

    #[test]
    fn round_trip_closed_open_half_open_closed() {
        let (registry, clock, mut rx, store) = registry();
        fail(&registry, 5);
        assert_eq!(registry.status(DEP).state, CircuitState::Open);

        clock.advance(Duration::from_secs(30));
        let permit = registry.acquire(DEP).unwrap();
        assert_eq!(permit, CallPermit::Trial);
        assert_eq!(registry.status(DEP).state, CircuitState::HalfOpen);

        // Only the trial call gets through.
        assert!(registry.acquire(DEP).is_err());

        registry.record_success(DEP, permit);
        let status = registry.status(DEP);
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
        assert!(status.is_healthy);

        let persisted = store.get(DEP).unwrap().unwrap();
        assert_eq!(persisted.state, CircuitState::Closed);
        assert_eq!(rx.drain().last().map(|a| a.level), Some(AlertLevel::Info));
    }

    #[test]
    fn failed_trial_call_reopens_with_longer_cooldown() {
        let (registry, clock, _rx, _) = registry();
        fail(&registry, 5);
        clock.advance(Duration::from_secs(30));

        let permit = registry.acquire(DEP).unwrap();
        registry.record_failure(DEP, permit);

        let status = registry.status(DEP);
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.failure_count, 6);
        assert_eq!(status.next_attempt_at, Some(clock.now() + chrono::Duration::seconds(60)));

        clock.advance(Duration::from_secs(59));
        assert!(registry.acquire(DEP).is_err());
        clock.advance(Duration::from_secs(1));
        assert_eq!(registry.acquire(DEP).unwrap(), CallPermit::Trial);
    }

    #[test]
    fn cooldown_is_capped() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.cooldown(0), Duration::from_secs(30));
        assert_eq!(config.cooldown(2), Duration::from_secs(120));
        assert_eq!(config.cooldown(10), Duration::from_secs(300));
    }

    #[test]
    fn success_in_closed_resets_consecutive_failures() {
        let (registry, ..) = registry();
        fail(&registry, 4);
        assert!(!registry.is_healthy(DEP));
        registry.record_success(DEP, CallPermit::Normal);
        fail(&registry, 4);
        assert_eq!(registry.status(DEP).state, CircuitState::Closed);
    }

    #[test]
    fn forced_open_stays_open_until_forced_closed() {
        let (registry, clock, _rx, _) = registry();
        registry.force_open(DEP);
        clock.advance(Duration::from_secs(3600));

        let status = registry.status(DEP);
        assert_eq!(status.state, CircuitState::Open);
        assert!(status.forced);
        assert!(status.next_attempt_at.unwrap() > clock.now());
        assert!(registry.acquire(DEP).is_err());

        registry.force_close(DEP);
        assert_eq!(registry.acquire(DEP).unwrap(), CallPermit::Normal);
    }

    #[test]
    fn released_trial_call_can_be_retaken() {
        let (registry, clock, _rx, _) = registry();
        fail(&registry, 5);
        clock.advance(Duration::from_secs(30));

        let permit = registry.acquire(DEP).unwrap();
        registry.release(DEP, permit);
        assert_eq!(registry.acquire(DEP).unwrap(), CallPermit::Trial);
    }

    #[test]
    fn breakers_are_independent() {
        let (registry, ..) = registry();
        fail(&registry, 5);
        assert_eq!(registry.acquire("other").unwrap(), CallPermit::Normal);
        assert_eq!(registry.statuses().len(), 2);
    }

    #[test]
    fn alerting_without_a_listener_does_not_affect_state() {
        let clock = Arc::new(ManualClock::starting_now());
        let registry = CircuitBreakerRegistry::new(
            CircuitBreakerConfig::default(),
            clock,
            AlertDispatcher::disconnected(),
            Arc::new(InMemoryBreakerStatusStore::new()),
        );
        fail(&registry, 5);
        assert_eq!(registry.status(DEP).state, CircuitState::Open);
    }

    #[tokio::test]
    async fn call_wraps_the_operation() {
        let (registry, ..) = registry();
        let ok: Result<u32, BreakerCallError<AiError>> = registry.call(DEP, || async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        for _ in 0..5 {
            let _ = registry
                .call(DEP, || async { Err::<u32, _>(AiError::Network("reset".into())) })
                .await;
        }
        let rejected = registry.call(DEP, || async { Ok::<u32, AiError>(1) }).await;
        assert!(matches!(rejected, Err(BreakerCallError::Open(_))));
    }
}
