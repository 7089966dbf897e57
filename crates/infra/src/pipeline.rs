//! The analysis pipeline facade.
//!
//! `Pipeline` wires admission, overflow handling, the queue store, circuit
//! breakers, retry scheduling, dead letters, the rollout gate, and metrics
//! together. Submitters get an immediate accept/reject; outcomes are observed
//! by polling [`Pipeline::get`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use inferq_ai::{AiError, AiInvoker, AnalysisRequest};
use inferq_core::{Clock, CoreError, JobId, Priority, SystemClock};
use inferq_observability::AlertDispatcher;

use crate::config::{ConfigError, PipelineConfig};
use crate::jobs::counters::{LoadCounters, LoadSnapshot};
use crate::jobs::dead_letter::{
    DeadLetterEntry, DeadLetterError, DeadLetterResolution, DeadLetterStore, InMemoryDeadLetterStore,
};
use crate::jobs::store::{InMemoryQueueStore, QueueFilter, QueueStore, QueueStoreError};
use crate::jobs::types::{NewJob, QueueItem, QueueStatus};
use crate::metrics::engine::{QueueMetricsEngine, QueueSnapshot};
use crate::metrics::export::{ExportError, ExportFormat, MetricsExporter};
use crate::resilience::admission::{AdmissionController, AdmissionDecision, AdmissionReason};
use crate::resilience::backpressure::backpressure_level;
use crate::resilience::circuit_breaker::{
    BreakerStatusStore, CircuitBreakerRegistry, CircuitBreakerStatus, InMemoryBreakerStatusStore,
};
use crate::resilience::overflow::{overflow_action, OverflowAction};
use crate::resilience::retry::{classify_error, RetryAction, RetryScheduler};
use crate::rollout::gate::RolloutGate;
use crate::rollout::metric::{InMemoryRolloutMetricStore, RolloutMetricStore};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Queue(#[from] QueueStoreError),
    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Transition(#[from] CoreError),
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("queue at maximum capacity")]
    AtCapacity,
}

/// How a submission was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "disposition")]
pub enum Disposition {
    Admitted,
    /// Accepted but not claimable for `delay_ms`.
    Delayed { delay_ms: u64 },
    /// Accepted at a higher priority than requested.
    Upgraded { from: Priority, to: Priority },
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitOutcome {
    pub accepted: bool,
    pub job_id: Option<JobId>,
    pub disposition: Disposition,
    pub reason: String,
    pub admission: AdmissionDecision,
}

impl SubmitOutcome {
    fn rejected(admission: AdmissionDecision, reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            job_id: None,
            disposition: Disposition::Rejected,
            reason: reason.into(),
            admission,
        }
    }
}

/// Result of running one claimed item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ProcessOutcome {
    Completed { job_id: JobId, dependency: String, elapsed_ms: u64 },
    RetryScheduled { job_id: JobId, retry_count: u32, delay_ms: u64 },
    DeadLettered { job_id: JobId, reason: String },
    /// The dependency's breaker was open; the item waits without spending a retry.
    Deferred { job_id: JobId, dependency: String },
    Cancelled { job_id: JobId },
}

/// Builder for [`Pipeline`]. Anything not supplied gets an in-memory default.
pub struct PipelineBuilder {
    config: PipelineConfig,
    invoker: Arc<dyn AiInvoker>,
    clock: Option<Arc<dyn Clock>>,
    alerts: Option<AlertDispatcher>,
    queue: Option<Arc<dyn QueueStore>>,
    dead_letters: Option<Arc<dyn DeadLetterStore>>,
    breaker_store: Option<Arc<dyn BreakerStatusStore>>,
    rollout_store: Option<Arc<dyn RolloutMetricStore>>,
}

impl PipelineBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn alerts(mut self, alerts: AlertDispatcher) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn queue_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.queue = Some(store);
        self
    }

    pub fn dead_letter_store(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letters = Some(store);
        self
    }

    pub fn breaker_store(mut self, store: Arc<dyn BreakerStatusStore>) -> Self {
        self.breaker_store = Some(store);
        self
    }

    pub fn rollout_store(mut self, store: Arc<dyn RolloutMetricStore>) -> Self {
        self.rollout_store = Some(store);
        self
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        self.config.validate()?;
        let cfg = self.config;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let alerts = self.alerts.unwrap_or_else(AlertDispatcher::disconnected);
        let queue = self.queue.unwrap_or_else(|| Arc::new(InMemoryQueueStore::new()));
        let dead_letters = self
            .dead_letters
            .unwrap_or_else(|| Arc::new(InMemoryDeadLetterStore::new()));
        let breaker_store = self
            .breaker_store
            .unwrap_or_else(|| Arc::new(InMemoryBreakerStatusStore::new()));
        let rollout_store = self
            .rollout_store
            .unwrap_or_else(|| Arc::new(InMemoryRolloutMetricStore::new()));

        let depth = queue.counts()?.depth();
        let counters = LoadCounters::seeded(
            cfg.admission.capacity_limit,
            cfg.admission.max_concurrent_processing,
            depth,
        );

        Ok(Pipeline {
            admission: AdmissionController::new(cfg.admission.policy.clone()),
            retry: RetryScheduler::new(cfg.retry.clone()),
            breakers: CircuitBreakerRegistry::new(
                cfg.circuit_breaker.clone(),
                clock.clone(),
                alerts.clone(),
                breaker_store,
            ),
            rollout: RolloutGate::new(cfg.rollout.clone(), rollout_store, clock.clone(), alerts),
            metrics: QueueMetricsEngine::new(cfg.metrics.clone(), clock.clone()),
            counters,
            queue,
            dead_letters,
            invoker: self.invoker,
            clock,
            config: cfg,
        })
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    queue: Arc<dyn QueueStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    counters: LoadCounters,
    admission: AdmissionController,
    retry: RetryScheduler,
    breakers: CircuitBreakerRegistry,
    rollout: RolloutGate,
    metrics: QueueMetricsEngine,
    invoker: Arc<dyn AiInvoker>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("load", &self.counters.snapshot())
            .finish_non_exhaustive()
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

impl Pipeline {
    pub fn builder(config: PipelineConfig, invoker: Arc<dyn AiInvoker>) -> PipelineBuilder {
        PipelineBuilder {
            config,
            invoker,
            clock: None,
            alerts: None,
            queue: None,
            dead_letters: None,
            breaker_store: None,
            rollout_store: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn load(&self) -> LoadSnapshot {
        self.counters.snapshot()
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn rollout(&self) -> &RolloutGate {
        &self.rollout
    }

    /// Admission, then overflow handling for anything not admitted outright.
    pub fn submit(&self, job: NewJob) -> Result<SubmitOutcome, PipelineError> {
        let requested = job.priority;
        let load = self.counters.snapshot();
        let admission = self.admission.admit(requested, &load);
        let now = self.clock.now();

        if admission.allowed {
            let item = QueueItem::new(job, now);
            return self.accept(item, Disposition::Admitted, admission);
        }

        if admission.reason == AdmissionReason::AtCapacity {
            debug!(priority = %requested, "submission rejected at capacity");
            let reason = admission.message.clone();
            return Ok(SubmitOutcome::rejected(admission, reason));
        }

        let level = admission
            .level
            .unwrap_or_else(|| backpressure_level(load.capacity_utilization(), load.processing_utilization()));
        let action = overflow_action(requested, level);
        debug!(priority = %requested, level = %level, action = ?action, "overflow disposition");

        match action {
            OverflowAction::Delay { delay_ms } => {
                let item = QueueItem::new(job, now).delayed(Duration::from_millis(delay_ms), now);
                self.accept(item, Disposition::Delayed { delay_ms }, admission)
            }
            OverflowAction::UpgradePriority => {
                let to = requested.upgraded();
                let item = QueueItem::new(job, now).with_priority(to);
                self.accept(item, Disposition::Upgraded { from: requested, to }, admission)
            }
            OverflowAction::Reject => {
                let reason = admission.message.clone();
                Ok(SubmitOutcome::rejected(admission, reason))
            }
        }
    }

    fn accept(
        &self,
        item: QueueItem,
        disposition: Disposition,
        admission: AdmissionDecision,
    ) -> Result<SubmitOutcome, PipelineError> {
        if !self.counters.try_reserve_slot() {
            return Ok(SubmitOutcome::rejected(admission, "queue at maximum capacity"));
        }

        let priority = item.priority;
        let id = match self.queue.enqueue(item) {
            Ok(id) => id,
            Err(e) => {
                self.counters.release_slot();
                return Err(e.into());
            }
        };

        info!(job_id = %id, priority = %priority, disposition = ?disposition, "job accepted");
        Ok(SubmitOutcome {
            accepted: true,
            job_id: Some(id),
            disposition,
            reason: admission.message.clone(),
            admission,
        })
    }

    pub fn get(&self, id: JobId) -> Result<Option<QueueItem>, PipelineError> {
        Ok(self.queue.get(id)?)
    }

    pub fn list(&self, filter: &QueueFilter, limit: usize) -> Result<Vec<QueueItem>, PipelineError> {
        Ok(self.queue.list(filter, limit)?)
    }

    /// Cancel a job. Waiting jobs are cancelled immediately; a job already
    /// being processed is flagged and stops at the worker's next suspension point.
    pub fn cancel(&self, id: JobId) -> Result<QueueItem, PipelineError> {
        let now = self.clock.now();
        let mut released = false;
        let item = self.queue.modify(id, &mut |item| {
            if item.status == QueueStatus::Processing {
                item.cancel_requested = true;
                Ok(())
            } else {
                item.mark_cancelled(now)?;
                released = true;
                Ok(())
            }
        })?;

        if released {
            self.counters.release_slot();
            info!(job_id = %id, "job cancelled");
        } else {
            info!(job_id = %id, "cancellation requested for running job");
        }
        Ok(item)
    }

    /// Claim and run the next ready item, if any.
    pub async fn process_one(&self) -> Result<Option<ProcessOutcome>, PipelineError> {
        let Some(item) = self.queue.claim_next(self.clock.now())? else {
            return Ok(None);
        };
        debug!(job_id = %item.id, priority = %item.priority, retry_count = item.retry_count, "claimed job");
        self.run_claimed(item).await.map(Some)
    }

    async fn run_claimed(&self, item: QueueItem) -> Result<ProcessOutcome, PipelineError> {
        let id = item.id;
        if item.cancel_requested {
            return self.finish_cancelled(id);
        }

        let experimental = self.rollout.enabled(&item.user_id);
        let dependency = if experimental {
            self.config.worker.experimental_dependency.clone()
        } else {
            self.config.worker.dependency.clone()
        };

        let permit = match self.breakers.acquire(&dependency) {
            Ok(permit) => permit,
            Err(open) => {
                let dep = dependency.clone();
                self.queue.modify(id, &mut |i| {
                    i.dependency = Some(dep.clone());
                    i.release_until(open.retry_at)
                })?;
                debug!(job_id = %id, dependency = %dependency, retry_at = %open.retry_at, "circuit open, job deferred");
                return Ok(ProcessOutcome::Deferred { job_id: id, dependency });
            }
        };

        let request = AnalysisRequest::new(id, item.user_id, item.content_id.clone(), item.payload.clone());
        let timeout = self.config.worker.call_timeout;

        self.counters.worker_started();
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, self.invoker.invoke(&dependency, &request)).await {
            Ok(result) => result,
            Err(_) => Err(AiError::Timeout {
                after_ms: millis(timeout),
            }),
        };
        let elapsed_ms = millis(started.elapsed());
        self.counters.worker_finished();

        let now = self.clock.now();
        match result {
            Ok(_) => {
                self.breakers.record_success(&dependency, permit);
                if experimental {
                    self.record_rollout(true, elapsed_ms);
                }

                let dep = dependency.clone();
                let updated = self.queue.modify(id, &mut |i| {
                    i.dependency = Some(dep.clone());
                    if i.cancel_requested {
                        i.mark_cancelled(now)
                    } else {
                        i.mark_completed(now)
                    }
                })?;
                self.counters.release_slot();

                if updated.status == QueueStatus::Cancelled {
                    info!(job_id = %id, "job cancelled after call returned");
                    return Ok(ProcessOutcome::Cancelled { job_id: id });
                }
                info!(job_id = %id, dependency = %dependency, elapsed_ms, "job completed");
                Ok(ProcessOutcome::Completed {
                    job_id: id,
                    dependency,
                    elapsed_ms,
                })
            }
            Err(e) => {
                let message = e.to_string();
                let failure = classify_error(&e);
                if failure.category.counts_against_dependency() {
                    self.breakers.record_failure(&dependency, permit);
                } else {
                    self.breakers.release(&dependency, permit);
                }
                if experimental {
                    self.record_rollout(false, elapsed_ms);
                }

                let current = self.queue.get(id)?.ok_or(PipelineError::JobNotFound(id))?;
                if current.cancel_requested {
                    return self.finish_cancelled(id);
                }

                match self.retry.next_action(&failure, current.retry_count) {
                    RetryAction::Retry { after } => {
                        let dep = dependency.clone();
                        let updated = self.queue.modify(id, &mut |i| {
                            i.dependency = Some(dep.clone());
                            i.schedule_retry(message.clone(), after, now)
                        })?;
                        warn!(
                            job_id = %id,
                            category = %failure.category,
                            retry_count = updated.retry_count,
                            delay_ms = millis(after),
                            error = %message,
                            "job failed, retry scheduled"
                        );
                        Ok(ProcessOutcome::RetryScheduled {
                            job_id: id,
                            retry_count: updated.retry_count,
                            delay_ms: millis(after),
                        })
                    }
                    RetryAction::GiveUp => {
                        // Dead letter first. A failed insert must leave the job claimable.
                        let mut dead = current.clone();
                        dead.dependency = Some(dependency.clone());
                        dead.mark_dead_letter(message.clone(), now)?;
                        let entry = DeadLetterEntry::new(dead, failure, now);
                        let reason = entry.dead_letter_reason.clone();
                        match self.dead_letters.insert(entry) {
                            Ok(true) => {}
                            Ok(false) => debug!(job_id = %id, "dead letter already recorded"),
                            Err(e) => {
                                let hold = chrono::Duration::from_std(self.retry.backoff(current.retry_count))
                                    .unwrap_or_default();
                                self.queue.modify(id, &mut |i| i.release_until(now + hold))?;
                                error!(job_id = %id, error = %e, "dead letter write failed, job released");
                                return Err(e.into());
                            }
                        }

                        let dep = dependency.clone();
                        self.queue.modify(id, &mut |i| {
                            i.dependency = Some(dep.clone());
                            i.mark_dead_letter(message.clone(), now)
                        })?;
                        self.counters.release_slot();
                        error!(
                            job_id = %id,
                            reason = %reason,
                            recoverable = failure.recoverable,
                            error = %message,
                            "job dead-lettered"
                        );
                        Ok(ProcessOutcome::DeadLettered { job_id: id, reason })
                    }
                }
            }
        }
    }

    fn finish_cancelled(&self, id: JobId) -> Result<ProcessOutcome, PipelineError> {
        let now = self.clock.now();
        self.queue.modify(id, &mut |i| i.mark_cancelled(now))?;
        self.counters.release_slot();
        info!(job_id = %id, "job cancelled by request");
        Ok(ProcessOutcome::Cancelled { job_id: id })
    }

    fn record_rollout(&self, success: bool, elapsed_ms: u64) {
        if let Err(e) = self.rollout.record_outcome(success, Some(elapsed_ms)) {
            warn!(error = %e, "failed to record rollout outcome");
        }
    }

    pub fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, PipelineError> {
        Ok(self.dead_letters.list(limit)?)
    }

    pub fn dead_letter(&self, id: JobId) -> Result<Option<DeadLetterEntry>, PipelineError> {
        Ok(self.dead_letters.get(id)?)
    }

    /// Operator decision on a dead-lettered job. `Requeue` returns the reset item.
    pub fn resolve_dead_letter(
        &self,
        id: JobId,
        resolution: DeadLetterResolution,
    ) -> Result<Option<QueueItem>, PipelineError> {
        let entry = self
            .dead_letters
            .get(id)?
            .ok_or(DeadLetterError::NotFound(id))?;

        match resolution {
            DeadLetterResolution::Discard => {
                self.dead_letters.remove(id)?;
                info!(job_id = %id, "dead letter discarded");
                Ok(None)
            }
            DeadLetterResolution::Requeue => {
                if !self.counters.try_reserve_slot() {
                    return Err(PipelineError::AtCapacity);
                }
                let now = self.clock.now();
                let requeued = match self.queue.get(id) {
                    Ok(Some(_)) => self.queue.modify(id, &mut |i| {
                        i.reset_for_requeue(now);
                        Ok(())
                    }),
                    Ok(None) => {
                        let mut item = entry.item.clone();
                        item.reset_for_requeue(now);
                        self.queue.enqueue(item.clone()).map(|_| item)
                    }
                    Err(e) => Err(e),
                };
                let item = match requeued {
                    Ok(item) => item,
                    Err(e) => {
                        self.counters.release_slot();
                        return Err(e.into());
                    }
                };
                self.dead_letters.remove(id)?;
                info!(job_id = %id, "dead letter requeued");
                Ok(Some(item))
            }
        }
    }

    /// Drop dead letters older than the configured retention.
    pub fn purge_expired_dead_letters(&self) -> Result<usize, PipelineError> {
        let retention = chrono::Duration::from_std(self.config.dead_letter.retention).unwrap_or_default();
        let purged = self.dead_letters.purge_before(self.clock.now() - retention)?;
        if purged > 0 {
            info!(purged, "expired dead letters purged");
        }
        Ok(purged)
    }

    /// Drop completed, cancelled and dead-lettered jobs that finished before
    /// the job retention window. Dead letters keep their own copy.
    pub fn purge_finished_jobs(&self) -> Result<usize, PipelineError> {
        let retention = chrono::Duration::from_std(self.config.job_retention.finished).unwrap_or_default();
        let purged = self.queue.purge_finished_before(self.clock.now() - retention)?;
        if purged > 0 {
            info!(purged, "finished jobs purged");
        }
        Ok(purged)
    }

    pub fn breaker_statuses(&self) -> Vec<CircuitBreakerStatus> {
        self.breakers.statuses()
    }

    pub fn force_open(&self, dependency: &str) -> CircuitBreakerStatus {
        self.breakers.force_open(dependency)
    }

    pub fn force_close(&self, dependency: &str) -> CircuitBreakerStatus {
        self.breakers.force_close(dependency)
    }

    /// Current dashboard read model.
    pub fn snapshot(&self) -> Result<QueueSnapshot, PipelineError> {
        let filter = QueueFilter::default().queued_after(self.metrics.window_start());
        let items = self.queue.list(&filter, usize::MAX)?;
        let mut snapshot = self.metrics.compute(&items, self.counters.snapshot());
        snapshot.breakers = self.breakers.statuses();
        snapshot.dead_letter_count = self.dead_letters.count()?;
        Ok(snapshot)
    }

    pub fn export_metrics(&self, format: ExportFormat) -> Result<String, PipelineError> {
        let snapshot = self.snapshot()?;
        Ok(MetricsExporter.render(&snapshot, format)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inferq_ai::{AiResult, ScriptedInvoker};
    use inferq_core::{ManualClock, UserId};

    fn pipeline(config: PipelineConfig) -> (Pipeline, Arc<ScriptedInvoker>, Arc<ManualClock>) {
        let invoker = Arc::new(ScriptedInvoker::new());
        let clock = Arc::new(ManualClock::starting_now());
        let pipeline = Pipeline::builder(config, invoker.clone())
            .clock(clock.clone())
            .build()
            .unwrap();
        (pipeline, invoker, clock)
    }

    fn job(priority: Priority) -> NewJob {
        NewJob::new(UserId::new(), "post-1", priority)
    }

    #[tokio::test]
    async fn submit_and_complete() {
        let (pipeline, invoker, _) = pipeline(PipelineConfig::default());
        invoker.push("ai-analysis", Ok(AiResult::new(0.8, 0.9)));

        let outcome = pipeline.submit(job(Priority::Normal)).unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.disposition, Disposition::Admitted);
        assert_eq!(pipeline.load().queue_depth, 1);

        let id = outcome.job_id.unwrap();
        let processed = pipeline.process_one().await.unwrap().unwrap();
        assert!(matches!(processed, ProcessOutcome::Completed { job_id, .. } if job_id == id));

        let item = pipeline.get(id).unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Completed);
        assert!(item.processing_started_at.is_some());
        assert_eq!(pipeline.load().queue_depth, 0);
        assert!(pipeline.process_one().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hard_cap_rejects_even_urgent() {
        let mut config = PipelineConfig::default();
        config.admission.capacity_limit = 2;
        let (pipeline, ..) = pipeline(config);

        assert!(pipeline.submit(job(Priority::Urgent)).unwrap().accepted);
        assert!(pipeline.submit(job(Priority::Urgent)).unwrap().accepted);
        let third = pipeline.submit(job(Priority::Urgent)).unwrap();
        assert!(!third.accepted);
        assert_eq!(third.admission.reason, AdmissionReason::AtCapacity);
    }

    #[tokio::test]
    async fn overflow_delays_normal_work() {
        let mut config = PipelineConfig::default();
        config.admission.capacity_limit = 10;
        let (pipeline, _, clock) = pipeline(config);

        // 8/10 = 80%: moderate pressure, normal threshold 75 - 10 = 65.
        for _ in 0..8 {
            pipeline.submit(job(Priority::Urgent)).unwrap();
        }
        let outcome = pipeline.submit(job(Priority::Normal)).unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.disposition, Disposition::Delayed { delay_ms: 60_000 });

        let item = pipeline.get(outcome.job_id.unwrap()).unwrap().unwrap();
        assert_eq!(item.scheduled_at, Some(clock.now() + chrono::Duration::seconds(60)));
    }

    #[tokio::test]
    async fn cancel_waiting_job_frees_its_slot() {
        let (pipeline, ..) = pipeline(PipelineConfig::default());
        let id = pipeline.submit(job(Priority::High)).unwrap().job_id.unwrap();

        let item = pipeline.cancel(id).unwrap();
        assert_eq!(item.status, QueueStatus::Cancelled);
        assert_eq!(pipeline.load().queue_depth, 0);
        assert!(pipeline.process_one().await.unwrap().is_none());
        assert!(pipeline.cancel(id).is_err());
    }

    #[tokio::test]
    async fn validation_failure_dead_letters_without_retry() {
        let (pipeline, invoker, _) = pipeline(PipelineConfig::default());
        invoker.push("ai-analysis", Err(AiError::InvalidInput("empty content".into())));

        let id = pipeline.submit(job(Priority::Normal)).unwrap().job_id.unwrap();
        let outcome = pipeline.process_one().await.unwrap().unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::DeadLettered {
                job_id: id,
                reason: "validation_non_recoverable".into()
            }
        );

        let entry = pipeline.dead_letter(id).unwrap().unwrap();
        assert!(!entry.recoverable);
        assert_eq!(entry.item.retry_count, 0);
        // Validation errors say nothing about the dependency.
        assert_eq!(pipeline.breakers().status("ai-analysis").failure_count, 0);
    }

    #[tokio::test]
    async fn requeue_resets_the_retry_budget() {
        let (pipeline, invoker, _) = pipeline(PipelineConfig::default());
        invoker.push("ai-analysis", Err(AiError::Authentication("revoked key".into())));
        let id = pipeline.submit(job(Priority::Normal)).unwrap().job_id.unwrap();
        pipeline.process_one().await.unwrap();
        assert_eq!(pipeline.load().queue_depth, 0);

        let item = pipeline
            .resolve_dead_letter(id, DeadLetterResolution::Requeue)
            .unwrap()
            .unwrap();
        assert_eq!(item.status, QueueStatus::Queued);
        assert_eq!(item.retry_count, 0);
        assert!(pipeline.dead_letter(id).unwrap().is_none());
        assert_eq!(pipeline.load().queue_depth, 1);

        let outcome = pipeline.process_one().await.unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn discard_and_purge() {
        let (pipeline, invoker, clock) = pipeline(PipelineConfig::default());
        invoker.push("ai-analysis", Err(AiError::InvalidInput("bad".into())));
        invoker.push("ai-analysis", Err(AiError::InvalidInput("bad".into())));

        let first = pipeline.submit(job(Priority::Normal)).unwrap().job_id.unwrap();
        pipeline.submit(job(Priority::Normal)).unwrap();
        pipeline.process_one().await.unwrap();
        pipeline.process_one().await.unwrap();

        assert_eq!(pipeline.resolve_dead_letter(first, DeadLetterResolution::Discard).unwrap(), None);
        assert!(pipeline.resolve_dead_letter(first, DeadLetterResolution::Discard).is_err());

        clock.advance(Duration::from_secs(8 * 24 * 3600));
        assert_eq!(pipeline.purge_expired_dead_letters().unwrap(), 1);
        assert!(pipeline.dead_letters(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn timeouts_and_transport_errors_retry_whatever_their_text() {
        let mut config = PipelineConfig::default();
        config.worker.call_timeout = Duration::from_millis(40_300);
        let (pipeline, invoker, clock) = pipeline(config);
        invoker.push("ai-analysis", Err(AiError::Timeout { after_ms: 40_300 }));
        invoker.push(
            "ai-analysis",
            Err(AiError::Network(
                "error sending request for url (http://ai.internal:4030/ai-analysis)".into(),
            )),
        );

        let id = pipeline.submit(job(Priority::Normal)).unwrap().job_id.unwrap();
        let first = pipeline.process_one().await.unwrap().unwrap();
        assert!(matches!(first, ProcessOutcome::RetryScheduled { job_id, retry_count: 1, .. } if job_id == id));

        clock.advance(Duration::from_secs(2));
        let second = pipeline.process_one().await.unwrap().unwrap();
        assert!(matches!(second, ProcessOutcome::RetryScheduled { retry_count: 2, .. }));
        assert!(pipeline.dead_letter(id).unwrap().is_none());
    }

    #[derive(Debug, Default)]
    struct UnavailableDeadLetterStore;

    impl DeadLetterStore for UnavailableDeadLetterStore {
        fn insert(&self, _: DeadLetterEntry) -> Result<bool, DeadLetterError> {
            Err(DeadLetterError::Storage("dead letter store unavailable".into()))
        }
        fn get(&self, _: JobId) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
            Ok(None)
        }
        fn list(&self, _: usize) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
            Ok(Vec::new())
        }
        fn remove(&self, id: JobId) -> Result<DeadLetterEntry, DeadLetterError> {
            Err(DeadLetterError::NotFound(id))
        }
        fn purge_before(&self, _: chrono::DateTime<chrono::Utc>) -> Result<usize, DeadLetterError> {
            Ok(0)
        }
        fn count(&self) -> Result<usize, DeadLetterError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn failed_dead_letter_write_keeps_the_job_claimable() {
        let invoker = Arc::new(ScriptedInvoker::new());
        let clock = Arc::new(ManualClock::starting_now());
        let pipeline = Pipeline::builder(PipelineConfig::default(), invoker.clone())
            .clock(clock.clone())
            .dead_letter_store(Arc::new(UnavailableDeadLetterStore))
            .build()
            .unwrap();
        invoker.push("ai-analysis", Err(AiError::InvalidInput("empty content".into())));

        let id = pipeline.submit(job(Priority::Normal)).unwrap().job_id.unwrap();
        let err = pipeline.process_one().await.unwrap_err();
        assert!(matches!(err, PipelineError::DeadLetter(DeadLetterError::Storage(_))));

        let item = pipeline.get(id).unwrap().unwrap();
        assert!(item.status.is_waiting());
        assert_eq!(pipeline.load().queue_depth, 1);

        // Held for one backoff step, then picked up again.
        assert!(pipeline.process_one().await.unwrap().is_none());
        clock.advance(Duration::from_secs(1));
        let outcome = pipeline.process_one().await.unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::Completed { job_id, .. } if job_id == id));
        assert_eq!(pipeline.load().queue_depth, 0);
    }

    #[tokio::test]
    async fn finished_jobs_are_purged_after_retention() {
        let (pipeline, invoker, clock) = pipeline(PipelineConfig::default());
        invoker.push("ai-analysis", Err(AiError::InvalidInput("bad".into())));

        let dead = pipeline.submit(job(Priority::Normal)).unwrap().job_id.unwrap();
        pipeline.process_one().await.unwrap();
        let done = pipeline.submit(job(Priority::Normal)).unwrap().job_id.unwrap();
        pipeline.process_one().await.unwrap();
        let waiting = pipeline.submit(job(Priority::Normal)).unwrap().job_id.unwrap();

        assert_eq!(pipeline.purge_finished_jobs().unwrap(), 0);
        clock.advance(Duration::from_secs(49 * 3600));
        assert_eq!(pipeline.purge_finished_jobs().unwrap(), 2);

        assert!(pipeline.get(done).unwrap().is_none());
        assert!(pipeline.get(dead).unwrap().is_none());
        assert!(pipeline.get(waiting).unwrap().is_some());

        // The dead letter keeps its own copy and can still be requeued.
        let item = pipeline
            .resolve_dead_letter(dead, DeadLetterResolution::Requeue)
            .unwrap()
            .unwrap();
        assert_eq!(item.status, QueueStatus::Queued);
        assert!(pipeline.get(dead).unwrap().is_some());
    }

    #[tokio::test]
    async fn snapshot_includes_breakers_and_dead_letters() {
        let (pipeline, invoker, _) = pipeline(PipelineConfig::default());
        invoker.push("ai-analysis", Err(AiError::InvalidInput("bad".into())));
        pipeline.submit(job(Priority::Normal)).unwrap();
        pipeline.process_one().await.unwrap();
        pipeline.force_open("ai-analysis");

        let snapshot = pipeline.snapshot().unwrap();
        assert_eq!(snapshot.dead_letter_count, 1);
        assert_eq!(snapshot.breakers.len(), 1);
        assert!(pipeline.export_metrics(ExportFormat::Prometheus).unwrap().contains("inferq_dead_letters 1"));
    }
}
