//! Cross-component scenarios: submission through processing, retries, breakers,
//! dead letters, and rollout gating.

use std::sync::Arc;
use std::time::Duration;

use inferq_ai::{AiError, ScriptedInvoker};
use inferq_core::{ManualClock, Priority, UserId};
use inferq_infra::jobs::{LoadSnapshot, NewJob, QueueStatus};
use inferq_infra::resilience::{
    backpressure_level, AdmissionController, AdmissionReason, BackpressureLevel, CircuitState,
};
use inferq_infra::rollout::{
    bucket_for, GateReason, InMemoryRolloutMetricStore, RolloutConfig, RolloutGate, RolloutMetricStore,
};
use inferq_infra::{Pipeline, PipelineConfig, ProcessOutcome};
use inferq_observability::{AlertDispatcher, AlertLevel, AlertReceiver};

const TIMEOUT_MESSAGE: &str = "Request timed out after 30 seconds";

struct Harness {
    pipeline: Arc<Pipeline>,
    invoker: Arc<ScriptedInvoker>,
    clock: Arc<ManualClock>,
    alerts: AlertReceiver,
}

fn harness(config: PipelineConfig) -> Harness {
    inferq_observability::init_for_tests();
    let invoker = Arc::new(ScriptedInvoker::new());
    let clock = Arc::new(ManualClock::starting_now());
    let (dispatcher, alerts) = AlertDispatcher::channel(64);
    let pipeline = Pipeline::builder(config, invoker.clone())
        .clock(clock.clone())
        .alerts(dispatcher)
        .build()
        .unwrap();
    Harness {
        pipeline: Arc::new(pipeline),
        invoker,
        clock,
        alerts,
    }
}

fn job(priority: Priority) -> NewJob {
    NewJob::new(UserId::new(), "post-42", priority)
}

#[test]
fn heavy_backpressure_rejects_normal_but_admits_urgent() {
    let load = LoadSnapshot {
        queue_depth: 800,
        capacity_limit: 1000,
        active_workers: 9,
        max_workers: 10,
    };
    assert_eq!(load.capacity_utilization(), 80.0);
    assert_eq!(load.processing_utilization(), 90.0);
    assert_eq!(
        backpressure_level(load.capacity_utilization(), load.processing_utilization()),
        BackpressureLevel::Heavy
    );

    let controller = AdmissionController::default();
    let normal = controller.admit(Priority::Normal, &load);
    assert!(!normal.allowed);
    assert_eq!(normal.reason, AdmissionReason::Backpressure);
    assert_eq!(normal.threshold, Some(60.0));

    let urgent = controller.admit(Priority::Urgent, &load);
    assert!(urgent.allowed);
    assert_eq!(urgent.reason, AdmissionReason::UrgentFastPath);
}

#[tokio::test]
async fn repeated_timeouts_end_in_the_dead_letter_store() {
    let mut h = harness(PipelineConfig::default());
    h.invoker
        .fail_times("ai-analysis", 4, AiError::failed(TIMEOUT_MESSAGE));
    let id = h.pipeline.submit(job(Priority::Normal)).unwrap().job_id.unwrap();

    for (retry_count, delay_ms) in [(1u32, 1000u64), (2, 2000), (3, 4000)] {
        let outcome = h.pipeline.process_one().await.unwrap().unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::RetryScheduled {
                job_id: id,
                retry_count,
                delay_ms
            }
        );
        // Backoff has not elapsed yet.
        assert!(h.pipeline.process_one().await.unwrap().is_none());
        h.clock.advance(Duration::from_millis(delay_ms));
    }

    let outcome = h.pipeline.process_one().await.unwrap().unwrap();
    assert!(matches!(outcome, ProcessOutcome::DeadLettered { job_id, .. } if job_id == id));

    let entry = h.pipeline.dead_letter(id).unwrap().unwrap();
    assert!(entry.dead_letter_reason.contains("timeout"));
    assert!(entry.recoverable);
    assert_eq!(entry.recommendation, "Retry with increased timeout");
    assert_eq!(entry.item.retry_count, 3);
    assert_eq!(entry.item.last_error_message.as_deref(), Some(TIMEOUT_MESSAGE));

    let item = h.pipeline.get(id).unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::DeadLetter);
    assert_eq!(h.pipeline.load().queue_depth, 0);
    assert_eq!(h.invoker.calls(), 4);

    // Four consecutive failures crossed the warning threshold but not the trip threshold.
    let alerts = h.alerts.drain();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].level, AlertLevel::Warning);
    assert_eq!(h.pipeline.breakers().status("ai-analysis").state, CircuitState::Closed);
}

#[tokio::test]
async fn open_breaker_defers_without_spending_retries() {
    let mut h = harness(PipelineConfig::default());
    h.invoker
        .fail_times("ai-analysis", 5, AiError::Network("connection reset".into()));

    for _ in 0..6 {
        h.pipeline.submit(job(Priority::Normal)).unwrap();
    }
    for _ in 0..5 {
        let outcome = h.pipeline.process_one().await.unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::RetryScheduled { retry_count: 1, .. }));
    }

    let status = h.pipeline.breakers().status("ai-analysis");
    assert_eq!(status.state, CircuitState::Open);
    let next_attempt = status.next_attempt_at.unwrap();

    let outcome = h.pipeline.process_one().await.unwrap().unwrap();
    let ProcessOutcome::Deferred { job_id, .. } = outcome else {
        panic!("expected deferral, got {outcome:?}");
    };
    let deferred = h.pipeline.get(job_id).unwrap().unwrap();
    assert_eq!(deferred.status, QueueStatus::Queued);
    assert_eq!(deferred.retry_count, 0);
    assert_eq!(deferred.scheduled_at, Some(next_attempt));
    assert_eq!(h.invoker.calls(), 5);

    // Cooldown elapses: the next call is a trial and closes the breaker.
    h.clock.advance(Duration::from_secs(30));
    let outcome = h.pipeline.process_one().await.unwrap().unwrap();
    assert!(matches!(outcome, ProcessOutcome::Completed { .. }));
    let status = h.pipeline.breakers().status("ai-analysis");
    assert_eq!(status.state, CircuitState::Closed);
    assert_eq!(status.failure_count, 0);

    let levels: Vec<_> = h.alerts.drain().into_iter().map(|a| a.level).collect();
    assert_eq!(levels, vec![AlertLevel::Warning, AlertLevel::Critical, AlertLevel::Info]);
}

#[tokio::test]
async fn slow_calls_time_out_and_retry() {
    let mut config = PipelineConfig::default();
    config.worker.call_timeout = Duration::from_millis(20);
    let h = harness(config);
    h.invoker.set_latency(Duration::from_millis(500));

    let id = h.pipeline.submit(job(Priority::High)).unwrap().job_id.unwrap();
    let outcome = h.pipeline.process_one().await.unwrap().unwrap();
    assert!(matches!(outcome, ProcessOutcome::RetryScheduled { retry_count: 1, .. }));

    let item = h.pipeline.get(id).unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Failed);
    assert_eq!(item.last_error_message.as_deref(), Some("request timed out after 20ms"));
}

#[tokio::test]
async fn cancelling_a_running_job_is_cooperative() {
    let h = harness(PipelineConfig::default());
    h.invoker.set_latency(Duration::from_millis(100));
    let id = h.pipeline.submit(job(Priority::Normal)).unwrap().job_id.unwrap();

    let pipeline = h.pipeline.clone();
    let running = tokio::spawn(async move { pipeline.process_one().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let flagged = h.pipeline.cancel(id).unwrap();
    assert_eq!(flagged.status, QueueStatus::Processing);
    assert!(flagged.cancel_requested);

    let outcome = running.await.unwrap().unwrap().unwrap();
    assert_eq!(outcome, ProcessOutcome::Cancelled { job_id: id });
    assert_eq!(h.pipeline.get(id).unwrap().unwrap().status, QueueStatus::Cancelled);
    assert_eq!(h.pipeline.load().queue_depth, 0);
}

#[tokio::test]
async fn full_rollout_routes_to_the_experimental_dependency() {
    let mut config = PipelineConfig::default();
    config.rollout.enabled = true;
    config.rollout.rollout_percent = 100;

    let invoker = Arc::new(ScriptedInvoker::new());
    let metrics = Arc::new(InMemoryRolloutMetricStore::new());
    let pipeline = Pipeline::builder(config, invoker)
        .rollout_store(metrics.clone())
        .build()
        .unwrap();

    pipeline.submit(job(Priority::Normal)).unwrap();
    let outcome = pipeline.process_one().await.unwrap().unwrap();
    assert!(matches!(
        outcome,
        ProcessOutcome::Completed { ref dependency, .. } if dependency == "ai-analysis-experimental"
    ));

    let recorded = metrics.recent("experimental-analysis", 10).unwrap();
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].success);
    assert!(recorded[0].processing_time_ms.is_some());
}

#[test]
fn poor_rollout_window_disables_and_alerts_exactly_once() {
    let clock = Arc::new(ManualClock::starting_now());
    let (alerts, mut rx) = AlertDispatcher::channel(8);
    let gate = RolloutGate::new(
        RolloutConfig {
            enabled: true,
            rollout_percent: 50,
            ..RolloutConfig::default()
        },
        Arc::new(InMemoryRolloutMetricStore::new()),
        clock,
        alerts,
    );

    gate.record_outcome(true, Some(120)).unwrap();
    for _ in 0..3 {
        gate.record_outcome(false, Some(120)).unwrap();
    }

    let user = std::iter::repeat_with(UserId::new)
        .find(|u| bucket_for(u) < 50)
        .unwrap();
    let evaluation = gate.evaluate(&user).unwrap();
    assert!(!evaluation.enabled);
    assert!(matches!(
        evaluation.reason,
        GateReason::SuccessRateLow { success_rate, samples: 4 } if success_rate == 0.25
    ));

    let raised = rx.drain();
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].service, "experimental-analysis");
}

#[test]
fn concurrent_submissions_respect_the_hard_cap() {
    let mut config = PipelineConfig::default();
    config.admission.capacity_limit = 100;
    let pipeline = Arc::new(
        Pipeline::builder(config, Arc::new(ScriptedInvoker::new()))
            .build()
            .unwrap(),
    );

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let p = pipeline.clone();
            std::thread::spawn(move || {
                (0..50)
                    .filter(|_| p.submit(job(Priority::Urgent)).unwrap().accepted)
                    .count()
            })
        })
        .collect();

    let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(accepted, 100);
    assert_eq!(pipeline.load().queue_depth, 100);
}
