//! Queue item model and its status state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use inferq_core::{CoreError, CoreResult, JobId, Priority, UserId};

/// Lifecycle status of a queue item.
///
/// Terminal states: `Completed`, `DeadLetter`, `Cancelled`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting to be claimed by a worker.
    Queued,
    /// Claimed by exactly one worker.
    Processing,
    /// Analysis finished successfully.
    Completed,
    /// Last attempt failed; waiting for its backoff to elapse.
    Failed,
    /// Gave up; the item now lives in the dead-letter store.
    DeadLetter,
    /// Cancelled before (or cooperatively during) processing.
    Cancelled,
}

/// Events that move a queue item between statuses.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusEvent {
    Claim,
    Complete,
    ScheduleRetry,
    /// Hand the item back untouched (e.g. the dependency's breaker was open).
    Release,
    DeadLetter,
    Cancel,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 6] = [
        QueueStatus::Queued,
        QueueStatus::Processing,
        QueueStatus::Completed,
        QueueStatus::Failed,
        QueueStatus::DeadLetter,
        QueueStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::DeadLetter => "dead_letter",
            QueueStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Completed | QueueStatus::DeadLetter | QueueStatus::Cancelled
        )
    }

    /// Waiting for a worker (possibly after a backoff).
    pub fn is_waiting(&self) -> bool {
        matches!(self, QueueStatus::Queued | QueueStatus::Failed)
    }

    /// The single transition function for queue items.
    pub fn transition(self, event: StatusEvent) -> CoreResult<QueueStatus> {
        use QueueStatus::*;
        use StatusEvent::*;

        match (self, event) {
            (Queued | Failed, Claim) => Ok(Processing),
            (Processing, Complete) => Ok(Completed),
            (Processing, ScheduleRetry) => Ok(Failed),
            (Processing, Release) => Ok(Queued),
            (Processing | Failed, StatusEvent::DeadLetter) => Ok(QueueStatus::DeadLetter),
            (Queued | Failed | Processing, Cancel) => Ok(Cancelled),
            (from, event) => Err(CoreError::illegal_transition(from, event)),
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StatusEvent::Claim => "claim",
            StatusEvent::Complete => "complete",
            StatusEvent::ScheduleRetry => "schedule_retry",
            StatusEvent::Release => "release",
            StatusEvent::DeadLetter => "dead_letter",
            StatusEvent::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

/// A job as submitted by the application layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub user_id: UserId,
    /// Identifier of the content that needs analysis.
    pub content_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub priority: Priority,
}

impl NewJob {
    pub fn new(user_id: UserId, content_id: impl Into<String>, priority: Priority) -> Self {
        Self {
            user_id,
            content_id: content_id.into(),
            payload: serde_json::Value::Null,
            priority,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A unit of work in the analysis queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: JobId,
    pub user_id: UserId,
    pub content_id: String,
    pub payload: serde_json::Value,
    /// Effective priority (may have been upgraded by overflow handling).
    pub priority: Priority,
    /// Priority requested at submission.
    pub submitted_priority: Priority,
    pub status: QueueStatus,
    pub queued_at: DateTime<Utc>,
    /// Not claimable before this instant (delayed admission, backoff, open breaker).
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Set on every transition into `Processing`.
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error_message: Option<String>,
    /// Sum of all attempt durations.
    pub total_processing_time_ms: Option<u64>,
    /// Dependency used by the most recent attempt.
    pub dependency: Option<String>,
    /// Cooperative cancellation flag, checked by workers at suspension points.
    pub cancel_requested: bool,
}

impl QueueItem {
    pub fn new(job: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            user_id: job.user_id,
            content_id: job.content_id,
            payload: job.payload,
            priority: job.priority,
            submitted_priority: job.priority,
            status: QueueStatus::Queued,
            queued_at: now,
            scheduled_at: None,
            processing_started_at: None,
            completed_at: None,
            retry_count: 0,
            last_error_message: None,
            total_processing_time_ms: None,
            dependency: None,
            cancel_requested: false,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Hold the item until `now + delay`.
    pub fn delayed(mut self, delay: Duration, now: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status.is_waiting() && self.scheduled_at.is_none_or(|at| now >= at)
    }

    /// Time spent waiting since submission.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.queued_at).max(chrono::Duration::zero())
    }

    /// Wait between submission and the most recent claim.
    pub fn wait_before_start(&self) -> Option<chrono::Duration> {
        self.processing_started_at.map(|s| (s - self.queued_at).max(chrono::Duration::zero()))
    }

    fn apply(&mut self, event: StatusEvent) -> CoreResult<()> {
        self.status = self.status.transition(event)?;
        Ok(())
    }

    fn accumulate_processing_time(&mut self, now: DateTime<Utc>) {
        if let Some(started) = self.processing_started_at {
            let elapsed = (now - started).num_milliseconds().max(0) as u64;
            self.total_processing_time_ms = Some(self.total_processing_time_ms.unwrap_or(0) + elapsed);
        }
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        self.apply(StatusEvent::Claim)?;
        self.processing_started_at = Some(now);
        self.scheduled_at = None;
        Ok(())
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        self.apply(StatusEvent::Complete)?;
        self.accumulate_processing_time(now);
        self.completed_at = Some(now);
        Ok(())
    }

    /// Record a failed attempt and hold the item for `delay`.
    pub fn schedule_retry(&mut self, error: String, delay: Duration, now: DateTime<Utc>) -> CoreResult<()> {
        self.apply(StatusEvent::ScheduleRetry)?;
        self.accumulate_processing_time(now);
        self.retry_count += 1;
        self.last_error_message = Some(error);
        self.scheduled_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
        Ok(())
    }

    /// Put the item back without consuming a retry.
    pub fn release_until(&mut self, until: DateTime<Utc>) -> CoreResult<()> {
        self.apply(StatusEvent::Release)?;
        self.processing_started_at = None;
        self.scheduled_at = Some(until);
        Ok(())
    }

    pub fn mark_dead_letter(&mut self, error: String, now: DateTime<Utc>) -> CoreResult<()> {
        if self.status == QueueStatus::Processing {
            self.accumulate_processing_time(now);
        }
        self.apply(StatusEvent::DeadLetter)?;
        self.last_error_message = Some(error);
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        if self.status == QueueStatus::Processing {
            self.accumulate_processing_time(now);
        }
        self.apply(StatusEvent::Cancel)?;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Reset a dead-lettered item for an operator-initiated requeue.
    pub fn reset_for_requeue(&mut self, now: DateTime<Utc>) {
        self.status = QueueStatus::Queued;
        self.queued_at = now;
        self.scheduled_at = None;
        self.processing_started_at = None;
        self.completed_at = None;
        self.retry_count = 0;
        self.cancel_requested = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> QueueItem {
        QueueItem::new(NewJob::new(UserId::new(), "post-1", Priority::Normal), Utc::now())
    }

    #[test]
    fn legal_lifecycle() {
        let mut item = item();
        let t0 = item.queued_at;

        item.mark_processing(t0).unwrap();
        assert_eq!(item.status, QueueStatus::Processing);
        assert_eq!(item.processing_started_at, Some(t0));

        item.mark_completed(t0 + chrono::Duration::milliseconds(250)).unwrap();
        assert_eq!(item.status, QueueStatus::Completed);
        assert_eq!(item.total_processing_time_ms, Some(250));
    }

    #[test]
    fn terminal_states_reject_every_event() {
        for terminal in [QueueStatus::Completed, QueueStatus::DeadLetter, QueueStatus::Cancelled] {
            for event in [
                StatusEvent::Claim,
                StatusEvent::Complete,
                StatusEvent::ScheduleRetry,
                StatusEvent::Release,
                StatusEvent::DeadLetter,
                StatusEvent::Cancel,
            ] {
                assert!(terminal.transition(event).is_err(), "{terminal} accepted {event}");
            }
        }
    }

    #[test]
    fn queued_item_cannot_complete() {
        let err = QueueStatus::Queued.transition(StatusEvent::Complete).unwrap_err();
        assert_eq!(err, CoreError::illegal_transition("queued", "complete"));
    }

    #[test]
    fn retry_holds_item_until_backoff_elapses() {
        let mut item = item();
        let t0 = item.queued_at;
        item.mark_processing(t0).unwrap();
        item.schedule_retry("network error".into(), Duration::from_secs(2), t0).unwrap();

        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.retry_count, 1);
        assert!(!item.is_ready(t0 + chrono::Duration::seconds(1)));
        assert!(item.is_ready(t0 + chrono::Duration::seconds(2)));
    }

    #[test]
    fn release_does_not_consume_a_retry() {
        let mut item = item();
        let t0 = item.queued_at;
        item.mark_processing(t0).unwrap();
        item.release_until(t0 + chrono::Duration::seconds(30)).unwrap();

        assert_eq!(item.status, QueueStatus::Queued);
        assert_eq!(item.retry_count, 0);
        assert!(item.processing_started_at.is_none());
    }

    #[test]
    fn requeue_resets_retry_budget() {
        let mut item = item();
        let t0 = item.queued_at;
        item.mark_processing(t0).unwrap();
        item.mark_dead_letter("invalid_input".into(), t0).unwrap();

        item.reset_for_requeue(t0);
        assert_eq!(item.status, QueueStatus::Queued);
        assert_eq!(item.retry_count, 0);
    }
}
