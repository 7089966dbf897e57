use std::str::FromStr;

use axum::http::StatusCode;
use serde::Deserialize;

use inferq_core::{JobId, Priority, UserId};
use inferq_infra::jobs::{DeadLetterResolution, NewJob, QueueStatus};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub user_id: String,
    pub content_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Defaults to `normal`.
    pub priority: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveDeadLetterRequest {
    pub resolution: DeadLetterResolution,
}

/// Fields left out keep their current value.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateRolloutRequest {
    pub enabled: Option<bool>,
    pub rollout_percent: Option<u8>,
    #[serde(default)]
    pub reset_outcomes: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<QueueStatus>,
    pub priority: Option<Priority>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

pub const DEFAULT_LIST_LIMIT: usize = 100;

// -------------------------
// Mapping helpers
// -------------------------

impl SubmitJobRequest {
    pub fn into_new_job(self) -> Result<NewJob, axum::response::Response> {
        let user_id = UserId::from_str(self.user_id.trim()).map_err(|e| {
            errors::json_error(StatusCode::BAD_REQUEST, "invalid_user_id", e.to_string())
        })?;

        let content_id = self.content_id.trim();
        if content_id.is_empty() {
            return Err(errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "content_id must not be empty",
            ));
        }

        let priority = match self.priority.as_deref() {
            None => Priority::Normal,
            Some(p) => parse_priority(p)?,
        };

        Ok(NewJob::new(user_id, content_id, priority).with_payload(self.payload))
    }
}

pub fn parse_priority(s: &str) -> Result<Priority, axum::response::Response> {
    Priority::from_str(s.trim())
        .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_priority", e.to_string()))
}

pub fn parse_job_id(s: &str) -> Result<JobId, axum::response::Response> {
    JobId::from_str(s)
        .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()))
}
