use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use inferq_core::{JobId, UserId};

/// A single unit of inference work sent to a dependency.
///
/// The payload is opaque to the pipeline; it is whatever the application layer
/// attached when the job was submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub job_id: JobId,
    pub user_id: UserId,
    pub content_id: String,
    pub payload: JsonValue,
}

impl AnalysisRequest {
    pub fn new(job_id: JobId, user_id: UserId, content_id: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            job_id,
            user_id,
            content_id: content_id.into(),
            payload,
        }
    }
}
