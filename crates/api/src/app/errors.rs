use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use inferq_infra::jobs::{DeadLetterError, QueueStoreError};
use inferq_infra::PipelineError;

pub fn pipeline_error_to_response(err: PipelineError) -> axum::response::Response {
    match err {
        PipelineError::JobNotFound(id) | PipelineError::Queue(QueueStoreError::NotFound(id)) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job not found: {id}"))
        }
        PipelineError::DeadLetter(DeadLetterError::NotFound(id)) => json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("dead letter not found: {id}"),
        ),
        PipelineError::Transition(e) | PipelineError::Queue(QueueStoreError::Transition(e)) => {
            json_error(StatusCode::CONFLICT, "illegal_transition", e.to_string())
        }
        PipelineError::AtCapacity => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "at_capacity",
            "queue at maximum capacity",
        ),
        PipelineError::Export(e) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "export_error", e.to_string())
        }
        other => {
            tracing::error!(error = %other, "pipeline error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", other.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
