use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use inferq_infra::metrics::HealthStatus;
use inferq_infra::Pipeline;

use crate::app::errors;

/// Liveness plus the queue health score. Answers 503 while the queue is critical.
pub async fn health(Extension(pipeline): Extension<Arc<Pipeline>>) -> axum::response::Response {
    let snapshot = match pipeline.snapshot() {
        Ok(s) => s,
        Err(e) => return errors::pipeline_error_to_response(e),
    };

    let status = match snapshot.health.status {
        HealthStatus::Critical => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Warning => StatusCode::OK,
    };

    (
        status,
        Json(serde_json::json!({
            "status": snapshot.health.status,
            "score": snapshot.health.score,
            "recommendations": snapshot.health.recommendations,
            "queue_depth": snapshot.load.queue_depth,
            "active_workers": snapshot.load.active_workers,
        })),
    )
        .into_response()
}
