use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use inferq_infra::jobs::QueueFilter;
use inferq_infra::Pipeline;

use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
}

/// 202 when the job was taken (possibly delayed or upgraded), 429 when shed.
pub async fn submit_job(
    Extension(pipeline): Extension<Arc<Pipeline>>,
    Json(body): Json<dto::SubmitJobRequest>,
) -> axum::response::Response {
    let job = match body.into_new_job() {
        Ok(j) => j,
        Err(resp) => return resp,
    };

    match pipeline.submit(job) {
        Ok(outcome) => {
            let status = if outcome.accepted {
                StatusCode::ACCEPTED
            } else {
                StatusCode::TOO_MANY_REQUESTS
            };
            (status, Json(outcome)).into_response()
        }
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(pipeline): Extension<Arc<Pipeline>>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let mut filter = QueueFilter::default();
    if let Some(status) = query.status {
        filter = filter.status(status);
    }
    if let Some(priority) = query.priority {
        filter = filter.priority(priority);
    }

    match pipeline.list(&filter, query.limit.unwrap_or(dto::DEFAULT_LIST_LIMIT)) {
        Ok(items) => Json(items).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(pipeline): Extension<Arc<Pipeline>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match pipeline.get(id) {
        Ok(Some(item)) => Json(item).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job not found: {id}")),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn cancel_job(
    Extension(pipeline): Extension<Arc<Pipeline>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match pipeline.cancel(id) {
        Ok(item) => Json(item).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
