//! Operator controls: breaker overrides, dead-letter triage and the rollout gate.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use inferq_infra::jobs::DeadLetterResolution;
use inferq_infra::Pipeline;

use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/breakers", get(list_breakers))
        .route("/breakers/:name/open", post(force_open))
        .route("/breakers/:name/close", post(force_close))
        .route("/dead-letters", get(list_dead_letters))
        .route("/dead-letters/purge", post(purge_dead_letters))
        .route("/dead-letters/:id", get(get_dead_letter))
        .route("/dead-letters/:id/resolve", post(resolve_dead_letter))
        .route("/rollout", get(get_rollout).post(update_rollout))
}

pub async fn list_breakers(Extension(pipeline): Extension<Arc<Pipeline>>) -> impl IntoResponse {
    Json(pipeline.breaker_statuses())
}

pub async fn force_open(
    Extension(pipeline): Extension<Arc<Pipeline>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    tracing::warn!(dependency = %name, "breaker forced open by operator");
    Json(pipeline.force_open(&name))
}

pub async fn force_close(
    Extension(pipeline): Extension<Arc<Pipeline>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    tracing::info!(dependency = %name, "breaker forced closed by operator");
    Json(pipeline.force_close(&name))
}

pub async fn list_dead_letters(
    Extension(pipeline): Extension<Arc<Pipeline>>,
    Query(query): Query<dto::LimitQuery>,
) -> axum::response::Response {
    match pipeline.dead_letters(query.limit.unwrap_or(dto::DEFAULT_LIST_LIMIT)) {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn get_dead_letter(
    Extension(pipeline): Extension<Arc<Pipeline>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match pipeline.dead_letter(id) {
        Ok(Some(entry)) => Json(entry).into_response(),
        Ok(None) => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("dead letter not found: {id}"),
        ),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn resolve_dead_letter(
    Extension(pipeline): Extension<Arc<Pipeline>>,
    Path(id): Path<String>,
    Json(body): Json<dto::ResolveDeadLetterRequest>,
) -> axum::response::Response {
    let id = match dto::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match pipeline.resolve_dead_letter(id, body.resolution) {
        Ok(item) => Json(serde_json::json!({
            "id": id.to_string(),
            "resolution": body.resolution,
            "requeued": body.resolution == DeadLetterResolution::Requeue,
            "item": item,
        }))
        .into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn purge_dead_letters(Extension(pipeline): Extension<Arc<Pipeline>>) -> axum::response::Response {
    match pipeline.purge_expired_dead_letters() {
        Ok(purged) => Json(serde_json::json!({ "purged": purged })).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn get_rollout(Extension(pipeline): Extension<Arc<Pipeline>>) -> impl IntoResponse {
    Json(pipeline.rollout().config())
}

pub async fn update_rollout(
    Extension(pipeline): Extension<Arc<Pipeline>>,
    Json(body): Json<dto::UpdateRolloutRequest>,
) -> axum::response::Response {
    let gate = pipeline.rollout();
    if let Some(percent) = body.rollout_percent {
        if percent > 100 {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "rollout_percent must be within 0..=100",
            );
        }
        gate.set_rollout_percent(percent);
    }
    if let Some(enabled) = body.enabled {
        gate.set_enabled(enabled);
    }
    if body.reset_outcomes {
        if let Err(e) = gate.reset_outcomes() {
            tracing::error!(error = %e, "rollout reset failed");
            return errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string());
        }
    }

    let config = gate.config();
    tracing::warn!(
        flag = %config.flag,
        enabled = config.enabled,
        rollout_percent = config.rollout_percent,
        reset = body.reset_outcomes,
        "rollout updated by operator"
    );
    Json(config).into_response()
}
