use std::sync::Arc;

use axum::{
    extract::Extension,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};

use inferq_infra::metrics::ExportFormat;
use inferq_infra::Pipeline;

use crate::app::errors;

pub fn router() -> Router {
    Router::new()
        .route("/metrics", get(prometheus))
        .route("/metrics.csv", get(csv))
        .route("/metrics.json", get(json))
}

pub async fn prometheus(Extension(pipeline): Extension<Arc<Pipeline>>) -> axum::response::Response {
    export(&pipeline, ExportFormat::Prometheus)
}

pub async fn csv(Extension(pipeline): Extension<Arc<Pipeline>>) -> axum::response::Response {
    export(&pipeline, ExportFormat::Csv)
}

pub async fn json(Extension(pipeline): Extension<Arc<Pipeline>>) -> axum::response::Response {
    export(&pipeline, ExportFormat::Json)
}

fn export(pipeline: &Pipeline, format: ExportFormat) -> axum::response::Response {
    match pipeline.export_metrics(format) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, format.content_type())],
            body,
        )
            .into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
