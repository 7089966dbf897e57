use axum::Router;

pub mod admin;
pub mod jobs;
pub mod metrics;
pub mod system;

/// Router for every endpoint except `/health`.
pub fn router() -> Router {
    Router::new()
        .merge(jobs::router())
        .merge(metrics::router())
        .nest("/admin", admin::router())
}
