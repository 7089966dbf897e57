//! HTTP API application wiring (Axum router over a shared [`Pipeline`]).
//!
//! Layout:
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request DTOs and path/query parsing helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use inferq_infra::Pipeline;

pub mod dto;
pub mod errors;
pub mod routes;

/// Build the full HTTP router (public entrypoint used by `main.rs` and the tests).
pub fn build_app(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(ServiceBuilder::new().layer(Extension(pipeline)))
}
