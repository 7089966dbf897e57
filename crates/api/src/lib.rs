//! HTTP API: server, routing, and request/response mapping.

pub mod app;

/// Production [`AiInvoker`](inferq_ai::AiInvoker) speaking JSON over HTTP.
pub mod invoker;

pub use app::build_app;
pub use invoker::HttpInvoker;
