//! `inferq-ai`
//!
//! **Responsibility:** boundary to the external AI inference service.
//!
//! The pipeline only observes success, failure, or timeout of a call:
//! - It never parses inference payloads beyond carrying them through.
//! - Failures surface as [`AiError`]. The variant drives retry
//!   classification downstream; only `Failed` is categorized by its text.

pub mod invoker;
pub mod request;
pub mod result;

pub use invoker::{AiInvoker, ScriptedInvoker};
pub use request::AnalysisRequest;
pub use result::{AiError, AiResult};
