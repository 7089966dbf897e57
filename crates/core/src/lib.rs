//! `inferq-core`: shared building blocks for the analysis pipeline.
//!
//! This crate contains **pure** primitives (no I/O, no async): identifiers,
//! job priority, the injectable clock, and the shared error model.

pub mod clock;
pub mod error;
pub mod id;
pub mod priority;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, CoreResult};
pub use id::{JobId, UserId};
pub use priority::Priority;
