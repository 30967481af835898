//! Runtime supervisor and HTTP surface
//!
//! Constructs the component graph in dependency order (bus → registry →
//! event store → skill host → workers → router → HTTP), exposes liveness and
//! readiness, and coordinates an orderly reverse-order shutdown.

mod error;
mod http;
mod supervisor;
mod telemetry;

pub use error::RuntimeError;
pub use http::{create_router, AppState};
pub use supervisor::Supervisor;
pub use telemetry::{init_metrics, init_tracing};
