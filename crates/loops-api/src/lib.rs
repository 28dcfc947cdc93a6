//! # loops-api
//!
//! HTTP composition layer for the Loops SOS engine.
//!
//! This crate wires `loops-sos` to the outside world:
//!
//! - **Authentication**: caller identity from HS256 bearer tokens (or a debug header)
//! - **Routing**: the SOS trigger, resolve and history endpoints
//! - **Background work**: dispatch workers, the resolution listener and housekeeping
//! - **Observability**: Prometheus metrics, request tracing and health checks
//!
//! All SOS policy lives in `loops-sos`; handlers only translate between HTTP
//! and the engine's service facade.
//!
//! ## Endpoints
//!
//! ```text
//! GET   /health                              - Health check
//! GET   /ready                               - Readiness check
//! GET   /metrics                             - Prometheus metrics
//! POST  /api/v1/sos                          - Raise an alert (202)
//! PATCH /api/v1/sos/{event_id}               - Resolve an alert
//! GET   /api/v1/sos/{event_id}/notifications - Notification history
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use loops_api::prelude::*;
//!
//! let config = Config::from_env()?;
//! let engine = Engine::from_config(&config).await?;
//! Server::with_engine(config, engine).serve().await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod routes;
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::context::RequestContext;
    pub use crate::engine::Engine;
    pub use crate::error::{ApiError, ApiResult};
    pub use crate::server::{Server, ServerBuilder};
}
