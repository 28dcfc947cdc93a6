//! # loops-core
//!
//! Core primitives for the Loops personal-safety alerting engine.
//!
//! This crate provides the foundational types used across all Loops components:
//!
//! - **Identifiers**: Strongly-typed IDs for events, users, circles and contacts
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization, span helpers and redaction
//!
//! ## Example
//!
//! ```rust
//! use loops_core::prelude::*;
//!
//! let event_id = EventId::generate();
//! let user = UserId::new("uid-123")?;
//! # let _ = event_id;
//! # Ok::<(), loops_core::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{CircleId, ContactId, EventId, UserId};
    pub use crate::observability::{LogFormat, Redacted, init_logging};
}

pub use error::{Error, Result};
pub use id::{CircleId, ContactId, EventId, UserId};
pub use observability::{LogFormat, Redacted, init_logging};
