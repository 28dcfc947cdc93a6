//! # loops-sos
//!
//! SOS activation and notification engine for Loops.
//!
//! A user in danger raises an SOS; the engine decides whether to accept it,
//! records the event, and notifies the user's trusted contacts over a cascade
//! of channels while keeping an audit trail of every attempt.
//!
//! ## Components
//!
//! - **Risk gate** ([`risk_gate`]): client-side pocket-dial suppression
//! - **Admission** ([`admission`], [`limits`]): rolling-window quota with
//!   cooldown, applied in one conditional write per trigger
//! - **Store** ([`store`]): account limits, lock flags, events, change feed
//! - **Dispatch** ([`dispatch`]): at-least-once queue carrying event IDs
//! - **Orchestrator** ([`orchestrator`]): per-contact channel cascade
//! - **Audit** ([`audit`]): append-only notification attempt log
//! - **Service** ([`service`]): trigger / resolve / history entry points
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::Utc;
//! use loops_sos::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> loops_sos::Result<()> {
//! let store = Arc::new(InMemorySosStore::new());
//! let admission = AdmissionController::new(store, AdmissionPolicy::default());
//!
//! let request = AdmissionRequest {
//!     user_id: UserId::new("uid-1")?,
//!     circle_id: CircleId::new("family")?,
//!     location: Some(Location::new(34.05, -118.25, 10.0)?),
//!     trigger_method: TriggerMethod::Hold,
//! };
//! let admitted = admission.admit(request, Utc::now()).await?;
//! assert_eq!(admitted.limit.trigger_count, 1);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod admission;
pub mod audit;
pub mod channels;
pub mod contact;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod limits;
pub mod listener;
pub mod metrics;
pub mod orchestrator;
pub mod risk_gate;
pub mod service;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use loops_core::{CircleId, ContactId, EventId, UserId};

    pub use crate::admission::{AdmissionController, AdmissionRequest, AdmissionResult};
    pub use crate::audit::{AuditLog, DeliveryStatus, InMemoryAuditLog, JsonlAuditLog, NotificationLogEntry};
    pub use crate::channels::{ChannelKind, NotificationChannel, NotificationKind, Notice};
    pub use crate::contact::{Contact, PriorityTier, UserProfile};
    pub use crate::directory::{Directory, InMemoryDirectory};
    pub use crate::dispatch::{DispatchMessage, DispatchQueue, InMemoryDispatchQueue};
    pub use crate::error::{DeliveryError, ErrorKind, Result, SosError};
    pub use crate::event::{EventChange, EventStatus, Location, ResolutionReason, SosEvent, TriggerMethod};
    pub use crate::limits::{AccountLimit, AdmissionPolicy};
    pub use crate::listener::ResolutionListener;
    pub use crate::orchestrator::{DispatchOutcome, NotificationOrchestrator, OrchestratorConfig};
    pub use crate::risk_gate::{HoldActivation, HoldOutcome, RiskGate, RiskGateConfig};
    pub use crate::service::{ResolveRequest, SosService, TriggerRequest, TriggerResponse};
    pub use crate::store::{InMemorySosStore, SosStore};
}

pub use error::{DeliveryError, ErrorKind, Result, SosError};
