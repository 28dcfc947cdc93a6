//! Entry points for callers: trigger, resolve, and audit history.
//!
//! [`SosService`] validates requests, runs admission, and publishes the
//! dispatch message. It returns as soon as the event is committed and the
//! message is enqueued; delivery happens in the orchestrator.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use loops_core::observability::sos_span;
use loops_core::{CircleId, EventId, UserId};

use crate::admission::{AdmissionController, AdmissionRequest};
use crate::audit::{AuditLog, NotificationLogEntry};
use crate::directory::Directory;
use crate::dispatch::{DispatchMessage, DispatchQueue};
use crate::error::{Result, SosError};
use crate::event::{EventStatus, Location, ResolutionReason, SosEvent, TriggerMethod};
use crate::limits::AdmissionPolicy;
use crate::metrics::SosMetrics;
use crate::store::SosStore;

/// Body of a trigger request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    /// Circle to alert in.
    #[serde(default)]
    pub circle_id: Option<String>,
    /// Location, if shared.
    #[serde(default)]
    pub location: Option<Location>,
    /// How the alert was raised; defaults to hold.
    #[serde(default)]
    pub trigger_method: Option<TriggerMethod>,
}

/// Successful trigger response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    /// Always `success`.
    pub status: String,
    /// The created event.
    pub event_id: EventId,
}

impl TriggerResponse {
    fn success(event_id: EventId) -> Self {
        Self {
            status: "success".to_string(),
            event_id,
        }
    }
}

/// Body of a resolution update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    /// Must be `resolved`.
    pub status: EventStatus,
    /// Why the event is closed.
    #[serde(default)]
    pub resolution_reason: Option<ResolutionReason>,
}

/// Facade over admission, storage, dispatch and audit.
pub struct SosService {
    store: Arc<dyn SosStore>,
    directory: Arc<dyn Directory>,
    audit: Arc<dyn AuditLog>,
    queue: Arc<dyn DispatchQueue>,
    admission: AdmissionController<dyn SosStore>,
    metrics: SosMetrics,
}

impl std::fmt::Debug for SosService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SosService")
            .field("admission", &self.admission)
            .finish_non_exhaustive()
    }
}

fn require_actor(actor: Option<&UserId>) -> Result<&UserId> {
    actor.ok_or_else(|| SosError::unauthenticated("no authenticated user"))
}

impl SosService {
    /// Creates a service.
    #[must_use]
    pub fn new(
        store: Arc<dyn SosStore>,
        directory: Arc<dyn Directory>,
        audit: Arc<dyn AuditLog>,
        queue: Arc<dyn DispatchQueue>,
        policy: AdmissionPolicy,
    ) -> Self {
        Self {
            admission: AdmissionController::new(Arc::clone(&store), policy),
            store,
            directory,
            audit,
            queue,
            metrics: SosMetrics::new(),
        }
    }

    /// The admission controller, for the abuse-correction sweep.
    #[must_use]
    pub const fn admission(&self) -> &AdmissionController<dyn SosStore> {
        &self.admission
    }

    /// Raises an SOS for `actor`.
    ///
    /// # Errors
    ///
    /// - `Unauthenticated` without an actor
    /// - `InvalidArgument` for a malformed location or circle ID
    /// - `ResourceMissing` when the circle is absent or the actor is not a member
    /// - `AccountLocked` / `RateLimited` from admission
    /// - `Internal` on store failure
    ///
    /// A failed dispatch publish after commit is logged and does not fail the trigger.
    pub async fn trigger(
        &self,
        actor: Option<&UserId>,
        request: TriggerRequest,
        now: DateTime<Utc>,
    ) -> Result<TriggerResponse> {
        let user = require_actor(actor)?;
        let span = sos_span("trigger", "pending", user.as_str());
        self.trigger_inner(user, request, now).instrument(span).await
    }

    async fn trigger_inner(
        &self,
        user: &UserId,
        request: TriggerRequest,
        now: DateTime<Utc>,
    ) -> Result<TriggerResponse> {
        if let Some(location) = &request.location {
            location.validate()?;
        }

        let circle = match request.circle_id.as_deref().map(str::trim) {
            None | Some("") => return Err(SosError::resource_missing("circle", "<none>")),
            Some(raw) => CircleId::new(raw)?,
        };
        if !self.directory.is_circle_member(user, &circle).await? {
            tracing::info!(circle_id = %circle, "trigger for unknown circle or non-member");
            return Err(SosError::resource_missing("circle", &circle));
        }

        let admitted = self
            .admission
            .admit(
                AdmissionRequest {
                    user_id: user.clone(),
                    circle_id: circle,
                    location: request.location,
                    trigger_method: request.trigger_method.unwrap_or_default(),
                },
                now,
            )
            .await?;
        let event_id = admitted.event.event_id;
        tracing::Span::current().record("event_id", tracing::field::display(&event_id));

        if let Err(error) = self.queue.publish(DispatchMessage::new(event_id)).await {
            let error = SosError::TransientDeliveryFailure {
                message: format!("dispatch publish failed: {error}"),
            };
            self.metrics.record_publish_failure();
            tracing::error!(%event_id, %error, "event committed but not enqueued; sweep will republish");
        }

        Ok(TriggerResponse::success(event_id))
    }

    async fn owned_event(&self, user: &UserId, event_id: &EventId) -> Result<SosEvent> {
        match self.store.get_event(event_id).await? {
            Some(event) if &event.user_id == user => Ok(event),
            _ => Err(SosError::resource_missing("event", event_id)),
        }
    }

    /// Resolves an event owned by `actor`.
    ///
    /// The resolution update to contacts is sent by the
    /// [`ResolutionListener`](crate::listener::ResolutionListener) observing the change.
    ///
    /// # Errors
    ///
    /// - `Unauthenticated` without an actor
    /// - `InvalidArgument` if `request.status` is not `resolved` or the event is already resolved
    /// - `ResourceMissing` if the event does not exist or belongs to someone else
    pub async fn resolve(
        &self,
        actor: Option<&UserId>,
        event_id: &EventId,
        request: ResolveRequest,
        now: DateTime<Utc>,
    ) -> Result<SosEvent> {
        let user = require_actor(actor)?;
        if request.status != EventStatus::Resolved {
            return Err(SosError::invalid_argument(format!(
                "status can only be set to resolved, got {}",
                request.status
            )));
        }
        self.owned_event(user, event_id).await?;
        let resolved = self
            .store
            .resolve_event(event_id, request.resolution_reason, now)
            .await?;
        tracing::info!(%event_id, user_id = %user, "sos event resolved");
        Ok(resolved)
    }

    /// Audit entries for an event owned by `actor`.
    ///
    /// # Errors
    ///
    /// `Unauthenticated` without an actor, `ResourceMissing` if the event does
    /// not exist or belongs to someone else.
    pub async fn notifications(
        &self,
        actor: Option<&UserId>,
        event_id: &EventId,
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationLogEntry>> {
        let user = require_actor(actor)?;
        self.owned_event(user, event_id).await?;
        self.audit.entries_for_event(event_id, now).await
    }
}
