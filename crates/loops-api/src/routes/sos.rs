//! SOS API routes.
//!
//! ## Routes
//!
//! - `POST  /sos` - Raise an SOS alert
//! - `PATCH /sos/{event_id}` - Resolve an alert
//! - `GET   /sos/{event_id}/notifications` - Notification history of an alert

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;

use loops_core::EventId;
use loops_sos::prelude::{NotificationLogEntry, ResolveRequest, TriggerRequest};

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::server::AppState;

/// Notification history of one event.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
#[serde(rename_all = "camelCase")]
pub struct NotificationHistoryResponse {
    /// The event queried.
    pub event_id: EventId,
    /// Attempts in the order they were recorded.
    pub notifications: Vec<NotificationLogEntry>,
}

/// Creates SOS routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sos", post(trigger_sos))
        .route("/sos/:event_id", patch(resolve_sos))
        .route("/sos/:event_id/notifications", get(list_notifications))
}

fn parse_event_id(raw: &str, ctx: &RequestContext) -> Result<EventId, ApiError> {
    raw.parse().map_err(|_| {
        ApiError::resource_missing(format!("event not found: {raw}"))
            .with_request_id(ctx.request_id.clone())
    })
}

/// Raise an SOS alert.
///
/// POST /api/v1/sos
///
/// Returns 202 once the event is recorded; contacts are notified
/// asynchronously.
pub(crate) async fn trigger_sos(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    body: Result<Json<TriggerRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    let response = state
        .engine
        .service
        .trigger(Some(&ctx.user_id), req, Utc::now())
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    tracing::info!(
        user_id = %ctx.user_id,
        event_id = %response.event_id,
        request_id = %ctx.request_id,
        "sos triggered"
    );
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// Resolve an SOS alert owned by the caller.
///
/// PATCH /api/v1/sos/{event_id}
pub(crate) async fn resolve_sos(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<String>,
    body: Result<Json<ResolveRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let event_id = parse_event_id(&event_id, &ctx)?;
    let Json(req) = body.map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    let event = state
        .engine
        .service
        .resolve(Some(&ctx.user_id), &event_id, req, Utc::now())
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    Ok(Json(event))
}

/// Notification history of an alert owned by the caller.
///
/// GET /api/v1/sos/{event_id}/notifications
pub(crate) async fn list_notifications(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let event_id = parse_event_id(&event_id, &ctx)?;

    let notifications = state
        .engine
        .service
        .notifications(Some(&ctx.user_id), &event_id, Utc::now())
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    Ok(Json(NotificationHistoryResponse {
        event_id,
        notifications,
    }))
}
