//! Request context extraction and authentication middleware.
//!
//! In debug mode the caller identity is supplied via the `X-User-Id` header
//! for local development. In production mode it is the `sub` claim of a
//! verified HS256 bearer token.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::FromRequestParts;
use axum::extract::State;
use axum::http::header::HeaderName;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::Value;
use ulid::Ulid;

use loops_core::UserId;

use crate::config::JwtConfig;
use crate::error::ApiError;
use crate::server::AppState;

/// Header name for request IDs.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const USER_CLAIM: &str = "sub";

/// Per-request context derived from authentication and headers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Authenticated caller.
    pub user_id: UserId,
    /// Request ID for tracing/correlation.
    pub request_id: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequestContext {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if let Some(existing) = parts.extensions.get::<Self>() {
            return Ok(existing.clone());
        }

        let headers = &parts.headers;
        let request_id =
            request_id_from_headers(headers).unwrap_or_else(|| Ulid::new().to_string());

        let raw_user = if state.config.debug {
            user_id_from_headers(headers).ok_or_else(|| {
                ApiError::unauthenticated("missing X-User-Id header (debug mode)")
                    .with_request_id(request_id.clone())
            })?
        } else {
            user_from_jwt(headers, &state.config.jwt, &request_id)?
        };

        let user_id = UserId::new(raw_user).map_err(|_| {
            ApiError::unauthenticated("malformed user identity").with_request_id(request_id.clone())
        })?;

        let ctx = Self {
            user_id,
            request_id,
        };
        parts.extensions.insert(ctx.clone());
        Ok(ctx)
    }
}

fn user_from_jwt(headers: &HeaderMap, jwt: &JwtConfig, request_id: &str) -> Result<String, ApiError> {
    let token = bearer_token(headers).ok_or_else(|| {
        ApiError::unauthenticated("missing bearer token").with_request_id(request_id.to_string())
    })?;

    let secret = jwt.hs256_secret.as_deref().ok_or_else(|| {
        ApiError::internal("jwt.hs256_secret is required when debug=false")
            .with_request_id(request_id.to_string())
    })?;

    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_nbf = true;
    if let Some(iss) = jwt.issuer.as_deref() {
        validation.set_issuer(&[iss]);
    }
    if let Some(aud) = jwt.audience.as_deref() {
        validation.set_audience(&[aud]);
    } else {
        validation.validate_aud = false;
    }

    let data = jsonwebtoken::decode::<Value>(
        &token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|err| {
        tracing::debug!(error = %err, "bearer token rejected");
        invalid_token(request_id)
    })?;

    data.claims
        .as_object()
        .and_then(|claims| claims.get(USER_CLAIM))
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| invalid_token(request_id))
}

fn invalid_token(request_id: &str) -> ApiError {
    ApiError::unauthenticated("invalid or expired token").with_request_id(request_id.to_string())
}

fn request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    header_string(headers, "X-Request-Id").filter(|value| !value.is_empty())
}

fn user_id_from_headers(headers: &HeaderMap) -> Option<String> {
    header_string(headers, "X-User-Id").filter(|value| !value.is_empty())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = header_string(headers, "Authorization")?;
    let token = raw.strip_prefix("Bearer ")?;
    Some(token.trim().to_string())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Authentication middleware.
///
/// Rejects unauthenticated requests and injects a verified
/// [`RequestContext`] into request extensions.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let (mut parts, body) = req.into_parts();

    let ctx = match RequestContext::from_request_parts(&mut parts, &state).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };

    let mut req = Request::from_parts(parts, body);
    let request_id = ctx.request_id.clone();
    req.extensions_mut().insert(ctx);

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}
