//! End-to-end tests of the SOS HTTP surface against an in-memory engine.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use jsonwebtoken::{EncodingKey, Header};
use serde_json::{Value, json};
use tower::ServiceExt;

use loops_api::server::{Server, ServerBuilder};
use loops_sos::prelude::*;
use loops_sos::testing::ScriptedChannel;

const SECRET: &str = "test-secret";

struct Harness {
    server: Server,
    router: Router,
    email: Arc<ScriptedChannel>,
}

impl Harness {
    fn new(builder: ServerBuilder) -> Result<Self> {
        let email = Arc::new(ScriptedChannel::succeeding(ChannelKind::Email));
        let server = builder.channels(vec![email.clone()]).build();
        let engine = server.engine();

        for (user, name) in [("alice", "Alice"), ("mallory", "Mallory")] {
            let user_id = UserId::new(user)?;
            engine
                .directory
                .upsert_profile(UserProfile::new(user_id.clone(), name))?;
            engine
                .directory
                .add_circle_member(CircleId::new("family")?, user_id)?;
        }
        engine.directory.add_contact(
            Contact::new(
                ContactId::new("bob")?,
                UserId::new("alice")?,
                PriorityTier::Primary,
            )
            .with_email("bob@example.com"),
        )?;

        let router = server.test_router();
        Ok(Self {
            server,
            router,
            email,
        })
    }

    fn debug() -> Result<Self> {
        Self::new(ServerBuilder::new().debug(true))
    }

    async fn send(&self, request: Request<Body>) -> Result<Response> {
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .map_err(|err| match err {})?)
    }

    async fn trigger_as(&self, user: &str, body: Value) -> Result<Response> {
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/sos")
            .header("content-type", "application/json")
            .header("X-User-Id", user)
            .body(Body::from(body.to_string()))
            .context("build request")?;
        self.send(request).await
    }

    async fn resolve_as(&self, user: &str, event_id: &str, body: Value) -> Result<Response> {
        let request = Request::builder()
            .method("PATCH")
            .uri(format!("/api/v1/sos/{event_id}"))
            .header("content-type", "application/json")
            .header("X-User-Id", user)
            .body(Body::from(body.to_string()))
            .context("build request")?;
        self.send(request).await
    }

    async fn history_as(&self, user: &str, event_id: &str) -> Result<Response> {
        let request = Request::builder()
            .uri(format!("/api/v1/sos/{event_id}/notifications"))
            .header("X-User-Id", user)
            .body(Body::empty())
            .context("build request")?;
        self.send(request).await
    }

    async fn drain(&self) -> Result<usize> {
        let engine = self.server.engine();
        Ok(engine.orchestrator.drain(engine.queue.as_ref()).await?)
    }
}

async fn json_body(response: Response) -> Result<Value> {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .context("read response body")?;
    serde_json::from_slice(&body).context("parse JSON body")
}

fn family_alert() -> Value {
    json!({
        "circleId": "family",
        "location": {"lat": 52.52, "lon": 13.405, "accuracyMeters": 12.0},
        "triggerMethod": "hold"
    })
}

fn token_for(sub: &str) -> Result<String> {
    let exp = chrono::Utc::now().timestamp() + 3600;
    jsonwebtoken::encode(
        &Header::default(),
        &json!({"sub": sub, "exp": exp}),
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .context("encode token")
}

#[tokio::test]
async fn trigger_is_accepted_and_notifies_contacts() -> Result<()> {
    let harness = Harness::debug()?;

    let response = harness.trigger_as("alice", family_alert()).await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(response.headers().contains_key("x-request-id"));
    let body = json_body(response).await?;
    assert_eq!(body["status"], "success");
    let event_id = body["eventId"].as_str().expect("eventId").to_string();

    assert_eq!(harness.drain().await?, 1);
    assert_eq!(harness.email.calls().len(), 1);

    let response = harness.history_as("alice", &event_id).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let history = json_body(response).await?;
    assert_eq!(history["eventId"], event_id.as_str());
    let entries = history["notifications"].as_array().expect("notifications");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["contactId"], "bob");
    assert_eq!(entries[0]["channel"], "email");
    assert_eq!(entries[0]["kind"], "alert");
    assert_eq!(entries[0]["status"], "sent");
    Ok(())
}

#[tokio::test]
async fn fourth_trigger_is_rate_limited_with_retry_after() -> Result<()> {
    let harness = Harness::debug()?;

    for _ in 0..3 {
        let response = harness.trigger_as("alice", family_alert()).await?;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    let response = harness.trigger_as("alice", family_alert()).await?;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response
        .headers()
        .get("retry-after")
        .expect("Retry-After header")
        .to_str()?
        .parse()?;
    assert!((3599..=3600).contains(&retry_after));
    let body = json_body(response).await?;
    assert_eq!(body["code"], "RATE_LIMITED");
    assert!(body["requestId"].is_string());

    // Another user is unaffected.
    let response = harness.trigger_as("mallory", family_alert()).await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    Ok(())
}

#[tokio::test]
async fn missing_identity_is_unauthenticated() -> Result<()> {
    let harness = Harness::debug()?;

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/sos")
        .header("content-type", "application/json")
        .body(Body::from(family_alert().to_string()))?;
    let response = harness.send(request).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await?["code"], "UNAUTHENTICATED");
    Ok(())
}

#[tokio::test]
async fn bearer_tokens_identify_the_caller() -> Result<()> {
    let harness = Harness::new(ServerBuilder::new().jwt_hs256_secret(SECRET))?;

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/sos")
        .header("content-type", "application/json")
        .header("Authorization", format!("Bearer {}", token_for("alice")?))
        .body(Body::from(family_alert().to_string()))?;
    let response = harness.send(request).await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // Debug headers are ignored in production mode.
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/sos")
        .header("content-type", "application/json")
        .header("X-User-Id", "alice")
        .body(Body::from(family_alert().to_string()))?;
    assert_eq!(
        harness.send(request).await?.status(),
        StatusCode::UNAUTHORIZED
    );

    let forged = jsonwebtoken::encode(
        &Header::default(),
        &json!({"sub": "alice", "exp": chrono::Utc::now().timestamp() + 3600}),
        &EncodingKey::from_secret(b"wrong-secret"),
    )?;
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/sos")
        .header("content-type", "application/json")
        .header("Authorization", format!("Bearer {forged}"))
        .body(Body::from(family_alert().to_string()))?;
    assert_eq!(
        harness.send(request).await?.status(),
        StatusCode::UNAUTHORIZED
    );
    Ok(())
}

#[tokio::test]
async fn unknown_circle_is_resource_missing() -> Result<()> {
    let harness = Harness::debug()?;

    let response = harness
        .trigger_as("alice", json!({"circleId": "strangers"}))
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await?["code"], "RESOURCE_MISSING");

    let response = harness.trigger_as("alice", json!({})).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn malformed_requests_do_not_consume_quota() -> Result<()> {
    let harness = Harness::debug()?;

    let bad_location = json!({
        "circleId": "family",
        "location": {"lat": 95.0, "lon": 0.0, "accuracyMeters": 5.0}
    });
    let response = harness.trigger_as("alice", bad_location).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await?["code"], "INVALID_ARGUMENT");

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/sos")
        .header("content-type", "application/json")
        .header("X-User-Id", "alice")
        .body(Body::from("{not json"))?;
    assert_eq!(harness.send(request).await?.status(), StatusCode::BAD_REQUEST);

    for _ in 0..3 {
        let response = harness.trigger_as("alice", family_alert()).await?;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }
    Ok(())
}

#[tokio::test]
async fn owner_resolves_exactly_once() -> Result<()> {
    let harness = Harness::debug()?;

    let body = json_body(harness.trigger_as("alice", family_alert()).await?).await?;
    let event_id = body["eventId"].as_str().expect("eventId").to_string();
    let resolve = json!({"status": "resolved", "resolutionReason": "false_alarm"});

    let response = harness
        .resolve_as("mallory", &event_id, resolve.clone())
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = harness.resolve_as("alice", &event_id, resolve.clone()).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let event = json_body(response).await?;
    assert_eq!(event["status"], "resolved");
    assert_eq!(event["resolutionReason"], "false_alarm");
    assert!(event["resolvedAt"].is_string());

    let response = harness.resolve_as("alice", &event_id, resolve).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = harness
        .resolve_as("alice", &event_id, json!({"status": "active"}))
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn history_is_owner_only() -> Result<()> {
    let harness = Harness::debug()?;

    let body = json_body(harness.trigger_as("alice", family_alert()).await?).await?;
    let event_id = body["eventId"].as_str().expect("eventId").to_string();

    let response = harness.history_as("mallory", &event_id).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = harness.history_as("alice", "not-an-event-id").await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = harness
        .history_as("alice", &EventId::generate().to_string())
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Nothing delivered yet: history exists but is empty.
    let response = harness.history_as("alice", &event_id).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let history = json_body(response).await?;
    assert!(history["notifications"].as_array().expect("array").is_empty());
    Ok(())
}

#[tokio::test]
async fn request_id_is_echoed() -> Result<()> {
    let harness = Harness::debug()?;

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/sos")
        .header("content-type", "application/json")
        .header("X-User-Id", "alice")
        .header("X-Request-Id", "req-123")
        .body(Body::from(json!({"circleId": "strangers"}).to_string()))?;
    let response = harness.send(request).await?;
    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok()),
        Some("req-123")
    );
    assert_eq!(json_body(response).await?["requestId"], "req-123");
    Ok(())
}
