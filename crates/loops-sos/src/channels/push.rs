//! Device push notifications.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use loops_core::Redacted;

use super::{ChannelKind, NotificationChannel, Notice};
use crate::contact::Contact;
use crate::error::{self, DeliveryError, SosError};

/// What a device receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    /// Notification title.
    pub title: String,
    /// Notification body.
    pub body: String,
    /// Event the notification is about.
    pub event_id: String,
    /// `alert` or `resolution`.
    pub kind: &'static str,
}

impl PushPayload {
    /// Builds the payload for `notice`.
    #[must_use]
    pub fn from_notice(notice: &Notice) -> Self {
        Self {
            title: notice.subject().to_string(),
            body: notice.summary(),
            event_id: notice.event_id().to_string(),
            kind: notice.kind().as_str(),
        }
    }
}

/// Push provider.
#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Sends `payload` to the device identified by `token`.
    async fn push(&self, token: &str, payload: &PushPayload) -> Result<(), DeliveryError>;
}

#[derive(Serialize)]
struct PushRequest<'a> {
    token: &'a str,
    notification: PushNotification<'a>,
    data: &'a PushPayload,
}

#[derive(Serialize)]
struct PushNotification<'a> {
    title: &'a str,
    body: &'a str,
}

/// Push gateway speaking JSON over HTTP.
///
/// `POST {endpoint}` with `{ token, notification: { title, body }, data }`.
#[derive(Debug, Clone)]
pub struct HttpPushGateway {
    client: reqwest::Client,
    endpoint: String,
    bearer_token: Option<Redacted<String>>,
}

impl HttpPushGateway {
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

    /// Creates a gateway for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not a valid URL or the HTTP client
    /// cannot be built.
    pub fn new(endpoint: impl Into<String>, bearer_token: Option<String>) -> error::Result<Self> {
        let endpoint = endpoint.into();
        reqwest::Url::parse(&endpoint)
            .map_err(|e| SosError::invalid_argument(format!("invalid push endpoint: {e}")))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Self::CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SosError::internal_with_source("failed to build HTTP client", e))?;
        Ok(Self {
            client,
            endpoint,
            bearer_token: bearer_token.map(Redacted),
        })
    }
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn push(&self, token: &str, payload: &PushPayload) -> Result<(), DeliveryError> {
        let body = PushRequest {
            token,
            notification: PushNotification {
                title: &payload.title,
                body: &payload.body,
            },
            data: payload,
        };
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(bearer) = &self.bearer_token {
            request = request.bearer_auth(&bearer.0);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::transport(format!("push request failed: {e}")))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(DeliveryError::rejected(format!("push gateway returned {status}: {detail}")))
        } else {
            Err(DeliveryError::transport(format!("push gateway returned {status}: {detail}")))
        }
    }
}

/// Channel delivering through a [`PushGateway`] to the contact's push token.
#[derive(Clone)]
pub struct PushChannel {
    gateway: Arc<dyn PushGateway>,
}

impl std::fmt::Debug for PushChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushChannel").finish_non_exhaustive()
    }
}

impl PushChannel {
    /// Creates a channel over `gateway`.
    #[must_use]
    pub fn new(gateway: Arc<dyn PushGateway>) -> Self {
        Self { gateway }
    }
}

fn push_token(contact: &Contact) -> Option<&str> {
    contact
        .push_token
        .as_deref()
        .filter(|token| !token.trim().is_empty())
}

#[async_trait]
impl NotificationChannel for PushChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Push
    }

    fn is_applicable(&self, contact: &Contact) -> bool {
        push_token(contact).is_some()
    }

    async fn send(&self, contact: &Contact, notice: &Notice) -> Result<(), DeliveryError> {
        let token = push_token(contact)
            .ok_or_else(|| DeliveryError::not_applicable("contact has no push token"))?;
        self.gateway
            .push(token, &PushPayload::from_notice(notice))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::PriorityTier;
    use loops_core::{ContactId, UserId};

    fn contact() -> Contact {
        Contact::new(
            ContactId::new("k1").unwrap(),
            UserId::new("u1").unwrap(),
            PriorityTier::Primary,
        )
    }

    struct NeverCalled;

    #[async_trait]
    impl PushGateway for NeverCalled {
        async fn push(&self, _: &str, _: &PushPayload) -> Result<(), DeliveryError> {
            Err(DeliveryError::transport("unexpected push"))
        }
    }

    #[test]
    fn applicability_follows_token() {
        let channel = PushChannel::new(Arc::new(NeverCalled));
        assert!(!channel.is_applicable(&contact()));
        assert!(!channel.is_applicable(&contact().with_push_token("  ")));
        assert!(channel.is_applicable(&contact().with_push_token("tok")));
    }

    #[test]
    fn gateway_rejects_bad_endpoint() {
        assert!(HttpPushGateway::new("not a url", None).is_err());
        assert!(HttpPushGateway::new("https://push.loops.app/v1/send", Some("s3cret".into())).is_ok());
    }
}
