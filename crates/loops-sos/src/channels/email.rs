//! Email fallback.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use loops_core::Redacted;

use super::{ChannelKind, EmailMessage, EmailTemplate, NotificationChannel, Notice};
use crate::contact::Contact;
use crate::error::{self, DeliveryError, SosError};

/// Default sender address.
pub const DEFAULT_FROM_EMAIL: &str = "noreply@loops.app";

/// Default public app URL used in email links.
pub const DEFAULT_APP_URL: &str = "https://loops.app";

/// SendGrid v3 mail send endpoint.
pub const SENDGRID_ENDPOINT: &str = "https://api.sendgrid.com/v3/mail/send";

/// Email provider.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    /// Sends `message`.
    async fn send(&self, message: &EmailMessage) -> Result<(), DeliveryError>;
}

/// Transport that only logs. Used when no provider is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEmailTransport;

#[async_trait]
impl EmailTransport for LoggingEmailTransport {
    async fn send(&self, message: &EmailMessage) -> Result<(), DeliveryError> {
        tracing::info!(
            to = %Redacted(&message.to),
            subject = %message.subject,
            template = ?message.template,
            "email delivery skipped: no provider configured"
        );
        Ok(())
    }
}

/// SendGrid settings.
#[derive(Debug, Clone)]
pub struct SendGridConfig {
    /// API key.
    pub api_key: Redacted<String>,
    /// Sender address.
    pub from_email: String,
    /// Public app URL passed to templates.
    pub app_url: String,
    /// Mail send endpoint.
    pub endpoint: String,
}

impl SendGridConfig {
    /// Settings with the default sender, app URL and endpoint.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Redacted(api_key.into()),
            from_email: DEFAULT_FROM_EMAIL.to_string(),
            app_url: DEFAULT_APP_URL.to_string(),
            endpoint: SENDGRID_ENDPOINT.to_string(),
        }
    }
}

#[derive(Serialize)]
struct SendGridAddress<'a> {
    email: &'a str,
}

#[derive(Serialize)]
struct SendGridPersonalization<'a> {
    to: [SendGridAddress<'a>; 1],
    dynamic_template_data: BTreeMap<&'a str, &'a str>,
}

#[derive(Serialize)]
struct SendGridContent<'a> {
    #[serde(rename = "type")]
    content_type: &'static str,
    value: &'a str,
}

#[derive(Serialize)]
struct SendGridRequest<'a> {
    personalizations: [SendGridPersonalization<'a>; 1],
    from: SendGridAddress<'a>,
    subject: &'a str,
    content: [SendGridContent<'a>; 1],
    categories: [&'static str; 1],
}

const fn template_category(template: EmailTemplate) -> &'static str {
    match template {
        EmailTemplate::SosAlert => "sos_alert",
        EmailTemplate::SosResolution => "sos_resolution",
    }
}

/// Transport for the SendGrid v3 HTTP API.
#[derive(Debug, Clone)]
pub struct SendGridTransport {
    client: reqwest::Client,
    config: SendGridConfig,
}

impl SendGridTransport {
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

    /// Creates a transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key is empty or the HTTP client cannot be built.
    pub fn new(config: SendGridConfig) -> error::Result<Self> {
        if config.api_key.0.trim().is_empty() {
            return Err(SosError::invalid_argument("SendGrid API key is empty"));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Self::CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SosError::internal_with_source("failed to build HTTP client", e))?;
        Ok(Self { client, config })
    }

    fn request_body<'a>(&'a self, message: &'a EmailMessage) -> SendGridRequest<'a> {
        let mut data: BTreeMap<&str, &str> = message
            .fields
            .iter()
            .map(|(key, value)| (*key, value.as_str()))
            .collect();
        data.insert("appUrl", &self.config.app_url);
        SendGridRequest {
            personalizations: [SendGridPersonalization {
                to: [SendGridAddress { email: &message.to }],
                dynamic_template_data: data,
            }],
            from: SendGridAddress {
                email: &self.config.from_email,
            },
            subject: &message.subject,
            content: [SendGridContent {
                content_type: "text/plain",
                value: &message.text,
            }],
            categories: [template_category(message.template)],
        }
    }
}

#[async_trait]
impl EmailTransport for SendGridTransport {
    async fn send(&self, message: &EmailMessage) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key.0)
            .json(&self.request_body(message))
            .send()
            .await
            .map_err(|e| DeliveryError::transport(format!("sendgrid request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(subject = %message.subject, "email accepted by sendgrid");
            return Ok(());
        }
        let detail = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(DeliveryError::rejected(format!("sendgrid returned {status}: {detail}")))
        } else {
            Err(DeliveryError::transport(format!("sendgrid returned {status}: {detail}")))
        }
    }
}

/// Channel delivering through an [`EmailTransport`] to the contact's address.
#[derive(Clone)]
pub struct EmailChannel {
    transport: Arc<dyn EmailTransport>,
}

impl std::fmt::Debug for EmailChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailChannel").finish_non_exhaustive()
    }
}

impl EmailChannel {
    /// Creates a channel over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn EmailTransport>) -> Self {
        Self { transport }
    }
}

fn email_address(contact: &Contact) -> Option<&str> {
    contact
        .email
        .as_deref()
        .map(str::trim)
        .filter(|email| email.contains('@'))
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    fn is_applicable(&self, contact: &Contact) -> bool {
        email_address(contact).is_some()
    }

    async fn send(&self, contact: &Contact, notice: &Notice) -> Result<(), DeliveryError> {
        let to = email_address(contact)
            .ok_or_else(|| DeliveryError::not_applicable("contact has no email address"))?;
        self.transport
            .send(&EmailMessage::for_notice(to, notice))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::AlertNotice;
    use crate::contact::PriorityTier;
    use crate::event::{Location, SosEvent, TriggerMethod};
    use chrono::Utc;
    use loops_core::{CircleId, ContactId, UserId};

    fn alert() -> Notice {
        let event = SosEvent::new(
            UserId::new("u1").unwrap(),
            CircleId::new("c1").unwrap(),
            Some(Location::new(1.0, 2.0, 3.0).unwrap()),
            TriggerMethod::Hold,
            Utc::now(),
        );
        Notice::Alert(AlertNotice::new(&event, "Dana"))
    }

    #[test]
    fn sendgrid_body_shape() {
        let transport = SendGridTransport::new(SendGridConfig::new("SG.key")).unwrap();
        let message = EmailMessage::for_notice("kim@example.com", &alert());
        let body = serde_json::to_value(transport.request_body(&message)).unwrap();

        assert_eq!(body["from"]["email"], DEFAULT_FROM_EMAIL);
        assert_eq!(body["subject"], "URGENT: SOS Alert from Dana");
        assert_eq!(body["personalizations"][0]["to"][0]["email"], "kim@example.com");
        let data = &body["personalizations"][0]["dynamic_template_data"];
        assert_eq!(data["appUrl"], DEFAULT_APP_URL);
        assert_eq!(data["mapLink"], "https://www.google.com/maps?q=1,2");
        assert_eq!(body["categories"][0], "sos_alert");
    }

    #[test]
    fn empty_api_key_is_rejected() {
        assert!(SendGridTransport::new(SendGridConfig::new(" ")).is_err());
    }

    #[test]
    fn applicability_requires_address() {
        let channel = EmailChannel::new(Arc::new(LoggingEmailTransport));
        let contact = Contact::new(
            ContactId::new("k1").unwrap(),
            UserId::new("u1").unwrap(),
            PriorityTier::Primary,
        );
        assert!(!channel.is_applicable(&contact));
        assert!(!channel.is_applicable(&contact.clone().with_email("not-an-address")));
        assert!(channel.is_applicable(&contact.with_email("kim@example.com")));
    }

    #[tokio::test]
    async fn logging_transport_succeeds() {
        let message = EmailMessage::for_notice("kim@example.com", &alert());
        assert!(LoggingEmailTransport.send(&message).await.is_ok());
    }
}
