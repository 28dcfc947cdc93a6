//! Notification delivery channels.
//!
//! The cascade tries channels in [`ChannelKind::CASCADE_ORDER`]: push,
//! then peer-link, then email. Each channel decides whether it can reach a
//! contact at all ([`NotificationChannel::is_applicable`]); channels that
//! cannot are skipped without an attempt.

pub mod email;
pub mod notice;
pub mod peer_link;
pub mod push;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::audit::DeliveryStatus;
use crate::contact::Contact;
use crate::error::DeliveryError;

pub use email::{EmailChannel, EmailTransport, LoggingEmailTransport, SendGridConfig, SendGridTransport};
pub use notice::{AlertNotice, EmailMessage, EmailTemplate, Notice, NotificationKind, ResolutionNotice};
pub use peer_link::{PeerLinkChannel, PeerLinkFrame, PeerLinkRegistry};
pub use push::{HttpPushGateway, PushChannel, PushGateway, PushPayload};

/// A delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Device push notification.
    #[serde(rename = "push")]
    Push,
    /// Direct link to an open peer session.
    #[serde(rename = "peer-link")]
    PeerLink,
    /// Email fallback.
    #[serde(rename = "email")]
    Email,
}

impl ChannelKind {
    /// Order in which the alert cascade tries channels.
    pub const CASCADE_ORDER: [Self; 3] = [Self::Push, Self::PeerLink, Self::Email];

    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::PeerLink => "peer-link",
            Self::Email => "email",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One way of reaching a contact.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Which channel this is.
    fn kind(&self) -> ChannelKind;

    /// Status recorded when a send succeeds.
    fn success_status(&self) -> DeliveryStatus {
        DeliveryStatus::Sent
    }

    /// Returns true if this channel can reach `contact`.
    fn is_applicable(&self, contact: &Contact) -> bool;

    /// Delivers `notice` to `contact`.
    async fn send(&self, contact: &Contact, notice: &Notice) -> Result<(), DeliveryError>;
}
