//! Trusted contacts and user profiles.
//!
//! Both are owned by external profile/circle management; the engine only reads them.

use serde::{Deserialize, Serialize};

use loops_core::{ContactId, Redacted, UserId};

/// Escalation tier of a contact. Tier 1 is notified with the highest urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PriorityTier {
    /// Closest contacts.
    Primary,
    /// Secondary contacts.
    Secondary,
    /// Everyone else.
    Tertiary,
}

impl TryFrom<u8> for PriorityTier {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Primary),
            2 => Ok(Self::Secondary),
            3 => Ok(Self::Tertiary),
            other => Err(format!("priority tier must be 1, 2 or 3, got {other}")),
        }
    }
}

impl From<PriorityTier> for u8 {
    fn from(value: PriorityTier) -> Self {
        match value {
            PriorityTier::Primary => 1,
            PriorityTier::Secondary => 2,
            PriorityTier::Tertiary => 3,
        }
    }
}

/// A person to notify when the owning user raises an alert.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    /// Contact identifier.
    pub contact_id: ContactId,
    /// The user this contact belongs to.
    pub user_id: UserId,
    /// Escalation tier.
    pub priority_tier: PriorityTier,
    /// Email address, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Push token for the contact's device, if registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_token: Option<String>,
}

impl std::fmt::Debug for Contact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Contact")
            .field("contact_id", &self.contact_id)
            .field("user_id", &self.user_id)
            .field("priority_tier", &self.priority_tier)
            .field("email", &self.email.as_ref().map(Redacted))
            .field("push_token", &self.push_token.as_ref().map(Redacted))
            .finish()
    }
}

impl Contact {
    /// Creates a contact with no delivery addresses.
    #[must_use]
    pub const fn new(contact_id: ContactId, user_id: UserId, priority_tier: PriorityTier) -> Self {
        Self {
            contact_id,
            user_id,
            priority_tier,
            email: None,
            push_token: None,
        }
    }

    /// Sets the email address.
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Sets the push token.
    #[must_use]
    pub fn with_push_token(mut self, token: impl Into<String>) -> Self {
        self.push_token = Some(token.into());
        self
    }
}

/// The parts of a user profile the engine reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    /// The user.
    pub user_id: UserId,
    /// Name shown to contacts.
    pub display_name: String,
}

impl UserProfile {
    /// Creates a profile.
    #[must_use]
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
        }
    }
}
