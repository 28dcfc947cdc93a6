//! Message data for alert and resolution notifications.
//!
//! The engine decides what a notification says; how it looks (HTML
//! templates, push layouts) belongs to the delivery providers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use loops_core::EventId;

use crate::event::{Location, SosEvent};

/// Shown when the owner resolved without giving a reason.
pub const NO_REASON_PROVIDED: &str = "No reason provided";

/// Which pass of the cascade produced a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// The initial SOS alert.
    Alert,
    /// The follow-up sent when the event is resolved.
    Resolution,
}

impl NotificationKind {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Alert => "alert",
            Self::Resolution => "resolution",
        }
    }
}

/// Formats a timestamp the way notifications show it, e.g. `14:05 UTC`.
#[must_use]
pub fn format_clock(at: DateTime<Utc>) -> String {
    at.format("%H:%M UTC").to_string()
}

/// Content of an SOS alert.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertNotice {
    /// The event being announced.
    pub event_id: EventId,
    /// Display name of the person in danger.
    pub sender_name: String,
    /// Headline.
    pub subject: String,
    /// Trigger time, e.g. `14:05 UTC`.
    pub event_time: String,
    /// Location at trigger time.
    pub location: Option<Location>,
    /// Maps link for `location`.
    pub map_link: Option<String>,
}

impl AlertNotice {
    /// Builds the alert for `event`, sent on behalf of `sender_name`.
    #[must_use]
    pub fn new(event: &SosEvent, sender_name: &str) -> Self {
        Self {
            event_id: event.event_id,
            sender_name: sender_name.to_string(),
            subject: format!("URGENT: SOS Alert from {sender_name}"),
            event_time: format_clock(event.created_at),
            location: event.location,
            map_link: event.location.as_ref().map(Location::map_link),
        }
    }
}

/// Content of a resolution update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionNotice {
    /// The resolved event.
    pub event_id: EventId,
    /// Display name of the event owner.
    pub sender_name: String,
    /// Headline.
    pub subject: String,
    /// Trigger time.
    pub event_time: String,
    /// Resolution time.
    pub resolution_time: String,
    /// Resolution reason, or [`NO_REASON_PROVIDED`].
    pub resolution_reason: String,
}

impl ResolutionNotice {
    /// Builds the update for a resolved `event`.
    #[must_use]
    pub fn new(event: &SosEvent, sender_name: &str) -> Self {
        Self {
            event_id: event.event_id,
            sender_name: sender_name.to_string(),
            subject: format!("Update: SOS from {sender_name} is Resolved"),
            event_time: format_clock(event.created_at),
            resolution_time: event
                .resolved_at
                .map_or_else(|| "N/A".to_string(), format_clock),
            resolution_reason: event
                .resolution_reason
                .map_or_else(|| NO_REASON_PROVIDED.to_string(), |r| r.as_str().to_string()),
        }
    }
}

/// A notification of either kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// See [`AlertNotice`].
    Alert(AlertNotice),
    /// See [`ResolutionNotice`].
    Resolution(ResolutionNotice),
}

impl Notice {
    /// Which pass produced this notice.
    #[must_use]
    pub const fn kind(&self) -> NotificationKind {
        match self {
            Self::Alert(_) => NotificationKind::Alert,
            Self::Resolution(_) => NotificationKind::Resolution,
        }
    }

    /// The event the notice is about.
    #[must_use]
    pub const fn event_id(&self) -> EventId {
        match self {
            Self::Alert(alert) => alert.event_id,
            Self::Resolution(update) => update.event_id,
        }
    }

    /// Headline.
    #[must_use]
    pub fn subject(&self) -> &str {
        match self {
            Self::Alert(alert) => &alert.subject,
            Self::Resolution(update) => &update.subject,
        }
    }

    /// One-paragraph plain text body for channels without templates.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Alert(alert) => {
                let mut text = format!(
                    "{} triggered an SOS at {}.",
                    alert.sender_name, alert.event_time
                );
                if let Some(link) = &alert.map_link {
                    text.push_str(" Last known location: ");
                    text.push_str(link);
                }
                text
            }
            Self::Resolution(update) => format!(
                "{} resolved their SOS from {} at {}. Reason: {}.",
                update.sender_name,
                update.event_time,
                update.resolution_time,
                update.resolution_reason
            ),
        }
    }
}

/// Template a provider renders for an email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailTemplate {
    /// SOS alert layout.
    SosAlert,
    /// Resolution layout.
    SosResolution,
}

/// An email ready for a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    /// Recipient address.
    pub to: String,
    /// Subject line.
    pub subject: String,
    /// Layout to render.
    pub template: EmailTemplate,
    /// Template variables.
    pub fields: BTreeMap<&'static str, String>,
    /// Plain-text alternative.
    pub text: String,
}

impl EmailMessage {
    /// Builds the email for `notice` addressed to `to`.
    #[must_use]
    pub fn for_notice(to: impl Into<String>, notice: &Notice) -> Self {
        let (template, fields) = match notice {
            Notice::Alert(alert) => {
                let mut fields = BTreeMap::new();
                fields.insert("userName", alert.sender_name.clone());
                fields.insert("eventTime", alert.event_time.clone());
                if let Some(link) = &alert.map_link {
                    fields.insert("mapLink", link.clone());
                }
                (EmailTemplate::SosAlert, fields)
            }
            Notice::Resolution(update) => {
                let fields = BTreeMap::from([
                    ("userName", update.sender_name.clone()),
                    ("eventTime", update.event_time.clone()),
                    ("resolutionTime", update.resolution_time.clone()),
                    ("resolutionReason", update.resolution_reason.clone()),
                ]);
                (EmailTemplate::SosResolution, fields)
            }
        };
        Self {
            to: to.into(),
            subject: notice.subject().to_string(),
            template,
            fields,
            text: notice.summary(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ResolutionReason, TriggerMethod};
    use loops_core::{CircleId, UserId};

    fn event_at(hour: u32, minute: u32) -> SosEvent {
        let created_at = DateTime::parse_from_rfc3339(&format!(
            "2026-03-01T{hour:02}:{minute:02}:30Z"
        ))
        .unwrap()
        .with_timezone(&Utc);
        SosEvent::new(
            UserId::new("u1").unwrap(),
            CircleId::new("c1").unwrap(),
            Some(Location::new(34.05, -118.25, 10.0).unwrap()),
            TriggerMethod::Hold,
            created_at,
        )
    }

    #[test]
    fn alert_content() {
        let notice = AlertNotice::new(&event_at(9, 5), "Dana");
        assert_eq!(notice.subject, "URGENT: SOS Alert from Dana");
        assert_eq!(notice.event_time, "09:05 UTC");
        assert_eq!(
            notice.map_link.as_deref(),
            Some("https://www.google.com/maps?q=34.05,-118.25")
        );
    }

    #[test]
    fn alert_without_location_has_no_link() {
        let mut event = event_at(9, 5);
        event.location = None;
        let notice = Notice::Alert(AlertNotice::new(&event, "Dana"));
        let email = EmailMessage::for_notice("kim@example.com", &notice);
        assert!(!email.fields.contains_key("mapLink"));
        assert!(!email.text.contains("maps"));
    }

    #[test]
    fn resolution_without_reason() {
        let mut event = event_at(9, 5);
        event.resolve(None, event.created_at + chrono::Duration::minutes(20)).unwrap();
        let notice = ResolutionNotice::new(&event, "Dana");
        assert_eq!(notice.subject, "Update: SOS from Dana is Resolved");
        assert_eq!(notice.resolution_reason, NO_REASON_PROVIDED);
        assert_eq!(notice.resolution_time, "09:25 UTC");
    }

    #[test]
    fn resolution_email_fields() {
        let mut event = event_at(22, 40);
        event
            .resolve(Some(ResolutionReason::AllOk), event.created_at)
            .unwrap();
        let notice = Notice::Resolution(ResolutionNotice::new(&event, "Dana"));
        let email = EmailMessage::for_notice("kim@example.com", &notice);
        assert_eq!(email.template, EmailTemplate::SosResolution);
        assert_eq!(email.fields["resolutionReason"], "all_ok");
        assert_eq!(notice.kind(), NotificationKind::Resolution);
    }
}
