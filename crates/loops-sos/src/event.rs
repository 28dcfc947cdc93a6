//! SOS event record and its lifecycle.
//!
//! An event is created `active` inside the admission transaction and moves
//! to `resolved` exactly once. There is no transition out of `resolved`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use loops_core::{CircleId, EventId, UserId};

use crate::error::{Result, SosError};

/// Lifecycle status of an SOS event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Help is needed; notifications are in flight.
    Active,
    /// The owner closed the event.
    Resolved,
}

impl EventStatus {
    /// Returns true if no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved)
    }

    /// Returns true if moving to `target` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, target: Self) -> bool {
        matches!((self, target), (Self::Active, Self::Resolved))
    }

    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Resolved => "resolved",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the user raised the alert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMethod {
    /// Press-and-hold on the SOS button.
    #[default]
    Hold,
    /// Shake gesture.
    Shake,
    /// Voice command.
    Voice,
}

/// Why the owner resolved the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionReason {
    /// The alert was raised by mistake.
    FalseAlarm,
    /// The user is safe.
    AllOk,
    /// The emergency was dealt with.
    EmergencyHandled,
}

impl ResolutionReason {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FalseAlarm => "false_alarm",
            Self::AllOk => "all_ok",
            Self::EmergencyHandled => "emergency_handled",
        }
    }
}

impl std::fmt::Display for ResolutionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the user was when the alert was raised.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    /// Horizontal accuracy radius in meters.
    pub accuracy_meters: f64,
}

impl Location {
    /// Creates a validated location.
    ///
    /// # Errors
    ///
    /// Returns [`SosError::InvalidArgument`] if a coordinate is out of range
    /// or not finite, or the accuracy is negative.
    pub fn new(lat: f64, lon: f64, accuracy_meters: f64) -> Result<Self> {
        let location = Self {
            lat,
            lon,
            accuracy_meters,
        };
        location.validate()?;
        Ok(location)
    }

    /// Checks coordinate ranges.
    ///
    /// # Errors
    ///
    /// Returns [`SosError::InvalidArgument`] describing the first bad field.
    pub fn validate(&self) -> Result<()> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(SosError::invalid_argument(format!(
                "latitude must be within [-90, 90], got {}",
                self.lat
            )));
        }
        if !self.lon.is_finite() || !(-180.0..=180.0).contains(&self.lon) {
            return Err(SosError::invalid_argument(format!(
                "longitude must be within [-180, 180], got {}",
                self.lon
            )));
        }
        if !self.accuracy_meters.is_finite() || self.accuracy_meters < 0.0 {
            return Err(SosError::invalid_argument(format!(
                "accuracy must be a non-negative number of meters, got {}",
                self.accuracy_meters
            )));
        }
        Ok(())
    }

    /// A maps link centered on this location.
    #[must_use]
    pub fn map_link(&self) -> String {
        format!("https://www.google.com/maps?q={},{}", self.lat, self.lon)
    }
}

/// The canonical SOS event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SosEvent {
    /// Server-generated identifier.
    pub event_id: EventId,
    /// The user who raised the alert.
    pub user_id: UserId,
    /// The circle the alert was raised in.
    pub circle_id: CircleId,
    /// Lifecycle status.
    pub status: EventStatus,
    /// Location at trigger time, if shared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// How the alert was raised.
    pub trigger_method: TriggerMethod,
    /// Commit time of the admission transaction.
    pub created_at: DateTime<Utc>,
    /// When the event was resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Why the event was resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_reason: Option<ResolutionReason>,
    /// When the alert pass for this event finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notified_at: Option<DateTime<Utc>>,
}

impl SosEvent {
    /// Creates a new active event.
    #[must_use]
    pub fn new(
        user_id: UserId,
        circle_id: CircleId,
        location: Option<Location>,
        trigger_method: TriggerMethod,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: EventId::generate(),
            user_id,
            circle_id,
            status: EventStatus::Active,
            location,
            trigger_method,
            created_at,
            resolved_at: None,
            resolution_reason: None,
            notified_at: None,
        }
    }

    /// Returns true while the event is active.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.status, EventStatus::Active)
    }

    /// Moves the event to `resolved`.
    ///
    /// # Errors
    ///
    /// Returns [`SosError::InvalidArgument`] if the event is already resolved.
    pub fn resolve(&mut self, reason: Option<ResolutionReason>, at: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(EventStatus::Resolved) {
            return Err(SosError::invalid_argument(format!(
                "event {} is already {}",
                self.event_id, self.status
            )));
        }
        self.status = EventStatus::Resolved;
        self.resolved_at = Some(at);
        self.resolution_reason = reason;
        Ok(())
    }
}

/// A committed change to an event, as seen by change listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct EventChange {
    /// Record before the write; `None` for creation.
    pub before: Option<SosEvent>,
    /// Record after the write; `None` for deletion.
    pub after: Option<SosEvent>,
}

impl EventChange {
    /// Returns the resolved record if this change moved an event from active to resolved.
    #[must_use]
    pub fn resolution(&self) -> Option<&SosEvent> {
        match (&self.before, &self.after) {
            (Some(before), Some(after))
                if before.status == EventStatus::Active
                    && after.status == EventStatus::Resolved =>
            {
                Some(after)
            }
            _ => None,
        }
    }
}
