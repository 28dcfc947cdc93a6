//! Append-only record of notification attempts.
//!
//! Every channel attempt, successful or not, produces one
//! [`NotificationLogEntry`]. Entries are never updated; a retry appends a new
//! entry. Entries expire after a retention period and are then excluded from
//! queries and eligible for pruning.

pub mod jsonl;
pub mod memory;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use loops_core::{ContactId, EventId};

use crate::channels::{ChannelKind, NotificationKind};
use crate::error::Result;

pub use jsonl::JsonlAuditLog;
pub use memory::InMemoryAuditLog;

/// Default retention of audit entries, in days.
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

/// Outcome of one channel attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Handed to a provider.
    Sent,
    /// Received by the contact's live session.
    Delivered,
    /// The attempt failed.
    Failed,
}

impl DeliveryStatus {
    /// Returns true for `sent` and `delivered`.
    #[must_use]
    pub const fn is_success(self) -> bool {
        !matches!(self, Self::Failed)
    }

    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

/// One notification attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationLogEntry {
    /// Entry identifier.
    pub entry_id: String,
    /// The event notified about.
    pub event_id: EventId,
    /// The contact attempted.
    pub contact_id: ContactId,
    /// The channel attempted.
    pub channel: ChannelKind,
    /// Alert or resolution pass.
    pub kind: NotificationKind,
    /// Outcome.
    pub status: DeliveryStatus,
    /// When the attempt finished.
    pub timestamp: DateTime<Utc>,
    /// When the entry stops being retained.
    pub expire_at: DateTime<Utc>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl NotificationLogEntry {
    /// Creates an entry that expires `retention` after `timestamp`.
    #[must_use]
    pub fn new(
        event_id: EventId,
        contact_id: ContactId,
        channel: ChannelKind,
        kind: NotificationKind,
        status: DeliveryStatus,
        timestamp: DateTime<Utc>,
        retention: Duration,
    ) -> Self {
        Self {
            entry_id: Ulid::new().to_string(),
            event_id,
            contact_id,
            channel,
            kind,
            status,
            timestamp,
            expire_at: timestamp + retention,
            error_detail: None,
        }
    }

    /// Attaches a failure description.
    #[must_use]
    pub fn with_error(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }

    /// Returns true if the entry has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at <= now
    }
}

/// Durable, append-only store of notification attempts.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Appends an entry.
    async fn append(&self, entry: NotificationLogEntry) -> Result<()>;

    /// Unexpired entries for `event_id` in append order.
    async fn entries_for_event(
        &self,
        event_id: &EventId,
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationLogEntry>>;

    /// Contacts with an unexpired successful entry of `kind` for `event_id`.
    async fn reached_contacts(
        &self,
        event_id: &EventId,
        kind: NotificationKind,
        now: DateTime<Utc>,
    ) -> Result<HashSet<ContactId>> {
        Ok(self
            .entries_for_event(event_id, now)
            .await?
            .into_iter()
            .filter(|entry| entry.kind == kind && entry.status.is_success())
            .map(|entry| entry.contact_id)
            .collect())
    }

    /// Removes expired entries. Returns how many were removed.
    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}
