//! In-memory [`AuditLog`].

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use loops_core::EventId;

use super::{AuditLog, NotificationLogEntry};
use crate::error::{Result, SosError};

fn poison_err<T>(_: PoisonError<T>) -> SosError {
    SosError::internal("audit log lock poisoned")
}

/// Audit log held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    entries: RwLock<Vec<NotificationLogEntry>>,
}

impl InMemoryAuditLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry ever appended and not yet pruned, expired or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn all(&self) -> Result<Vec<NotificationLogEntry>> {
        Ok(self.entries.read().map_err(poison_err)?.clone())
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, entry: NotificationLogEntry) -> Result<()> {
        self.entries.write().map_err(poison_err)?.push(entry);
        Ok(())
    }

    async fn entries_for_event(
        &self,
        event_id: &EventId,
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationLogEntry>> {
        let entries = self.entries.read().map_err(poison_err)?;
        Ok(entries
            .iter()
            .filter(|entry| &entry.event_id == event_id && !entry.is_expired(now))
            .cloned()
            .collect())
    }

    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        let before = entries.len();
        entries.retain(|entry| !entry.is_expired(now));
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::DeliveryStatus;
    use crate::channels::{ChannelKind, NotificationKind};
    use chrono::Duration;
    use loops_core::ContactId;

    fn entry(event: EventId, at: DateTime<Utc>) -> Result<NotificationLogEntry> {
        Ok(NotificationLogEntry::new(
            event,
            ContactId::new("k1")?,
            ChannelKind::Email,
            NotificationKind::Alert,
            DeliveryStatus::Sent,
            at,
            Duration::days(7),
        ))
    }

    #[tokio::test]
    async fn queries_are_per_event_and_skip_expired() -> Result<()> {
        let log = InMemoryAuditLog::new();
        let now = Utc::now();
        let event = EventId::generate();
        log.append(entry(event, now - Duration::days(8))?).await?;
        log.append(entry(event, now)?).await?;
        log.append(entry(EventId::generate(), now)?).await?;

        assert_eq!(log.entries_for_event(&event, now).await?.len(), 1);

        let failed = entry(event, now)?;
        log.append(NotificationLogEntry {
            contact_id: ContactId::new("k2")?,
            status: DeliveryStatus::Failed,
            ..failed
        })
        .await?;

        let reached = log
            .reached_contacts(&event, NotificationKind::Alert, now)
            .await?;
        assert_eq!(reached.len(), 1);
        assert!(reached.contains(&ContactId::new("k1")?));
        assert!(log
            .reached_contacts(&event, NotificationKind::Resolution, now)
            .await?
            .is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn prune_removes_only_expired() -> Result<()> {
        let log = InMemoryAuditLog::new();
        let now = Utc::now();
        let event = EventId::generate();
        log.append(entry(event, now - Duration::days(8))?).await?;
        log.append(entry(event, now)?).await?;

        assert_eq!(log.prune_expired(now).await?, 1);
        assert_eq!(log.all()?.len(), 1);
        assert_eq!(log.prune_expired(now).await?, 0);
        Ok(())
    }
}
