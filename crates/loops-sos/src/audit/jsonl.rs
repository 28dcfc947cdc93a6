//! JSON-lines file [`AuditLog`].
//!
//! One entry per line, appended with a flush per entry so records survive the
//! process. Pruning rewrites the file through a sibling temporary file and an
//! atomic rename.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use loops_core::EventId;

use super::{AuditLog, NotificationLogEntry};
use crate::error::{Result, SosError};

/// Audit log persisted as newline-delimited JSON.
#[derive(Debug)]
pub struct JsonlAuditLog {
    path: PathBuf,
    // Serializes appends against prune rewrites.
    write_lock: Mutex<()>,
}

impl JsonlAuditLog {
    /// Opens (creating if needed) the log at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or its parent directory cannot be created.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                SosError::internal_with_source(
                    format!("failed to create audit log directory {}", parent.display()),
                    e,
                )
            })?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| {
                SosError::internal_with_source(
                    format!("failed to open audit log {}", path.display()),
                    e,
                )
            })?;
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Location of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<NotificationLogEntry>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SosError::internal_with_source("failed to read audit log", e));
            }
        };

        let mut entries = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<NotificationLogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(error) => {
                    // A torn final line after a crash must not hide the rest of the log.
                    tracing::warn!(line = index + 1, %error, "skipping unreadable audit entry");
                }
            }
        }
        Ok(entries)
    }
}

/// Returns true if the file is non-empty and its last byte is not a newline.
async fn ends_torn(file: &mut tokio::fs::File) -> Result<bool> {
    let len = file
        .metadata()
        .await
        .map_err(|e| SosError::internal_with_source("failed to stat audit log", e))?
        .len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))
        .await
        .map_err(|e| SosError::internal_with_source("failed to seek audit log", e))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)
        .await
        .map_err(|e| SosError::internal_with_source("failed to read audit log", e))?;
    Ok(last[0] != b'\n')
}

fn encode(entry: &NotificationLogEntry) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(entry)
        .map_err(|e| SosError::internal_with_source("failed to encode audit entry", e))?;
    line.push(b'\n');
    Ok(line)
}

#[async_trait]
impl AuditLog for JsonlAuditLog {
    async fn append(&self, entry: NotificationLogEntry) -> Result<()> {
        let line = encode(&entry)?;
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| SosError::internal_with_source("failed to open audit log", e))?;
        if ends_torn(&mut file).await? {
            tracing::warn!(path = %self.path.display(), "terminating torn audit line before append");
            file.write_all(b"\n")
                .await
                .map_err(|e| SosError::internal_with_source("failed to repair audit log", e))?;
        }
        file.write_all(&line)
            .await
            .map_err(|e| SosError::internal_with_source("failed to append audit entry", e))?;
        file.flush()
            .await
            .map_err(|e| SosError::internal_with_source("failed to flush audit log", e))?;
        Ok(())
    }

    async fn entries_for_event(
        &self,
        event_id: &EventId,
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationLogEntry>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|entry| &entry.event_id == event_id && !entry.is_expired(now))
            .collect())
    }

    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let entries = self.read_all().await?;
        let before = entries.len();

        let mut contents = Vec::new();
        for entry in entries.iter().filter(|entry| !entry.is_expired(now)) {
            contents.extend(encode(entry)?);
        }
        let kept = contents.iter().filter(|b| **b == b'\n').count();

        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, &contents)
            .await
            .map_err(|e| SosError::internal_with_source("failed to write pruned audit log", e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| SosError::internal_with_source("failed to replace audit log", e))?;

        let removed = before - kept;
        if removed > 0 {
            tracing::info!(removed, "pruned expired audit entries");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::DeliveryStatus;
    use crate::channels::{ChannelKind, NotificationKind};
    use chrono::Duration;
    use loops_core::ContactId;

    fn entry(event: EventId, at: DateTime<Utc>) -> NotificationLogEntry {
        NotificationLogEntry::new(
            event,
            ContactId::new("k1").unwrap(),
            ChannelKind::Push,
            NotificationKind::Alert,
            DeliveryStatus::Failed,
            at,
            Duration::days(7),
        )
        .with_error("gateway returned 503")
    }

    #[tokio::test]
    async fn entries_survive_reopen() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| SosError::internal(e.to_string()))?;
        let path = dir.path().join("audit").join("notifications.jsonl");
        let event = EventId::generate();
        let now = Utc::now();

        let log = JsonlAuditLog::open(&path).await?;
        log.append(entry(event, now)).await?;
        log.append(entry(EventId::generate(), now)).await?;
        drop(log);

        let reopened = JsonlAuditLog::open(&path).await?;
        let entries = reopened.entries_for_event(&event, now).await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].error_detail.as_deref(), Some("gateway returned 503"));
        Ok(())
    }

    #[tokio::test]
    async fn prune_rewrites_file() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| SosError::internal(e.to_string()))?;
        let log = JsonlAuditLog::open(dir.path().join("audit.jsonl")).await?;
        let event = EventId::generate();
        let now = Utc::now();
        log.append(entry(event, now - Duration::days(10))).await?;
        log.append(entry(event, now)).await?;

        assert_eq!(log.prune_expired(now).await?, 1);
        let contents = tokio::fs::read_to_string(log.path())
            .await
            .map_err(|e| SosError::internal(e.to_string()))?;
        assert_eq!(contents.lines().count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn torn_line_is_skipped() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| SosError::internal(e.to_string()))?;
        let log = JsonlAuditLog::open(dir.path().join("audit.jsonl")).await?;
        let event = EventId::generate();
        let now = Utc::now();
        log.append(entry(event, now)).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(log.path())
            .await
            .map_err(|e| SosError::internal(e.to_string()))?;
        file.write_all(b"{\"entryId\":\"trunc")
            .await
            .map_err(|e| SosError::internal(e.to_string()))?;

        assert_eq!(log.entries_for_event(&event, now).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn append_after_torn_line_starts_a_new_line() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| SosError::internal(e.to_string()))?;
        let log = JsonlAuditLog::open(dir.path().join("audit.jsonl")).await?;
        let event = EventId::generate();
        let now = Utc::now();

        tokio::fs::write(log.path(), b"{\"entryId\":\"trunc")
            .await
            .map_err(|e| SosError::internal(e.to_string()))?;
        log.append(entry(event, now)).await?;
        log.append(entry(event, now)).await?;

        assert_eq!(log.entries_for_event(&event, now).await?.len(), 2);
        let contents = tokio::fs::read_to_string(log.path())
            .await
            .map_err(|e| SosError::internal(e.to_string()))?;
        assert_eq!(contents.lines().count(), 3);
        Ok(())
    }
}
