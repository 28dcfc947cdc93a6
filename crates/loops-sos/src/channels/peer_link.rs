//! Direct delivery to contacts with an open peer session.
//!
//! Session signaling and relay are external. The registry only tracks live
//! receivers: whoever holds the [`mpsc::Receiver`] returned by
//! [`PeerLinkRegistry::open`] forwards frames to the contact's device.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;

use loops_core::{ContactId, EventId};

use super::{ChannelKind, NotificationChannel, Notice, NotificationKind};
use crate::audit::DeliveryStatus;
use crate::contact::Contact;
use crate::error::{DeliveryError, Result, SosError};

fn poison_err<T>(_: PoisonError<T>) -> SosError {
    SosError::internal("peer session registry poisoned")
}

/// Frames buffered per session before sends are rejected.
pub const SESSION_BUFFER: usize = 16;

/// A notification pushed over a peer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerLinkFrame {
    /// Event the frame is about.
    pub event_id: EventId,
    /// Alert or resolution.
    pub kind: NotificationKind,
    /// Headline.
    pub subject: String,
    /// Body text.
    pub body: String,
}

/// Live peer sessions keyed by contact.
#[derive(Debug, Default)]
pub struct PeerLinkRegistry {
    sessions: RwLock<HashMap<ContactId, mpsc::Sender<PeerLinkFrame>>>,
}

impl PeerLinkRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens (or replaces) the session for `contact`.
    ///
    /// Called by the session relay once signaling completes; frames pushed
    /// to the contact arrive on the returned receiver.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the registry lock is poisoned.
    pub fn open(&self, contact: ContactId) -> Result<mpsc::Receiver<PeerLinkFrame>> {
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        self.sessions.write().map_err(poison_err)?.insert(contact, tx);
        Ok(rx)
    }

    /// Closes the session for `contact`, if any.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the registry lock is poisoned.
    pub fn close(&self, contact: &ContactId) -> Result<()> {
        self.sessions.write().map_err(poison_err)?.remove(contact);
        Ok(())
    }

    /// Returns true if `contact` has a session whose receiver is still alive.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the registry lock is poisoned.
    pub fn has_session(&self, contact: &ContactId) -> Result<bool> {
        Ok(self
            .sessions
            .read()
            .map_err(poison_err)?
            .get(contact)
            .is_some_and(|tx| !tx.is_closed()))
    }

    /// Queues `frame` on the contact's session.
    ///
    /// # Errors
    ///
    /// `NotApplicable` without a session, `Rejected` when the session buffer
    /// is full, `Transport` when the receiver went away or the registry is
    /// poisoned.
    pub fn deliver(
        &self,
        contact: &ContactId,
        frame: PeerLinkFrame,
    ) -> std::result::Result<(), DeliveryError> {
        let sender = self
            .sessions
            .read()
            .map_err(|_| DeliveryError::transport("peer session registry poisoned"))?
            .get(contact)
            .cloned()
            .ok_or_else(|| DeliveryError::not_applicable("no open peer session"))?;

        match sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(DeliveryError::rejected("peer session backlog full"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                if let Err(err) = self.close(contact) {
                    tracing::warn!(error = %err, "failed to prune closed peer session");
                }
                Err(DeliveryError::transport("peer session closed"))
            }
        }
    }
}

/// Channel delivering over [`PeerLinkRegistry`] sessions.
#[derive(Debug, Clone)]
pub struct PeerLinkChannel {
    registry: Arc<PeerLinkRegistry>,
}

impl PeerLinkChannel {
    /// Creates a channel over `registry`.
    #[must_use]
    pub const fn new(registry: Arc<PeerLinkRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl NotificationChannel for PeerLinkChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::PeerLink
    }

    // The frame reached the contact's live session, not just a provider.
    fn success_status(&self) -> DeliveryStatus {
        DeliveryStatus::Delivered
    }

    fn is_applicable(&self, contact: &Contact) -> bool {
        self.registry
            .has_session(&contact.contact_id)
            .unwrap_or_else(|err| {
                tracing::error!(error = %err, "peer session lookup failed");
                false
            })
    }

    async fn send(
        &self,
        contact: &Contact,
        notice: &Notice,
    ) -> std::result::Result<(), DeliveryError> {
        let frame = PeerLinkFrame {
            event_id: notice.event_id(),
            kind: notice.kind(),
            subject: notice.subject().to_string(),
            body: notice.summary(),
        };
        self.registry.deliver(&contact.contact_id, frame)
    }
}
