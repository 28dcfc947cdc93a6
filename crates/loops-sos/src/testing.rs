//! Test doubles and fixtures.
//!
//! Available with the `test-utils` feature.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use loops_core::{CircleId, ContactId, EventId, UserId};

use crate::audit::{DeliveryStatus, InMemoryAuditLog};
use crate::channels::{ChannelKind, EmailMessage, EmailTransport, NotificationChannel, Notice, NotificationKind};
use crate::contact::{Contact, PriorityTier, UserProfile};
use crate::directory::InMemoryDirectory;
use crate::dispatch::{Delivery, DispatchMessage, DispatchQueue, InMemoryDispatchQueue, MessageId, ReceiptHandle};
use crate::error::{DeliveryError, Result, SosError};
use crate::limits::AdmissionPolicy;
use crate::orchestrator::{NotificationOrchestrator, OrchestratorConfig};
use crate::service::SosService;
use crate::store::InMemorySosStore;

/// What a scripted channel does for a contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    /// Succeed immediately.
    Succeed,
    /// Fail with the given error.
    Fail(DeliveryError),
    /// Succeed once the delay has passed.
    SucceedAfter(Duration),
    /// Never complete; the orchestrator's timeout must cut it off.
    Hang,
}

/// A channel whose behaviour is scripted per contact.
#[derive(Debug)]
pub struct ScriptedChannel {
    kind: ChannelKind,
    success_status: DeliveryStatus,
    default: Script,
    scripts: HashMap<ContactId, Script>,
    applicable_to: Option<HashSet<ContactId>>,
    calls: Mutex<Vec<(ContactId, NotificationKind)>>,
}

impl ScriptedChannel {
    /// A channel that succeeds for every contact.
    #[must_use]
    pub fn succeeding(kind: ChannelKind) -> Self {
        Self {
            kind,
            success_status: DeliveryStatus::Sent,
            default: Script::Succeed,
            scripts: HashMap::new(),
            applicable_to: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A channel that fails for every contact.
    #[must_use]
    pub fn failing(kind: ChannelKind, message: &str) -> Self {
        Self {
            default: Script::Fail(DeliveryError::transport(message)),
            ..Self::succeeding(kind)
        }
    }

    /// Overrides the behaviour for one contact.
    #[must_use]
    pub fn with_script(mut self, contact: &ContactId, script: Script) -> Self {
        self.scripts.insert(contact.clone(), script);
        self
    }

    /// Limits applicability to the given contacts.
    #[must_use]
    pub fn only_for<'a>(mut self, contacts: impl IntoIterator<Item = &'a ContactId>) -> Self {
        self.applicable_to = Some(contacts.into_iter().cloned().collect());
        self
    }

    /// Reports `status` on success.
    #[must_use]
    pub const fn with_success_status(mut self, status: DeliveryStatus) -> Self {
        self.success_status = status;
        self
    }

    /// Every `send` call so far.
    #[must_use]
    pub fn calls(&self) -> Vec<(ContactId, NotificationKind)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl NotificationChannel for ScriptedChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn success_status(&self) -> DeliveryStatus {
        self.success_status
    }

    fn is_applicable(&self, contact: &Contact) -> bool {
        self.applicable_to
            .as_ref()
            .is_none_or(|set| set.contains(&contact.contact_id))
    }

    async fn send(&self, contact: &Contact, notice: &Notice) -> std::result::Result<(), DeliveryError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((contact.contact_id.clone(), notice.kind()));
        let script = self
            .scripts
            .get(&contact.contact_id)
            .unwrap_or(&self.default)
            .clone();
        match script {
            Script::Succeed => Ok(()),
            Script::Fail(error) => Err(error),
            Script::SucceedAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Script::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

/// Email transport that records every message.
#[derive(Debug, Default)]
pub struct RecordingEmailTransport {
    sent: Mutex<Vec<EmailMessage>>,
}

impl RecordingEmailTransport {
    /// Messages sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl EmailTransport for RecordingEmailTransport {
    async fn send(&self, message: &EmailMessage) -> std::result::Result<(), DeliveryError> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        Ok(())
    }
}

/// Queue wrapper whose first `failures` publishes fail.
#[derive(Debug)]
pub struct FlakyQueue {
    inner: InMemoryDispatchQueue,
    remaining_failures: AtomicUsize,
}

impl FlakyQueue {
    /// Wraps a fresh in-memory queue.
    #[must_use]
    pub fn failing_first(failures: usize) -> Self {
        Self {
            inner: InMemoryDispatchQueue::new(),
            remaining_failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl DispatchQueue for FlakyQueue {
    async fn publish(&self, message: DispatchMessage) -> Result<MessageId> {
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SosError::internal("broker unavailable"));
        }
        self.inner.publish(message).await
    }

    async fn receive(&self, max: usize, lease: Duration) -> Result<Vec<Delivery>> {
        self.inner.receive(max, lease).await
    }

    async fn ack(&self, receipt: &ReceiptHandle) -> Result<bool> {
        self.inner.ack(receipt).await
    }

    async fn nack(&self, receipt: &ReceiptHandle) -> Result<bool> {
        self.inner.nack(receipt).await
    }

    async fn extend_lease(&self, receipt: &ReceiptHandle, lease: Duration) -> Result<bool> {
        self.inner.extend_lease(receipt, lease).await
    }

    async fn has_pending(&self, event_id: &EventId) -> Result<bool> {
        self.inner.has_pending(event_id).await
    }

    async fn depth(&self) -> Result<usize> {
        self.inner.depth().await
    }
}

/// Fully wired in-memory engine.
pub struct Fixture {
    /// Event and limit store.
    pub store: Arc<InMemorySosStore>,
    /// Profiles, contacts, circles.
    pub directory: Arc<InMemoryDirectory>,
    /// Audit log.
    pub audit: Arc<InMemoryAuditLog>,
    /// Dispatch queue.
    pub queue: Arc<dyn DispatchQueue>,
    /// Orchestrator.
    pub orchestrator: Arc<NotificationOrchestrator>,
    /// Service facade.
    pub service: SosService,
}

impl std::fmt::Debug for Fixture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fixture")
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

impl Fixture {
    /// Wires the engine with `channels` and default policies.
    #[must_use]
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        Self::with_queue(channels, Arc::new(InMemoryDispatchQueue::new()), OrchestratorConfig::default())
    }

    /// Wires the engine with a custom queue and orchestrator config.
    #[must_use]
    pub fn with_queue(
        channels: Vec<Arc<dyn NotificationChannel>>,
        queue: Arc<dyn DispatchQueue>,
        config: OrchestratorConfig,
    ) -> Self {
        let store = Arc::new(InMemorySosStore::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let audit = Arc::new(InMemoryAuditLog::new());
        let orchestrator = Arc::new(NotificationOrchestrator::new(
            store.clone(),
            directory.clone(),
            audit.clone(),
            channels,
            config,
        ));
        let service = SosService::new(
            store.clone(),
            directory.clone(),
            audit.clone(),
            Arc::clone(&queue),
            AdmissionPolicy::default(),
        );
        Self {
            store,
            directory,
            audit,
            queue,
            orchestrator,
            service,
        }
    }

    /// Registers `user` with a profile named `name`, membership in `circle`,
    /// and one contact per `(id, email, push_token)`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid identifiers.
    pub fn seed_user(
        &self,
        user: &str,
        name: &str,
        circle: &str,
        contacts: &[(&str, Option<&str>, Option<&str>)],
    ) -> Result<UserId> {
        let user_id = UserId::new(user)?;
        self.directory
            .upsert_profile(UserProfile::new(user_id.clone(), name))?;
        self.directory
            .add_circle_member(CircleId::new(circle)?, user_id.clone())?;
        for (id, email, push) in contacts {
            let mut contact =
                Contact::new(ContactId::new(*id)?, user_id.clone(), PriorityTier::Primary);
            contact.email = email.map(str::to_string);
            contact.push_token = push.map(str::to_string);
            self.directory.add_contact(contact)?;
        }
        Ok(user_id)
    }
}
