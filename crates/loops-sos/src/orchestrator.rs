//! Notification cascade.
//!
//! The orchestrator consumes [`DispatchMessage`]s and, for every contact of
//! the triggering user, tries channels in cascade order until one succeeds.
//! Every attempted channel produces exactly one audit entry.
//!
//! ## Resource bounds
//!
//! - Each contact of an event runs as its own task.
//! - A semaphore shared by every event and worker bounds simultaneous channel
//!   attempts globally to [`OrchestratorConfig::max_concurrent_attempts`].
//! - Each attempt is cut off after [`OrchestratorConfig::attempt_timeout`]
//!   and recorded as failed.
//!
//! Channel failures never escape [`NotificationOrchestrator::handle`]; only
//! store, directory or audit failures do, and those leave the message
//! unacknowledged for redelivery.
//!
//! ## Redelivery
//!
//! Workers lease one message at a time and renew the lease while handling
//! it. A message can still arrive twice (a crashed worker, a lost lease), so
//! the alert pass skips contacts that already have a successful alert entry
//! and marks the event notified once the pass finishes.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, Span};

use loops_core::observability::dispatch_span;
use loops_core::ContactId;

use crate::audit::{AuditLog, DEFAULT_RETENTION_DAYS, DeliveryStatus, NotificationLogEntry};
use crate::channels::{
    AlertNotice, ChannelKind, NotificationChannel, NotificationKind, Notice, ResolutionNotice,
};
use crate::contact::Contact;
use crate::directory::Directory;
use crate::dispatch::{Delivery, DispatchMessage, DispatchQueue, ReceiptHandle};
use crate::error::{DeliveryError, Result, SosError};
use crate::event::SosEvent;
use crate::metrics::SosMetrics;
use crate::store::SosStore;

/// Default bound on simultaneous channel attempts.
pub const DEFAULT_MAX_CONCURRENT_ATTEMPTS: usize = 16;

/// Default per-attempt timeout.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of queue workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Default dispatch lease.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// Shortest interval between lease renewals.
const MIN_LEASE_RENEWAL: Duration = Duration::from_millis(10);

/// Orchestrator tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Global bound on simultaneous channel attempts.
    pub max_concurrent_attempts: usize,
    /// Per-attempt timeout.
    pub attempt_timeout: Duration,
    /// Number of queue workers to run.
    pub workers: usize,
    /// Lease taken on each received message, renewed while it is handled.
    pub lease: Duration,
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
    /// Audit entry retention.
    pub retention: chrono::Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_attempts: DEFAULT_MAX_CONCURRENT_ATTEMPTS,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            workers: DEFAULT_WORKERS,
            lease: DEFAULT_LEASE,
            poll_interval: Duration::from_millis(200),
            retention: chrono::Duration::days(DEFAULT_RETENTION_DAYS),
        }
    }
}

/// What happened to one contact in a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactOutcome {
    /// The contact.
    pub contact_id: ContactId,
    /// Entries recorded for this contact, in attempt order.
    pub attempts: Vec<NotificationLogEntry>,
    /// The channel that succeeded, if any.
    pub reached_via: Option<ChannelKind>,
}

/// How a dispatch message (or resolution pass) was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every contact was attempted.
    Completed {
        /// Per-contact results.
        contacts: Vec<ContactOutcome>,
    },
    /// The event no longer exists. Nothing was sent.
    EventMissing,
    /// The triggering user has no profile. Nothing was sent.
    ProfileMissing,
    /// The triggering user has no contacts. Nothing was sent.
    NoContacts,
    /// A redelivery found every contact already reached. Nothing was sent.
    AlreadyNotified,
}

impl DispatchOutcome {
    /// Stable label for metrics.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::EventMissing => "event_missing",
            Self::ProfileMissing => "profile_missing",
            Self::NoContacts => "no_contacts",
            Self::AlreadyNotified => "already_notified",
        }
    }

    /// Number of contacts reached on some channel.
    #[must_use]
    pub fn reached(&self) -> usize {
        match self {
            Self::Completed { contacts } => contacts
                .iter()
                .filter(|outcome| outcome.reached_via.is_some())
                .count(),
            _ => 0,
        }
    }
}

/// Machinery for one contact's attempts, shared by every contact task.
#[derive(Clone)]
struct Attempts {
    audit: Arc<dyn AuditLog>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    retention: chrono::Duration,
    metrics: SosMetrics,
}

impl Attempts {
    async fn cascade(
        &self,
        contact: &Contact,
        notice: &Notice,
        channels: &[Arc<dyn NotificationChannel>],
    ) -> ContactOutcome {
        let mut outcome = ContactOutcome {
            contact_id: contact.contact_id.clone(),
            attempts: Vec::new(),
            reached_via: None,
        };

        for channel in channels {
            if !channel.is_applicable(contact) {
                continue;
            }
            let kind = channel.kind();
            let Some(result) = self.attempt(channel.as_ref(), contact, notice).await else {
                continue;
            };
            let status = match &result {
                Ok(()) => channel.success_status(),
                Err(_) => DeliveryStatus::Failed,
            };

            let mut entry = NotificationLogEntry::new(
                notice.event_id(),
                contact.contact_id.clone(),
                kind,
                notice.kind(),
                status,
                Utc::now(),
                self.retention,
            );
            if let Err(error) = &result {
                tracing::warn!(
                    contact_id = %contact.contact_id,
                    channel = %kind,
                    %error,
                    "notification attempt failed"
                );
                entry = entry.with_error(error.to_string());
            } else {
                tracing::info!(
                    contact_id = %contact.contact_id,
                    channel = %kind,
                    status = status.as_str(),
                    "notification delivered"
                );
            }
            self.record(entry.clone()).await;
            outcome.attempts.push(entry);

            if status.is_success() {
                outcome.reached_via = Some(kind);
                break;
            }
        }

        if outcome.reached_via.is_none() && notice.kind() == NotificationKind::Alert {
            tracing::error!(
                contact_id = %contact.contact_id,
                attempts = outcome.attempts.len(),
                "contact could not be reached on any channel"
            );
        }
        outcome
    }

    /// One bounded, timed channel attempt. `None` means the channel turned out
    /// not to apply and nothing was attempted.
    async fn attempt(
        &self,
        channel: &dyn NotificationChannel,
        contact: &Contact,
        notice: &Notice,
    ) -> Option<std::result::Result<(), DeliveryError>> {
        let Ok(_permit) = self.permits.acquire().await else {
            return Some(Err(DeliveryError::transport("attempt limiter closed")));
        };
        let started = Instant::now();
        let result = tokio::time::timeout(self.timeout, channel.send(contact, notice))
            .await
            .unwrap_or(Err(DeliveryError::TimedOut {
                after: self.timeout,
            }));

        if matches!(result, Err(DeliveryError::NotApplicable { .. })) {
            return None;
        }
        let status = match &result {
            Ok(()) => channel.success_status(),
            Err(_) => DeliveryStatus::Failed,
        };
        self.metrics.record_attempt(
            channel.kind().as_str(),
            notice.kind().as_str(),
            status.as_str(),
            started.elapsed(),
        );
        Some(result)
    }

    async fn record(&self, entry: NotificationLogEntry) {
        let event_id = entry.event_id;
        if let Err(error) = self.audit.append(entry).await {
            tracing::error!(%event_id, %error, "failed to record notification attempt");
        }
    }
}

type Channels = Arc<[Arc<dyn NotificationChannel>]>;

/// Runs notification passes for SOS events.
pub struct NotificationOrchestrator {
    store: Arc<dyn SosStore>,
    directory: Arc<dyn Directory>,
    audit: Arc<dyn AuditLog>,
    channels: Channels,
    attempts: Attempts,
    config: OrchestratorConfig,
    metrics: SosMetrics,
}

impl std::fmt::Debug for NotificationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels: Vec<ChannelKind> = self.channels.iter().map(|c| c.kind()).collect();
        f.debug_struct("NotificationOrchestrator")
            .field("channels", &channels)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl NotificationOrchestrator {
    /// Creates an orchestrator.
    ///
    /// `channels` may be given in any order; they are tried in
    /// [`ChannelKind::CASCADE_ORDER`].
    #[must_use]
    pub fn new(
        store: Arc<dyn SosStore>,
        directory: Arc<dyn Directory>,
        audit: Arc<dyn AuditLog>,
        mut channels: Vec<Arc<dyn NotificationChannel>>,
        config: OrchestratorConfig,
    ) -> Self {
        channels.sort_by_key(|channel| channel.kind());
        let metrics = SosMetrics::new();
        let attempts = Attempts {
            audit: Arc::clone(&audit),
            permits: Arc::new(Semaphore::new(config.max_concurrent_attempts.max(1))),
            timeout: config.attempt_timeout,
            retention: config.retention,
            metrics,
        };
        Self {
            store,
            directory,
            audit,
            channels: channels.into(),
            attempts,
            config,
            metrics,
        }
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Runs the alert cascade for one dispatch message.
    ///
    /// Contacts already reached for this event are skipped, so a redelivered
    /// message only retries the contacts that were not reached.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store, directory or audit log fails; the
    /// message should then be redelivered.
    pub async fn handle(&self, message: DispatchMessage) -> Result<DispatchOutcome> {
        let event_id = message.event_id.to_string();
        let outcome = self
            .handle_alert(message)
            .instrument(dispatch_span("alert", &event_id))
            .await;
        if let Ok(outcome) = &outcome {
            self.metrics.record_dispatch(outcome.as_label());
        }
        outcome
    }

    async fn handle_alert(&self, message: DispatchMessage) -> Result<DispatchOutcome> {
        let Some(event) = self.store.get_event(&message.event_id).await? else {
            tracing::error!("sos event not found, dropping dispatch message");
            return Ok(DispatchOutcome::EventMissing);
        };

        let Some(profile) = self.directory.profile(&event.user_id).await? else {
            tracing::error!(user_id = %event.user_id, "user profile not found, dropping dispatch message");
            return self.finish(&event, DispatchOutcome::ProfileMissing).await;
        };

        let contacts = self.directory.contacts_for_user(&event.user_id).await?;
        if contacts.is_empty() {
            tracing::warn!(user_id = %event.user_id, "no emergency contacts");
            return self.finish(&event, DispatchOutcome::NoContacts).await;
        }

        let reached = self
            .audit
            .reached_contacts(&event.event_id, NotificationKind::Alert, Utc::now())
            .await?;
        let pending: Vec<Contact> = contacts
            .into_iter()
            .filter(|contact| !reached.contains(&contact.contact_id))
            .collect();
        if pending.is_empty() {
            tracing::info!("every contact already reached, skipping redelivery");
            return self.finish(&event, DispatchOutcome::AlreadyNotified).await;
        }
        if !reached.is_empty() {
            tracing::info!(
                skipped = reached.len(),
                remaining = pending.len(),
                "redelivery, retrying contacts not yet reached"
            );
        }

        let notice = Notice::Alert(AlertNotice::new(&event, &profile.display_name));
        let outcomes = self
            .fan_out(pending, notice, Arc::clone(&self.channels))
            .await;
        tracing::info!(
            contacts = outcomes.len(),
            reached = outcomes.iter().filter(|o| o.reached_via.is_some()).count(),
            "alert cascade finished"
        );
        self.finish(&event, DispatchOutcome::Completed { contacts: outcomes })
            .await
    }

    /// Marks the alert pass of `event` as finished.
    async fn finish(&self, event: &SosEvent, outcome: DispatchOutcome) -> Result<DispatchOutcome> {
        match self.store.mark_notified(&event.event_id, Utc::now()).await {
            // Removed by abuse correction in the meantime.
            Ok(()) | Err(SosError::ResourceMissing { .. }) => Ok(outcome),
            Err(error) => Err(error),
        }
    }

    /// Sends the resolution update for a resolved event.
    ///
    /// Lower urgency than the alert: email only, one attempt per contact,
    /// failures recorded and never retried.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory fails.
    pub async fn notify_resolution(&self, event: &SosEvent) -> Result<DispatchOutcome> {
        let event_id = event.event_id.to_string();
        let outcome = self
            .resolution_pass(event)
            .instrument(dispatch_span("resolution", &event_id))
            .await;
        if let Ok(outcome) = &outcome {
            self.metrics.record_dispatch(outcome.as_label());
        }
        outcome
    }

    async fn resolution_pass(&self, event: &SosEvent) -> Result<DispatchOutcome> {
        let Some(profile) = self.directory.profile(&event.user_id).await? else {
            tracing::error!(user_id = %event.user_id, "user profile not found, skipping resolution update");
            return Ok(DispatchOutcome::ProfileMissing);
        };
        let contacts = self.directory.contacts_for_user(&event.user_id).await?;
        if contacts.is_empty() {
            tracing::info!(user_id = %event.user_id, "no contacts to update");
            return Ok(DispatchOutcome::NoContacts);
        }

        let email_only: Channels = self
            .channels
            .iter()
            .filter(|channel| channel.kind() == ChannelKind::Email)
            .cloned()
            .collect();
        let notice = Notice::Resolution(ResolutionNotice::new(event, &profile.display_name));
        let outcomes = self.fan_out(contacts, notice, email_only).await;
        Ok(DispatchOutcome::Completed { contacts: outcomes })
    }

    /// Runs one cascade task per contact and collects the outcomes in contact order.
    async fn fan_out(
        &self,
        contacts: Vec<Contact>,
        notice: Notice,
        channels: Channels,
    ) -> Vec<ContactOutcome> {
        let notice = Arc::new(notice);
        let mut tasks = JoinSet::new();
        for (index, contact) in contacts.into_iter().enumerate() {
            let attempts = self.attempts.clone();
            let notice = Arc::clone(&notice);
            let channels = Arc::clone(&channels);
            tasks.spawn(
                async move { (index, attempts.cascade(&contact, &notice, &channels).await) }
                    .instrument(Span::current()),
            );
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(error) => tracing::error!(%error, "contact cascade task failed"),
            }
        }
        outcomes.sort_by_key(|(index, _)| *index);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }

    /// Handles one leased delivery: ack on success, nack on failure.
    ///
    /// The lease is renewed every half lease while the message is handled.
    pub async fn process_delivery(&self, queue: &dyn DispatchQueue, delivery: Delivery) {
        let receipt = delivery.receipt.clone();
        let handled = self
            .renewing_lease(queue, &receipt, self.handle(delivery.message))
            .await;
        match handled {
            Ok(_) => match queue.ack(&receipt).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(message_id = %delivery.message_id, "dispatch lease lost before ack");
                }
                Err(error) => {
                    tracing::error!(message_id = %delivery.message_id, %error, "failed to ack dispatch message");
                }
            },
            Err(error) => {
                tracing::error!(
                    message_id = %delivery.message_id,
                    attempt = delivery.attempt,
                    %error,
                    "dispatch handling failed, releasing for redelivery"
                );
                self.metrics.record_dispatch("error");
                if let Err(error) = queue.nack(&receipt).await {
                    tracing::error!(message_id = %delivery.message_id, %error, "failed to nack dispatch message");
                }
            }
        }
    }

    async fn renewing_lease<F>(
        &self,
        queue: &dyn DispatchQueue,
        receipt: &ReceiptHandle,
        handling: F,
    ) -> Result<DispatchOutcome>
    where
        F: Future<Output = Result<DispatchOutcome>>,
    {
        let lease = self.config.lease;
        let mut renew = tokio::time::interval((lease / 2).max(MIN_LEASE_RENEWAL));
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        renew.tick().await;
        tokio::pin!(handling);
        loop {
            tokio::select! {
                handled = &mut handling => return handled,
                _ = renew.tick() => match queue.extend_lease(receipt, lease).await {
                    Ok(true) => tracing::debug!("dispatch lease renewed"),
                    Ok(false) => tracing::warn!("dispatch lease lost while handling"),
                    Err(error) => tracing::error!(%error, "dispatch lease renewal failed"),
                },
            }
        }
    }

    /// Processes visible messages one lease at a time until the queue is empty.
    ///
    /// Returns the number of deliveries processed.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue fails.
    pub async fn drain(&self, queue: &dyn DispatchQueue) -> Result<usize> {
        let mut processed = 0;
        loop {
            let deliveries = queue.receive(1, self.config.lease).await?;
            if deliveries.is_empty() {
                return Ok(processed);
            }
            for delivery in deliveries {
                self.process_delivery(queue, delivery).await;
                processed += 1;
            }
        }
    }

    /// Worker loop: leases and processes one message at a time until
    /// `shutdown` turns true.
    pub async fn run_worker(
        &self,
        worker: usize,
        queue: Arc<dyn DispatchQueue>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!(worker, "dispatch worker started");
        while !*shutdown.borrow() {
            let deliveries = match queue.receive(1, self.config.lease).await {
                Ok(deliveries) => deliveries,
                Err(error) => {
                    tracing::error!(worker, %error, "dispatch receive failed");
                    Vec::new()
                }
            };

            if deliveries.is_empty() {
                if let Ok(depth) = queue.depth().await {
                    self.metrics.set_queue_depth(depth);
                }
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    () = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            for delivery in deliveries {
                self.process_delivery(queue.as_ref(), delivery).await;
            }
        }
        tracing::info!(worker, "dispatch worker stopped");
    }

    /// Republishes active events created at or before `now - min_age` whose
    /// alert pass never finished and that have no message in the queue.
    ///
    /// Covers dispatch publishes that failed after the event was committed.
    /// Returns the events republished.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or queue fails.
    pub async fn republish_unnotified(
        &self,
        queue: &dyn DispatchQueue,
        now: DateTime<Utc>,
        min_age: chrono::Duration,
    ) -> Result<Vec<SosEvent>> {
        let cutoff = now - min_age;
        let mut republished = Vec::new();
        for event in self.store.active_events().await? {
            if event.created_at > cutoff || event.notified_at.is_some() {
                continue;
            }
            if queue.has_pending(&event.event_id).await? {
                continue;
            }
            queue
                .publish(DispatchMessage::new(event.event_id))
                .await
                .map_err(|e| SosError::TransientDeliveryFailure {
                    message: format!("republish of {} failed: {e}", event.event_id),
                })?;
            tracing::info!(event_id = %event.event_id, "republished unnotified event");
            republished.push(event);
        }
        Ok(republished)
    }
}
