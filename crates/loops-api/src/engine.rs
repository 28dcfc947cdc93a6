//! Wiring of the SOS engine from server configuration.
//!
//! [`Engine`] owns every long-lived engine component the HTTP layer and the
//! background tasks share: store, directory, audit log, dispatch queue,
//! channels, orchestrator and service facade.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::watch;

use loops_core::{CircleId, UserId};
use loops_sos::channels::{
    EmailChannel, EmailTransport, HttpPushGateway, LoggingEmailTransport, NotificationChannel,
    PeerLinkChannel, PeerLinkRegistry, PushChannel, SendGridConfig, SendGridTransport,
};
use loops_sos::prelude::{
    AuditLog, Contact, DispatchQueue, InMemoryAuditLog, InMemoryDirectory, InMemoryDispatchQueue,
    InMemorySosStore, JsonlAuditLog, NotificationOrchestrator, ResolutionListener, SosService,
    SosStore, UserProfile,
};
use loops_sos::{Result, SosError};

use crate::config::Config;

/// How often housekeeping runs.
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

/// Active events younger than this are never republished; their message may
/// still be waiting in the queue.
pub const REPUBLISH_MIN_AGE_SECS: i64 = 300;

/// Profiles, contacts and circle memberships to preload.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectorySeed {
    /// User profiles.
    #[serde(default)]
    pub profiles: Vec<UserProfile>,
    /// Trusted contacts.
    #[serde(default)]
    pub contacts: Vec<Contact>,
    /// Circle memberships.
    #[serde(default)]
    pub circles: Vec<CircleSeed>,
}

/// Members of one circle.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircleSeed {
    /// The circle.
    pub circle_id: CircleId,
    /// Users belonging to it.
    pub members: Vec<UserId>,
}

impl DirectorySeed {
    /// Reads a seed from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid seed.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path).await.map_err(|e| {
            SosError::internal_with_source(format!("failed to read {}", path.display()), e)
        })?;
        serde_json::from_slice(&raw)
            .map_err(|e| SosError::invalid_argument(format!("invalid directory seed: {e}")))
    }

    /// Loads the seed into `directory`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory rejects an entry.
    pub fn apply(self, directory: &InMemoryDirectory) -> Result<()> {
        let profiles = self.profiles.len();
        let contacts = self.contacts.len();
        for profile in self.profiles {
            directory.upsert_profile(profile)?;
        }
        for contact in self.contacts {
            directory.add_contact(contact)?;
        }
        for circle in self.circles {
            for member in circle.members {
                directory.add_circle_member(circle.circle_id.clone(), member)?;
            }
        }
        tracing::info!(profiles, contacts, "directory seeded");
        Ok(())
    }
}

/// What one housekeeping pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    /// Messages whose lease expired and became visible again.
    pub requeued: usize,
    /// Audit entries removed after their retention.
    pub pruned: usize,
    /// Events republished because nothing was ever delivered for them.
    pub republished: usize,
}

/// The wired SOS engine.
#[derive(Clone)]
pub struct Engine {
    /// Events and trigger limits.
    pub store: Arc<InMemorySosStore>,
    /// Profiles, contacts and circles.
    pub directory: Arc<InMemoryDirectory>,
    /// Notification audit log.
    pub audit: Arc<dyn AuditLog>,
    /// Dispatch queue between the service and the workers.
    pub queue: Arc<InMemoryDispatchQueue>,
    /// Live peer-link sessions.
    ///
    /// The session relay that terminates peer signaling calls
    /// [`PeerLinkRegistry::open`] when a contact's session is established and
    /// [`PeerLinkRegistry::close`] when it ends. Until a session is open the
    /// peer-link channel is skipped and the cascade falls through to push
    /// and email.
    pub peer_links: Arc<PeerLinkRegistry>,
    /// Alert and resolution cascades.
    pub orchestrator: Arc<NotificationOrchestrator>,
    /// Trigger, resolve and history entry points.
    pub service: Arc<SosService>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("store", &"<InMemorySosStore>")
            .field("directory", &"<InMemoryDirectory>")
            .field("audit", &"<AuditLog>")
            .field("queue", &"<InMemoryDispatchQueue>")
            .field("orchestrator", &self.orchestrator)
            .field("service", &self.service)
            .finish()
    }
}

impl Engine {
    /// Builds the engine described by `config`.
    ///
    /// Opens the JSON-lines audit log when a path is configured, loads the
    /// directory seed if any, and connects the configured providers.
    ///
    /// # Errors
    ///
    /// Returns an error if the audit log or seed cannot be read or a provider
    /// client cannot be built.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let audit: Arc<dyn AuditLog> = match config.audit.log_path.as_deref() {
            Some(path) => {
                tracing::info!(path = %path.display(), "using JSON-lines audit log");
                Arc::new(JsonlAuditLog::open(path).await?)
            }
            None => {
                tracing::warn!("LOOPS_AUDIT_LOG_PATH not set; audit log is kept in memory");
                Arc::new(InMemoryAuditLog::new())
            }
        };

        // Sessions are registered by the external relay through `peer_links`.
        let peer_links = Arc::new(PeerLinkRegistry::new());
        let channels = provider_channels(config, &peer_links)?;
        let engine = Self::assemble(config, audit, channels, peer_links);

        if let Some(path) = config.directory_seed_path.as_deref() {
            DirectorySeed::load(path).await?.apply(&engine.directory)?;
        }
        Ok(engine)
    }

    /// Builds an engine with in-memory audit log and no external providers.
    ///
    /// Email goes to the logging transport and push is disabled.
    #[must_use]
    pub fn in_memory(config: &Config) -> Self {
        let peer_links = Arc::new(PeerLinkRegistry::new());
        let channels = local_channels(&peer_links);
        Self::assemble(config, Arc::new(InMemoryAuditLog::new()), channels, peer_links)
    }

    /// Builds an in-memory engine around explicit channels.
    #[must_use]
    pub fn with_channels(config: &Config, channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        Self::assemble(
            config,
            Arc::new(InMemoryAuditLog::new()),
            channels,
            Arc::new(PeerLinkRegistry::new()),
        )
    }

    fn assemble(
        config: &Config,
        audit: Arc<dyn AuditLog>,
        channels: Vec<Arc<dyn NotificationChannel>>,
        peer_links: Arc<PeerLinkRegistry>,
    ) -> Self {
        let store = Arc::new(InMemorySosStore::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let queue = Arc::new(InMemoryDispatchQueue::new());

        let orchestrator = Arc::new(NotificationOrchestrator::new(
            store.clone(),
            directory.clone(),
            Arc::clone(&audit),
            channels,
            config.orchestrator(),
        ));
        let service = Arc::new(SosService::new(
            store.clone(),
            directory.clone(),
            Arc::clone(&audit),
            queue.clone(),
            config.sos.policy(),
        ));

        Self {
            store,
            directory,
            audit,
            queue,
            peer_links,
            orchestrator,
            service,
        }
    }

    /// Spawns `workers` dispatch workers, the resolution listener and the
    /// housekeeping loop. All stop when `shutdown` turns true.
    #[must_use]
    pub fn spawn_background(
        &self,
        workers: usize,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::with_capacity(workers + 2);

        for worker in 0..workers.max(1) {
            let orchestrator = Arc::clone(&self.orchestrator);
            let queue: Arc<dyn DispatchQueue> = self.queue.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                orchestrator.run_worker(worker, queue, shutdown).await;
            }));
        }

        let listener = ResolutionListener::new(Arc::clone(&self.orchestrator));
        let changes = self.store.subscribe();
        let listener_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            listener.run(changes, listener_shutdown).await;
        }));

        let engine = self.clone();
        let housekeeping_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            engine
                .run_housekeeping(HOUSEKEEPING_INTERVAL, housekeeping_shutdown)
                .await;
        }));

        handles
    }

    /// Requeues expired leases, prunes expired audit entries and republishes
    /// events that never got a delivery attempt.
    ///
    /// Each step runs even if an earlier one fails.
    pub async fn housekeep(&self, now: DateTime<Utc>) -> HousekeepingReport {
        let mut report = HousekeepingReport::default();

        match self.queue.requeue_expired(now) {
            Ok(requeued) => report.requeued = requeued,
            Err(error) => tracing::error!(%error, "lease requeue failed"),
        }
        match self.audit.prune_expired(now).await {
            Ok(pruned) => report.pruned = pruned,
            Err(error) => tracing::error!(%error, "audit prune failed"),
        }
        match self
            .orchestrator
            .republish_unnotified(
                self.queue.as_ref(),
                now,
                chrono::Duration::seconds(REPUBLISH_MIN_AGE_SECS),
            )
            .await
        {
            Ok(events) => report.republished = events.len(),
            Err(error) => tracing::error!(%error, "republish sweep failed"),
        }

        if report != HousekeepingReport::default() {
            tracing::info!(
                requeued = report.requeued,
                pruned = report.pruned,
                republished = report.republished,
                "housekeeping pass"
            );
        }
        report
    }

    async fn run_housekeeping(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                () = tokio::time::sleep(interval) => {
                    self.housekeep(Utc::now()).await;
                }
            }
        }
    }
}

fn local_channels(peer_links: &Arc<PeerLinkRegistry>) -> Vec<Arc<dyn NotificationChannel>> {
    vec![
        Arc::new(PeerLinkChannel::new(Arc::clone(peer_links))),
        Arc::new(EmailChannel::new(Arc::new(LoggingEmailTransport))),
    ]
}

fn provider_channels(
    config: &Config,
    peer_links: &Arc<PeerLinkRegistry>,
) -> Result<Vec<Arc<dyn NotificationChannel>>> {
    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();

    match config.push.endpoint.as_deref() {
        Some(endpoint) => {
            let gateway = HttpPushGateway::new(endpoint, config.push.bearer_token.clone())?;
            channels.push(Arc::new(PushChannel::new(Arc::new(gateway))));
        }
        None => tracing::warn!("LOOPS_PUSH_ENDPOINT not set; push notifications disabled"),
    }

    channels.push(Arc::new(PeerLinkChannel::new(Arc::clone(peer_links))));

    let transport: Arc<dyn EmailTransport> = match config.email.sendgrid_api_key.as_deref() {
        Some(key) => {
            let mut sendgrid = SendGridConfig::new(key);
            sendgrid.from_email.clone_from(&config.email.from_email);
            sendgrid.app_url.clone_from(&config.email.app_url);
            Arc::new(SendGridTransport::new(sendgrid)?)
        }
        None => {
            if config.debug {
                tracing::info!("LOOPS_SENDGRID_API_KEY not set; emails are logged only");
            } else {
                tracing::warn!("LOOPS_SENDGRID_API_KEY not set; email delivery is disabled");
            }
            Arc::new(LoggingEmailTransport)
        }
    };
    channels.push(Arc::new(EmailChannel::new(transport)));

    Ok(channels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use loops_core::ContactId;
    use loops_sos::channels::{ChannelKind, NotificationKind};
    use loops_sos::prelude::{DeliveryStatus, Directory, PriorityTier, TriggerRequest};

    #[test]
    fn provider_channels_follow_cascade_order() -> Result<()> {
        let mut config = Config::default();
        config.push.endpoint = Some("http://127.0.0.1:9/push".to_string());
        config.email.sendgrid_api_key = Some("SG.test".to_string());

        let kinds: Vec<ChannelKind> = provider_channels(&config, &Arc::new(PeerLinkRegistry::new()))?
            .iter()
            .map(|channel| channel.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![ChannelKind::Push, ChannelKind::PeerLink, ChannelKind::Email]
        );
        Ok(())
    }

    #[test]
    fn push_is_skipped_without_endpoint() -> Result<()> {
        let kinds: Vec<ChannelKind> =
            provider_channels(&Config::default(), &Arc::new(PeerLinkRegistry::new()))?
                .iter()
                .map(|channel| channel.kind())
                .collect();
        assert_eq!(kinds, vec![ChannelKind::PeerLink, ChannelKind::Email]);
        Ok(())
    }

    #[tokio::test]
    async fn seed_file_populates_directory() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| SosError::internal(e.to_string()))?;
        let path = dir.path().join("seed.json");
        let seed = serde_json::json!({
            "profiles": [{"userId": "alice", "displayName": "Alice"}],
            "contacts": [{
                "contactId": "bob",
                "userId": "alice",
                "priorityTier": 1,
                "email": "bob@example.com"
            }],
            "circles": [{"circleId": "family", "members": ["alice"]}]
        });
        tokio::fs::write(&path, seed.to_string())
            .await
            .map_err(|e| SosError::internal(e.to_string()))?;

        let mut config = Config::default();
        config.directory_seed_path = Some(path);
        let engine = Engine::from_config(&config).await?;

        let alice = UserId::new("alice")?;
        assert!(
            engine
                .directory
                .is_circle_member(&alice, &CircleId::new("family")?)
                .await?
        );
        assert_eq!(engine.directory.contacts_for_user(&alice).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn housekeeping_republishes_stranded_events() -> Result<()> {
        let engine = Engine::in_memory(&Config::default());
        let alice = UserId::new("alice")?;
        engine
            .directory
            .upsert_profile(UserProfile::new(alice.clone(), "Alice"))?;
        engine
            .directory
            .add_circle_member(CircleId::new("family")?, alice.clone())?;

        let now = Utc::now();
        engine
            .service
            .trigger(
                Some(&alice),
                TriggerRequest {
                    circle_id: Some("family".to_string()),
                    ..TriggerRequest::default()
                },
                now,
            )
            .await?;
        // Simulate a lost message: take it off the queue without handling it.
        let taken = engine.queue.receive(10, Duration::from_secs(3600)).await?;
        for delivery in &taken {
            engine.queue.ack(&delivery.receipt).await?;
        }
        assert_eq!(engine.queue.depth().await?, 0);

        let early = engine.housekeep(now).await;
        assert_eq!(early.republished, 0);

        let later = engine
            .housekeep(now + chrono::Duration::seconds(REPUBLISH_MIN_AGE_SECS))
            .await;
        assert_eq!(later.republished, 1);
        assert_eq!(engine.queue.depth().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn relay_session_takes_the_alert_before_email() -> Result<()> {
        let engine = Engine::in_memory(&Config::default());
        let alice = UserId::new("alice")?;
        let bob = ContactId::new("bob")?;
        engine
            .directory
            .upsert_profile(UserProfile::new(alice.clone(), "Alice"))?;
        engine
            .directory
            .add_circle_member(CircleId::new("family")?, alice.clone())?;
        engine.directory.add_contact(
            Contact::new(bob.clone(), alice.clone(), PriorityTier::Primary)
                .with_email("bob@example.com"),
        )?;

        let mut session = engine.peer_links.open(bob.clone())?;

        let now = Utc::now();
        let response = engine
            .service
            .trigger(
                Some(&alice),
                TriggerRequest {
                    circle_id: Some("family".to_string()),
                    ..TriggerRequest::default()
                },
                now,
            )
            .await?;
        assert_eq!(engine.orchestrator.drain(engine.queue.as_ref()).await?, 1);

        let frame = session
            .try_recv()
            .map_err(|e| SosError::internal(e.to_string()))?;
        assert_eq!(frame.event_id, response.event_id);
        assert_eq!(frame.kind, NotificationKind::Alert);

        let entries = engine
            .audit
            .entries_for_event(&response.event_id, Utc::now())
            .await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].channel, ChannelKind::PeerLink);
        assert_eq!(entries[0].status, DeliveryStatus::Delivered);

        engine.peer_links.close(&bob)?;
        Ok(())
    }
}
