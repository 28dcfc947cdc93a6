//! Reacts to committed event changes.
//!
//! The store publishes every event mutation on a broadcast feed. The
//! listener picks out active-to-resolved transitions and runs the
//! orchestrator's resolution pass for them.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use crate::event::EventChange;
use crate::orchestrator::{DispatchOutcome, NotificationOrchestrator};

/// Background task sending resolution updates.
#[derive(Debug, Clone)]
pub struct ResolutionListener {
    orchestrator: Arc<NotificationOrchestrator>,
}

impl ResolutionListener {
    /// Creates a listener driving `orchestrator`.
    #[must_use]
    pub const fn new(orchestrator: Arc<NotificationOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Handles one change. Returns `None` when the change is not a resolution.
    pub async fn on_change(&self, change: &EventChange) -> Option<DispatchOutcome> {
        let event = change.resolution()?;
        tracing::info!(event_id = %event.event_id, "sos event resolved, sending updates");
        match self.orchestrator.notify_resolution(event).await {
            Ok(outcome) => Some(outcome),
            Err(error) => {
                // Resolution updates are never retried.
                tracing::error!(event_id = %event.event_id, %error, "resolution update failed");
                None
            }
        }
    }

    /// Consumes `changes` until `shutdown` turns true or the feed closes.
    pub async fn run(
        &self,
        mut changes: broadcast::Receiver<EventChange>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!("resolution listener started");
        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                received = changes.recv() => match received {
                    Ok(change) => {
                        self.on_change(&change).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "resolution listener lagged, changes skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        tracing::info!("resolution listener stopped");
    }
}
