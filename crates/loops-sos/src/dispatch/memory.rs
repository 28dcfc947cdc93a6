//! In-memory [`DispatchQueue`] with leases.
//!
//! Messages are kept in their JSON wire form so the payload contract is the
//! same as for an external broker.
//!
//! ## Limitations
//!
//! - **Single-process only**: messages are lost when the process exits

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ulid::Ulid;

use loops_core::EventId;

use super::{Delivery, DispatchMessage, DispatchQueue, MessageId, ReceiptHandle};
use crate::error::{Result, SosError};

fn poison_err<T>(_: PoisonError<T>) -> SosError {
    SosError::internal("dispatch queue lock poisoned")
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: MessageId,
    event_id: EventId,
    payload: Vec<u8>,
    deliveries: u32,
}

#[derive(Debug)]
struct Lease {
    stored: StoredMessage,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    visible: VecDeque<StoredMessage>,
    leased: HashMap<ReceiptHandle, Lease>,
}

/// In-memory leased queue.
#[derive(Debug, Default)]
pub struct InMemoryDispatchQueue {
    state: RwLock<QueueState>,
}

impl InMemoryDispatchQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns leased messages whose lease ended at or before `now` to the queue.
    ///
    /// Returns the number of messages made visible again.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn requeue_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.write().map_err(poison_err)?;
        let expired: Vec<ReceiptHandle> = state
            .leased
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in &expired {
            if let Some(lease) = state.leased.remove(receipt) {
                state.visible.push_front(lease.stored);
            }
        }
        drop(state);
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "dispatch leases expired");
        }
        Ok(expired.len())
    }

    /// Number of messages currently leased.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn in_flight(&self) -> Result<usize> {
        Ok(self.state.read().map_err(poison_err)?.leased.len())
    }
}

#[async_trait]
impl DispatchQueue for InMemoryDispatchQueue {
    async fn publish(&self, message: DispatchMessage) -> Result<MessageId> {
        let payload = serde_json::to_vec(&message)
            .map_err(|e| SosError::internal_with_source("failed to encode dispatch message", e))?;
        let message_id = MessageId(Ulid::new().to_string());
        let mut state = self.state.write().map_err(poison_err)?;
        state.visible.push_back(StoredMessage {
            message_id: message_id.clone(),
            event_id: message.event_id,
            payload,
            deliveries: 0,
        });
        drop(state);
        Ok(message_id)
    }

    async fn receive(&self, max: usize, lease: Duration) -> Result<Vec<Delivery>> {
        let now = Utc::now();
        self.requeue_expired(now)?;

        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| SosError::internal_with_source("lease duration out of range", e))?;
        let mut state = self.state.write().map_err(poison_err)?;
        let mut deliveries = Vec::new();
        while deliveries.len() < max {
            let Some(mut stored) = state.visible.pop_front() else {
                break;
            };
            let message: DispatchMessage = match serde_json::from_slice(&stored.payload) {
                Ok(message) => message,
                Err(error) => {
                    // Undecodable payloads can never succeed; drop them.
                    tracing::error!(message_id = %stored.message_id, %error, "discarding malformed dispatch message");
                    continue;
                }
            };
            stored.deliveries += 1;
            let receipt = ReceiptHandle(Ulid::new().to_string());
            deliveries.push(Delivery {
                message_id: stored.message_id.clone(),
                receipt: receipt.clone(),
                message,
                attempt: stored.deliveries,
            });
            state.leased.insert(
                receipt,
                Lease {
                    stored,
                    expires_at: now + lease,
                },
            );
        }
        drop(state);
        Ok(deliveries)
    }

    async fn ack(&self, receipt: &ReceiptHandle) -> Result<bool> {
        let mut state = self.state.write().map_err(poison_err)?;
        Ok(state.leased.remove(receipt).is_some())
    }

    async fn nack(&self, receipt: &ReceiptHandle) -> Result<bool> {
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(lease) = state.leased.remove(receipt) else {
            return Ok(false);
        };
        state.visible.push_back(lease.stored);
        Ok(true)
    }

    async fn extend_lease(&self, receipt: &ReceiptHandle, lease: Duration) -> Result<bool> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| SosError::internal_with_source("lease duration out of range", e))?;
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(leased) = state.leased.get_mut(receipt) else {
            return Ok(false);
        };
        leased.expires_at = Utc::now() + lease;
        Ok(true)
    }

    async fn has_pending(&self, event_id: &EventId) -> Result<bool> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .visible
            .iter()
            .chain(state.leased.values().map(|lease| &lease.stored))
            .any(|stored| &stored.event_id == event_id))
    }

    async fn depth(&self) -> Result<usize> {
        Ok(self.state.read().map_err(poison_err)?.visible.len())
    }
}
