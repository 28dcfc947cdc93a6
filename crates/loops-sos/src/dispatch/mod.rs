//! Dispatch queue between event creation and notification fan-out.
//!
//! This module provides:
//!
//! - [`DispatchMessage`]: the wire payload, carrying only the event ID
//! - [`DispatchQueue`]: at-least-once queue with leased delivery
//! - [`InMemoryDispatchQueue`]: single-process implementation
//!
//! Consumers must re-fetch the event by ID; a message may be delivered more
//! than once and may outlive its event.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use loops_core::EventId;

use crate::error::Result;

pub use memory::InMemoryDispatchQueue;

/// Payload of a dispatch message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DispatchMessage {
    /// The event to notify contacts about.
    pub event_id: EventId,
}

impl DispatchMessage {
    /// Creates a message for `event_id`.
    #[must_use]
    pub const fn new(event_id: EventId) -> Self {
        Self { event_id }
    }
}

/// Queue-assigned identifier of a published message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle for acknowledging one delivery of a message.
///
/// Each redelivery gets a fresh handle; a handle from an expired lease is stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(pub String);

/// A leased message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Message identifier, stable across redeliveries.
    pub message_id: MessageId,
    /// Handle for `ack`/`nack`.
    pub receipt: ReceiptHandle,
    /// The payload.
    pub message: DispatchMessage,
    /// Delivery count, starting at 1.
    pub attempt: u32,
}

/// At-least-once dispatch queue.
///
/// ## Delivery semantics
///
/// A received message is invisible to other consumers until its lease
/// expires, it is `nack`ed (visible immediately) or it is `ack`ed (removed).
/// Consumers that work longer than one lease renew it with `extend_lease`.
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    /// Publishes a message.
    async fn publish(&self, message: DispatchMessage) -> Result<MessageId>;

    /// Leases up to `max` visible messages for `lease`.
    async fn receive(&self, max: usize, lease: Duration) -> Result<Vec<Delivery>>;

    /// Removes a delivered message. Returns false for a stale handle.
    async fn ack(&self, receipt: &ReceiptHandle) -> Result<bool>;

    /// Makes a delivered message visible again. Returns false for a stale handle.
    async fn nack(&self, receipt: &ReceiptHandle) -> Result<bool>;

    /// Pushes the lease of a delivery out to `lease` from now.
    ///
    /// Returns false for a stale handle: the message may already be with
    /// another consumer.
    async fn extend_lease(&self, receipt: &ReceiptHandle, lease: Duration) -> Result<bool>;

    /// Returns true if a message for `event_id` is visible or leased.
    async fn has_pending(&self, event_id: &EventId) -> Result<bool>;

    /// Number of messages currently visible.
    async fn depth(&self) -> Result<usize>;
}
