//! Storage for account limits, lock flags and SOS events.
//!
//! The only record that needs transaction discipline is the per-user
//! [`AccountLimit`]. Admission is a read-modify-write:
//!
//! 1. [`SosStore::load_admission_state`] returns the limit record, the lock
//!    flag and a per-user version in one snapshot.
//! 2. The caller evaluates the policy.
//! 3. [`SosStore::commit_admission`] writes the new record, and the new event
//!    if admitted, only if the version is unchanged.
//!
//! A [`CommitResult::VersionConflict`] means another writer touched the
//! user's account state in between; the caller re-runs the whole sequence.
//! Users never share a version, so different users never conflict.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use loops_core::{EventId, UserId};

use crate::error::Result;
use crate::event::{EventChange, ResolutionReason, SosEvent};
use crate::limits::AccountLimit;

pub use memory::InMemorySosStore;

/// A consistent read of one user's admission inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionSnapshot {
    /// The limit record, absent for a user who has never triggered.
    pub limit: Option<AccountLimit>,
    /// The account lock flag.
    pub lock_expires_at: Option<DateTime<Utc>>,
    /// Version of the user's account state; zero when nothing was ever written.
    pub version: u64,
}

/// Result of a conditional admission write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitResult {
    /// The write was applied.
    Committed,
    /// The account state changed since the snapshot.
    VersionConflict {
        /// The version found at commit time.
        actual: u64,
    },
}

impl CommitResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}

/// Storage abstraction for the SOS engine.
///
/// Every committed event mutation is published to subscribers as an
/// [`EventChange`], which is how resolution notifications are triggered.
#[async_trait]
pub trait SosStore: Send + Sync {
    /// Reads the limit record, lock flag and version for `user`.
    async fn load_admission_state(&self, user: &UserId) -> Result<AdmissionSnapshot>;

    /// Writes `limit` (and `event`, if any) iff the user's version is still `expected_version`.
    ///
    /// The limit write and event insert are a single atomic step: either both
    /// are visible afterwards or neither is.
    async fn commit_admission(
        &self,
        user: &UserId,
        expected_version: u64,
        limit: AccountLimit,
        event: Option<SosEvent>,
    ) -> Result<CommitResult>;

    /// Reads the current limit record for `user`.
    async fn account_limit(&self, user: &UserId) -> Result<Option<AccountLimit>>;

    /// Sets or clears the account lock flag. Written by external safety tooling.
    async fn set_account_lock(
        &self,
        user: &UserId,
        lock_expires_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Fetches an event by ID.
    async fn get_event(&self, event_id: &EventId) -> Result<Option<SosEvent>>;

    /// Moves an event to `resolved`.
    ///
    /// # Errors
    ///
    /// `ResourceMissing` if the event does not exist, `InvalidArgument` if it
    /// is already resolved.
    async fn resolve_event(
        &self,
        event_id: &EventId,
        reason: Option<ResolutionReason>,
        at: DateTime<Utc>,
    ) -> Result<SosEvent>;

    /// Records that the alert pass for an event has finished.
    ///
    /// Keeps the first timestamp on repeated calls. Not published as a change.
    ///
    /// # Errors
    ///
    /// `ResourceMissing` if the event does not exist.
    async fn mark_notified(&self, event_id: &EventId, at: DateTime<Utc>) -> Result<()>;

    /// Removes an event. Only the abuse-correction path calls this.
    async fn delete_event(&self, event_id: &EventId) -> Result<Option<SosEvent>>;

    /// Events of `user` created at or after `since`, oldest first.
    async fn events_for_user_since(
        &self,
        user: &UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<SosEvent>>;

    /// All events still active, oldest first.
    async fn active_events(&self) -> Result<Vec<SosEvent>>;

    /// Subscribes to committed event changes.
    fn subscribe(&self) -> broadcast::Receiver<EventChange>;
}
