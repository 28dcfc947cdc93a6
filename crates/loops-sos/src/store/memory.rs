//! In-memory [`SosStore`].
//!
//! ## Limitations
//!
//! - **Single-process only**: state is not shared across process boundaries
//! - **No persistence**: all state is lost when the process exits

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use loops_core::{EventId, UserId};

use super::{AdmissionSnapshot, CommitResult, SosStore};
use crate::error::{Result, SosError};
use crate::event::{EventChange, ResolutionReason, SosEvent};
use crate::limits::AccountLimit;

/// Capacity of the change feed. Slow listeners observe `Lagged` past this.
const CHANGE_FEED_CAPACITY: usize = 1024;

fn poison_err<T>(_: PoisonError<T>) -> SosError {
    SosError::internal("sos store lock poisoned")
}

#[derive(Debug, Default, Clone)]
struct AccountState {
    limit: Option<AccountLimit>,
    lock_expires_at: Option<DateTime<Utc>>,
    version: u64,
}

#[derive(Debug, Default)]
struct StoreState {
    accounts: HashMap<UserId, AccountState>,
    events: BTreeMap<EventId, SosEvent>,
}

/// Thread-safe in-memory store.
///
/// ```rust
/// use loops_sos::store::InMemorySosStore;
///
/// let store = InMemorySosStore::new();
/// # let _ = store;
/// ```
#[derive(Debug)]
pub struct InMemorySosStore {
    state: RwLock<StoreState>,
    changes: broadcast::Sender<EventChange>,
}

impl Default for InMemorySosStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySosStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            state: RwLock::new(StoreState::default()),
            changes,
        }
    }

    /// Inserts an event without touching the account limit.
    ///
    /// Models writers that bypass admission (imports, legacy clients). The
    /// abuse-correction sweep exists to clean up after them.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn import_event(&self, event: SosEvent) -> Result<()> {
        {
            let mut state = self.state.write().map_err(poison_err)?;
            state.events.insert(event.event_id, event.clone());
        }
        self.publish(None, Some(event));
        Ok(())
    }

    /// Returns the number of stored events.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn event_count(&self) -> Result<usize> {
        let count = self.state.read().map_err(poison_err)?.events.len();
        Ok(count)
    }

    fn publish(&self, before: Option<SosEvent>, after: Option<SosEvent>) {
        // No subscribers is fine.
        let _ = self.changes.send(EventChange { before, after });
    }
}

#[async_trait]
impl SosStore for InMemorySosStore {
    async fn load_admission_state(&self, user: &UserId) -> Result<AdmissionSnapshot> {
        let state = self.state.read().map_err(poison_err)?;
        let account = state.accounts.get(user).cloned().unwrap_or_default();
        drop(state);
        Ok(AdmissionSnapshot {
            limit: account.limit,
            lock_expires_at: account.lock_expires_at,
            version: account.version,
        })
    }

    async fn commit_admission(
        &self,
        user: &UserId,
        expected_version: u64,
        limit: AccountLimit,
        event: Option<SosEvent>,
    ) -> Result<CommitResult> {
        {
            let mut state = self.state.write().map_err(poison_err)?;
            let account = state.accounts.entry(user.clone()).or_default();
            if account.version != expected_version {
                let actual = account.version;
                drop(state);
                return Ok(CommitResult::VersionConflict { actual });
            }
            account.limit = Some(limit);
            account.version += 1;
            if let Some(event) = &event {
                state.events.insert(event.event_id, event.clone());
            }
        }
        if let Some(event) = event {
            self.publish(None, Some(event));
        }
        Ok(CommitResult::Committed)
    }

    async fn account_limit(&self, user: &UserId) -> Result<Option<AccountLimit>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.accounts.get(user).and_then(|account| account.limit))
    }

    async fn set_account_lock(
        &self,
        user: &UserId,
        lock_expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let account = state.accounts.entry(user.clone()).or_default();
        account.lock_expires_at = lock_expires_at;
        account.version += 1;
        Ok(())
    }

    async fn get_event(&self, event_id: &EventId) -> Result<Option<SosEvent>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.events.get(event_id).cloned())
    }

    async fn resolve_event(
        &self,
        event_id: &EventId,
        reason: Option<ResolutionReason>,
        at: DateTime<Utc>,
    ) -> Result<SosEvent> {
        let (before, after) = {
            let mut state = self.state.write().map_err(poison_err)?;
            let Some(event) = state.events.get_mut(event_id) else {
                drop(state);
                return Err(SosError::resource_missing("event", event_id));
            };
            let before = event.clone();
            event.resolve(reason, at)?;
            (before, event.clone())
        };
        self.publish(Some(before), Some(after.clone()));
        Ok(after)
    }

    async fn mark_notified(&self, event_id: &EventId, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(event) = state.events.get_mut(event_id) else {
            drop(state);
            return Err(SosError::resource_missing("event", event_id));
        };
        event.notified_at.get_or_insert(at);
        Ok(())
    }

    async fn delete_event(&self, event_id: &EventId) -> Result<Option<SosEvent>> {
        let removed = {
            let mut state = self.state.write().map_err(poison_err)?;
            state.events.remove(event_id)
        };
        if let Some(event) = &removed {
            self.publish(Some(event.clone()), None);
        }
        Ok(removed)
    }

    async fn events_for_user_since(
        &self,
        user: &UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<SosEvent>> {
        let state = self.state.read().map_err(poison_err)?;
        let mut events: Vec<SosEvent> = state
            .events
            .values()
            .filter(|event| &event.user_id == user && event.created_at >= since)
            .cloned()
            .collect();
        drop(state);
        events.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });
        Ok(events)
    }

    async fn active_events(&self) -> Result<Vec<SosEvent>> {
        let state = self.state.read().map_err(poison_err)?;
        let mut events: Vec<SosEvent> = state
            .events
            .values()
            .filter(|event| event.is_active())
            .cloned()
            .collect();
        drop(state);
        events.sort_by_key(|event| (event.created_at, event.event_id));
        Ok(events)
    }

    fn subscribe(&self) -> broadcast::Receiver<EventChange> {
        self.changes.subscribe()
    }
}
