//! Transactional admission of SOS triggers.
//!
//! [`AdmissionController::admit`] runs [`AdmissionPolicy::evaluate`] against a
//! versioned snapshot and commits the result conditionally, re-running on
//! conflict. Concurrent admits for one user therefore serialize: each
//! committed write is based on the record left by the previous one.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use loops_core::{CircleId, EventId, UserId};

use crate::error::{Result, SosError};
use crate::event::{Location, SosEvent, TriggerMethod};
use crate::limits::{AccountLimit, AdmissionDecision, AdmissionPolicy};
use crate::metrics::SosMetrics;
use crate::store::{CommitResult, SosStore};

/// Upper bound on snapshot/commit rounds for a single admit.
pub const DEFAULT_MAX_COMMIT_ATTEMPTS: u32 = 64;

/// A validated trigger, ready for admission.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionRequest {
    /// The triggering user.
    pub user_id: UserId,
    /// The circle the alert is raised in.
    pub circle_id: CircleId,
    /// Location, if shared.
    pub location: Option<Location>,
    /// How the alert was raised.
    pub trigger_method: TriggerMethod,
}

/// A successful admission.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionResult {
    /// The created event.
    pub event: SosEvent,
    /// The limit record as committed.
    pub limit: AccountLimit,
}

/// Gatekeeper for trigger requests.
pub struct AdmissionController<S: ?Sized> {
    store: Arc<S>,
    policy: AdmissionPolicy,
    max_attempts: u32,
    metrics: SosMetrics,
}

impl<S: ?Sized> std::fmt::Debug for AdmissionController<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("policy", &self.policy)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl<S: SosStore + ?Sized> AdmissionController<S> {
    /// Creates a controller over `store`.
    #[must_use]
    pub fn new(store: Arc<S>, policy: AdmissionPolicy) -> Self {
        Self {
            store,
            policy,
            max_attempts: DEFAULT_MAX_COMMIT_ATTEMPTS,
            metrics: SosMetrics::new(),
        }
    }

    /// Overrides the number of commit rounds before giving up.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// The policy in force.
    #[must_use]
    pub const fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    /// Admits or rejects one trigger at `now`.
    ///
    /// On success the limit increment and the new `active` event were
    /// committed together.
    ///
    /// # Errors
    ///
    /// - [`SosError::AccountLocked`] while the account lock is active
    /// - [`SosError::RateLimited`] during a cooldown or when this trigger
    ///   exceeds the quota (the cooldown is persisted first)
    /// - [`SosError::Internal`] on store failure or persistent contention
    #[tracing::instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn admit(
        &self,
        request: AdmissionRequest,
        now: DateTime<Utc>,
    ) -> Result<AdmissionResult> {
        for attempt in 1..=self.max_attempts {
            let snapshot = self.store.load_admission_state(&request.user_id).await?;
            let decision =
                self.policy
                    .evaluate(snapshot.limit.as_ref(), snapshot.lock_expires_at, now);

            let (limit, event) = match decision {
                AdmissionDecision::Locked { lock_expires_at } => {
                    self.metrics.record_admission(decision.as_label());
                    tracing::info!(%lock_expires_at, "trigger rejected: account locked");
                    return Err(SosError::AccountLocked { lock_expires_at });
                }
                AdmissionDecision::CoolingDown {
                    cooldown_until,
                    retry_after,
                } => {
                    self.metrics.record_admission(decision.as_label());
                    tracing::info!(%cooldown_until, "trigger rejected: cooling down");
                    return Err(SosError::RateLimited {
                        retry_after,
                        cooldown_until,
                    });
                }
                AdmissionDecision::Exhausted { limit, .. } => (limit, None),
                AdmissionDecision::Admit { limit } => {
                    let event = SosEvent::new(
                        request.user_id.clone(),
                        request.circle_id.clone(),
                        request.location,
                        request.trigger_method,
                        now,
                    );
                    (limit, Some(event))
                }
            };

            match self
                .store
                .commit_admission(&request.user_id, snapshot.version, limit, event.clone())
                .await?
            {
                CommitResult::Committed => {}
                CommitResult::VersionConflict { actual } => {
                    tracing::debug!(
                        attempt,
                        expected = snapshot.version,
                        actual,
                        "admission conflict, retrying"
                    );
                    self.metrics.record_admission_conflict();
                    tokio::task::yield_now().await;
                    continue;
                }
            }

            self.metrics.record_admission(decision.as_label());
            return match (decision, event) {
                (AdmissionDecision::Exhausted { retry_after, .. }, _) => {
                    let cooldown_until = limit.cooldown_until.unwrap_or(now + retry_after);
                    tracing::warn!(%cooldown_until, "trigger quota exceeded, cooldown started");
                    Err(SosError::RateLimited {
                        retry_after,
                        cooldown_until,
                    })
                }
                (_, Some(event)) => {
                    tracing::info!(
                        event_id = %event.event_id,
                        trigger_count = limit.trigger_count,
                        "trigger admitted"
                    );
                    Ok(AdmissionResult { event, limit })
                }
                (_, None) => Err(SosError::internal("admitted decision without event")),
            };
        }

        Err(SosError::internal(format!(
            "admission for {} did not commit after {} attempts",
            request.user_id, self.max_attempts
        )))
    }

    /// Deletes active events that exceed the quota for the user's current window.
    ///
    /// Only events written outside [`Self::admit`] can cause an excess. The
    /// newest events beyond `max_triggers` are removed and their IDs returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    #[tracing::instrument(skip(self, user), fields(user_id = %user))]
    pub async fn correct_window(&self, user: &UserId, now: DateTime<Utc>) -> Result<Vec<EventId>> {
        let window_start = match self.store.account_limit(user).await? {
            Some(limit) if now - limit.window_start <= self.policy.window => limit.window_start,
            _ => now - self.policy.window,
        };

        let active: Vec<SosEvent> = self
            .store
            .events_for_user_since(user, window_start)
            .await?
            .into_iter()
            .filter(SosEvent::is_active)
            .collect();

        let allowed = usize::try_from(self.policy.max_triggers).unwrap_or(usize::MAX);
        if active.len() <= allowed {
            return Ok(Vec::new());
        }

        let mut deleted = Vec::with_capacity(active.len() - allowed);
        for event in active.iter().skip(allowed) {
            if self.store.delete_event(&event.event_id).await?.is_some() {
                deleted.push(event.event_id);
            }
        }
        tracing::warn!(
            deleted = deleted.len(),
            "removed events created in violation of trigger limits"
        );
        self.metrics.record_abuse_corrections(deleted.len());
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySosStore;
    use chrono::Duration;

    fn request(user: &str) -> Result<AdmissionRequest> {
        Ok(AdmissionRequest {
            user_id: UserId::new(user)?,
            circle_id: CircleId::new("c1")?,
            location: Some(Location::new(34.05, -118.25, 10.0)?),
            trigger_method: TriggerMethod::Hold,
        })
    }

    fn controller() -> (Arc<InMemorySosStore>, AdmissionController<InMemorySosStore>) {
        let store = Arc::new(InMemorySosStore::new());
        let controller = AdmissionController::new(Arc::clone(&store), AdmissionPolicy::default());
        (store, controller)
    }

    #[tokio::test]
    async fn first_trigger_commits_event_and_record() -> Result<()> {
        let (store, controller) = controller();
        let now = Utc::now();
        let result = controller.admit(request("u1")?, now).await?;

        assert_eq!(result.limit.trigger_count, 1);
        assert_eq!(result.limit.window_start, now);
        let stored = store.get_event(&result.event.event_id).await?;
        assert_eq!(stored, Some(result.event));
        Ok(())
    }

    #[tokio::test]
    async fn fourth_trigger_is_rate_limited() -> Result<()> {
        let (store, controller) = controller();
        let now = Utc::now();
        for minute in 0..3 {
            controller
                .admit(request("u1")?, now + Duration::minutes(minute))
                .await?;
        }

        let fourth = now + Duration::minutes(10);
        let err = controller.admit(request("u1")?, fourth).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::hours(1)));

        let record = store.account_limit(&UserId::new("u1")?).await?.unwrap();
        assert_eq!(record.trigger_count, 3);
        assert_eq!(record.cooldown_until, Some(fourth + Duration::hours(1)));
        assert_eq!(store.event_count()?, 3);
        Ok(())
    }

    #[tokio::test]
    async fn cooldown_retry_after_counts_down() -> Result<()> {
        let (_store, controller) = controller();
        let now = Utc::now();
        for _ in 0..3 {
            controller.admit(request("u1")?, now).await?;
        }
        let _ = controller.admit(request("u1")?, now).await;

        let later = now + Duration::minutes(15);
        let err = controller.admit(request("u1")?, later).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::minutes(45)));
        Ok(())
    }

    #[tokio::test]
    async fn locked_account_writes_nothing() -> Result<()> {
        let (store, controller) = controller();
        let user = UserId::new("u1")?;
        let now = Utc::now();
        store
            .set_account_lock(&user, Some(now + Duration::days(1)))
            .await?;

        let err = controller.admit(request("u1")?, now).await.unwrap_err();
        assert!(matches!(err, SosError::AccountLocked { .. }));
        assert_eq!(store.account_limit(&user).await?, None);
        assert_eq!(store.event_count()?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn users_are_independent() -> Result<()> {
        let (_store, controller) = controller();
        let now = Utc::now();
        for _ in 0..3 {
            controller.admit(request("u1")?, now).await?;
        }
        assert!(controller.admit(request("u2")?, now).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn correct_window_deletes_newest_excess() -> Result<()> {
        let (store, controller) = controller();
        let user = UserId::new("u1")?;
        let now = Utc::now();
        let mut imported = Vec::new();
        for minute in 0..5 {
            let event = SosEvent::new(
                user.clone(),
                CircleId::new("c1")?,
                None,
                TriggerMethod::Hold,
                now + Duration::minutes(minute),
            );
            imported.push(event.event_id);
            store.import_event(event)?;
        }

        let deleted = controller
            .correct_window(&user, now + Duration::minutes(10))
            .await?;
        assert_eq!(deleted, imported[3..].to_vec());
        assert_eq!(store.event_count()?, 3);

        let again = controller
            .correct_window(&user, now + Duration::minutes(10))
            .await?;
        assert!(again.is_empty());
        Ok(())
    }
}
