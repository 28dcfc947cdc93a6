//! Rolling-window trigger limits.
//!
//! The admission algorithm is a counter with a cooldown:
//!
//! 1. An active account lock rejects outright.
//! 2. An active cooldown rejects with the remaining time.
//! 3. A window older than [`AdmissionPolicy::window`], or one that ended in
//!    a now elapsed cooldown, starts over.
//! 4. Exceeding [`AdmissionPolicy::max_triggers`] starts a cooldown.
//! 5. Otherwise the counter is incremented.
//!
//! [`AdmissionPolicy::evaluate`] is pure; the store applies its decision
//! inside one transaction.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default number of admitted triggers per window.
pub const DEFAULT_MAX_TRIGGERS: u32 = 3;

/// Default rolling window length in seconds.
pub const DEFAULT_WINDOW_SECS: i64 = 3600;

/// Default cooldown length in seconds.
pub const DEFAULT_COOLDOWN_SECS: i64 = 3600;

/// Per-user trigger accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountLimit {
    /// Triggers admitted since `window_start`.
    pub trigger_count: u32,
    /// Start of the current window.
    pub window_start: DateTime<Utc>,
    /// While in the future, every trigger is rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl AccountLimit {
    /// The record assumed for a user with no history.
    #[must_use]
    pub const fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            trigger_count: 0,
            window_start: now,
            cooldown_until: None,
        }
    }

    /// Returns the cooldown end if it is still in effect at `now`.
    #[must_use]
    pub fn active_cooldown(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cooldown_until.filter(|until| *until > now)
    }
}

/// Admission thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    /// Maximum admitted triggers per window.
    pub max_triggers: u32,
    /// Rolling window length.
    pub window: Duration,
    /// Cooldown started when the quota is exceeded.
    pub cooldown: Duration,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            max_triggers: DEFAULT_MAX_TRIGGERS,
            window: Duration::seconds(DEFAULT_WINDOW_SECS),
            cooldown: Duration::seconds(DEFAULT_COOLDOWN_SECS),
        }
    }
}

/// Outcome of evaluating one trigger against the current record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Persist `limit` and create the event.
    Admit {
        /// The incremented record.
        limit: AccountLimit,
    },
    /// The account lock is active. Nothing is written.
    Locked {
        /// When the lock elapses.
        lock_expires_at: DateTime<Utc>,
    },
    /// A previously started cooldown is still running. Nothing is written.
    CoolingDown {
        /// End of the cooldown.
        cooldown_until: DateTime<Utc>,
        /// Time left.
        retry_after: Duration,
    },
    /// This trigger exceeded the quota. Persist `limit`, which carries a new cooldown.
    Exhausted {
        /// The record with the cooldown set.
        limit: AccountLimit,
        /// Length of the new cooldown.
        retry_after: Duration,
    },
}

impl AdmissionDecision {
    /// Returns true if the trigger is admitted.
    #[must_use]
    pub const fn is_admitted(&self) -> bool {
        matches!(self, Self::Admit { .. })
    }

    /// The record to persist, if the decision writes one.
    #[must_use]
    pub const fn record_to_persist(&self) -> Option<AccountLimit> {
        match self {
            Self::Admit { limit } | Self::Exhausted { limit, .. } => Some(*limit),
            Self::Locked { .. } | Self::CoolingDown { .. } => None,
        }
    }

    /// Stable label for metrics.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Admit { .. } => "admitted",
            Self::Locked { .. } => "locked",
            Self::CoolingDown { .. } => "cooling_down",
            Self::Exhausted { .. } => "exhausted",
        }
    }
}

impl AdmissionPolicy {
    /// Decides a single trigger at `now`.
    ///
    /// `record` is `None` for a user who has never triggered; `lock_expires_at`
    /// is the account lock flag read in the same snapshot.
    #[must_use]
    pub fn evaluate(
        &self,
        record: Option<&AccountLimit>,
        lock_expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> AdmissionDecision {
        if let Some(lock_expires_at) = lock_expires_at.filter(|expires| *expires > now) {
            return AdmissionDecision::Locked { lock_expires_at };
        }

        let mut limit = record.copied().unwrap_or_else(|| AccountLimit::fresh(now));

        if let Some(cooldown_until) = limit.active_cooldown(now) {
            return AdmissionDecision::CoolingDown {
                cooldown_until,
                retry_after: cooldown_until - now,
            };
        }

        // An elapsed cooldown always opens a new window.
        if limit.cooldown_until.is_some() || now - limit.window_start > self.window {
            limit = AccountLimit::fresh(now);
        }

        if limit.trigger_count.saturating_add(1) > self.max_triggers {
            limit.cooldown_until = Some(now + self.cooldown);
            return AdmissionDecision::Exhausted {
                limit,
                retry_after: self.cooldown,
            };
        }

        limit.trigger_count += 1;
        AdmissionDecision::Admit { limit }
    }
}
