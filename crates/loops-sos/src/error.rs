//! Error taxonomy for the SOS engine.
//!
//! Every failure a trigger caller can observe is a [`SosError`] variant, and
//! [`ErrorKind`] gives callers a fieldless discriminant to branch on
//! (retryable vs. fatal) without matching on messages.
//!
//! Channel attempts fail with [`DeliveryError`]; those are recorded in the
//! audit log and never escalated to the trigger caller.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// The result type used throughout loops-sos.
pub type Result<T> = std::result::Result<T, SosError>;

/// Errors surfaced by the SOS engine.
#[derive(Debug, thiserror::Error)]
pub enum SosError {
    /// No caller identity was presented or it could not be verified.
    #[error("unauthenticated: {message}")]
    Unauthenticated {
        /// Why the identity was rejected.
        message: String,
    },

    /// The request payload was malformed.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong with the payload.
        message: String,
    },

    /// The account carries an active safety lock.
    #[error("account locked until {lock_expires_at}")]
    AccountLocked {
        /// When the lock elapses.
        lock_expires_at: DateTime<Utc>,
    },

    /// The trigger quota for the rolling window is exhausted.
    #[error("rate limited: retry after {} seconds", .retry_after.num_seconds())]
    RateLimited {
        /// Time remaining until the cooldown elapses.
        retry_after: chrono::Duration,
        /// Absolute end of the cooldown.
        cooldown_until: DateTime<Utc>,
    },

    /// A required resource (circle, event) does not exist.
    #[error("{resource} not found: {id}")]
    ResourceMissing {
        /// The kind of resource that was missing.
        resource: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A single delivery step failed; recovered locally.
    #[error("transient delivery failure: {message}")]
    TransientDeliveryFailure {
        /// Description of the failure.
        message: String,
    },

    /// An unexpected store or queue failure.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Fieldless discriminant of [`SosError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`SosError::Unauthenticated`].
    Unauthenticated,
    /// See [`SosError::InvalidArgument`].
    InvalidArgument,
    /// See [`SosError::AccountLocked`].
    AccountLocked,
    /// See [`SosError::RateLimited`].
    RateLimited,
    /// See [`SosError::ResourceMissing`].
    ResourceMissing,
    /// See [`SosError::TransientDeliveryFailure`].
    TransientDeliveryFailure,
    /// See [`SosError::Internal`].
    Internal,
}

impl ErrorKind {
    /// Returns true if repeating the same request later may succeed.
    ///
    /// `RateLimited` succeeds once the cooldown elapses; transient and internal
    /// failures may clear on their own. Everything else needs a different
    /// request or a different account state.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::TransientDeliveryFailure | Self::Internal
        )
    }

    /// Returns true if this kind fails a trigger request when it occurs.
    ///
    /// Transient delivery failures happen after the event is committed and
    /// are recovered by the dispatch path instead.
    #[must_use]
    pub const fn is_fatal_for_trigger(self) -> bool {
        !matches!(self, Self::TransientDeliveryFailure)
    }

    /// Returns a stable `snake_case` label for metrics and logs.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::InvalidArgument => "invalid_argument",
            Self::AccountLocked => "account_locked",
            Self::RateLimited => "rate_limited",
            Self::ResourceMissing => "resource_missing",
            Self::TransientDeliveryFailure => "transient_delivery_failure",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

impl SosError {
    /// Returns the discriminant of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthenticated { .. } => ErrorKind::Unauthenticated,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::AccountLocked { .. } => ErrorKind::AccountLocked,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::ResourceMissing { .. } => ErrorKind::ResourceMissing,
            Self::TransientDeliveryFailure { .. } => ErrorKind::TransientDeliveryFailure,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Returns how long the caller should wait before retrying, if known.
    #[must_use]
    pub fn retry_after(&self) -> Option<chrono::Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Creates an unauthenticated error.
    #[must_use]
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::Unauthenticated {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a resource missing error.
    #[must_use]
    pub fn resource_missing(resource: &'static str, id: impl std::fmt::Display) -> Self {
        Self::ResourceMissing {
            resource,
            id: id.to_string(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an internal error with a source cause.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<loops_core::Error> for SosError {
    fn from(value: loops_core::Error) -> Self {
        match value {
            loops_core::Error::InvalidId { message } | loops_core::Error::InvalidInput(message) => {
                Self::InvalidArgument { message }
            }
            other => Self::Internal {
                message: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }
}

/// Failure of a single channel attempt for one contact.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The channel cannot reach this contact (no token, no address, no session).
    #[error("channel not applicable: {reason}")]
    NotApplicable {
        /// Why the channel does not apply.
        reason: String,
    },

    /// The attempt did not finish within the per-attempt timeout.
    #[error("delivery timed out after {}ms", .after.as_millis())]
    TimedOut {
        /// The timeout that elapsed.
        after: Duration,
    },

    /// The provider accepted the request but refused the message.
    #[error("delivery rejected: {message}")]
    Rejected {
        /// Provider-supplied reason.
        message: String,
    },

    /// The provider could not be reached.
    #[error("transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },
}

impl DeliveryError {
    /// Returns true if the channel was attempted (and so must be audited).
    #[must_use]
    pub const fn was_attempted(&self) -> bool {
        !matches!(self, Self::NotApplicable { .. })
    }

    /// Creates a rejected error.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Creates a transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a not-applicable marker.
    #[must_use]
    pub fn not_applicable(reason: impl Into<String>) -> Self {
        Self::NotApplicable {
            reason: reason.into(),
        }
    }
}

impl From<DeliveryError> for SosError {
    fn from(value: DeliveryError) -> Self {
        Self::TransientDeliveryFailure {
            message: value.to_string(),
        }
    }
}
