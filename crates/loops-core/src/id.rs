//! Strongly-typed identifiers for Loops entities.
//!
//! Event identifiers are server-generated ULIDs: lexicographically sortable by
//! creation time and unique without coordination. User, circle and contact
//! identifiers are issued by external systems (auth, circle CRUD) and are
//! carried as validated opaque strings.
//!
//! # Example
//!
//! ```rust
//! use loops_core::id::{EventId, UserId};
//!
//! let event = EventId::generate();
//! let user = UserId::new("uid-123").unwrap();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: EventId = user;
//! # let _ = (event, user);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// Longest accepted external identifier.
pub const MAX_EXTERNAL_ID_LEN: usize = 128;

/// A unique identifier for an SOS event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Ulid);

impl EventId {
    /// Generates a new unique event ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates an event ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the creation timestamp encoded in the ID.
    #[must_use]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        let ms = i64::try_from(self.0.timestamp_ms()).unwrap_or(i64::MAX);
        chrono::DateTime::from_timestamp_millis(ms).unwrap_or_else(chrono::Utc::now)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid event ID '{s}': {e}"),
            })
    }
}

fn validate_external_id(kind: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidId {
            message: format!("{kind} ID cannot be empty"),
        });
    }
    if value.len() > MAX_EXTERNAL_ID_LEN {
        return Err(Error::InvalidId {
            message: format!("{kind} ID exceeds {MAX_EXTERNAL_ID_LEN} bytes"),
        });
    }
    if value.chars().any(|c| c.is_control() || c.is_whitespace() || c == '/') {
        return Err(Error::InvalidId {
            message: format!("{kind} ID '{value}' contains forbidden characters"),
        });
    }
    Ok(())
}

macro_rules! external_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a validated identifier.
            ///
            /// # Errors
            ///
            /// Returns [`Error::InvalidId`] if the value is empty, too long, or
            /// contains whitespace, control characters or `/`.
            pub fn new(value: impl Into<String>) -> Result<Self> {
                let value = value.into();
                validate_external_id($kind, &value)?;
                Ok(Self(value))
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(value: String) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

external_id!(
    /// Identity of an authenticated user, issued by the external auth provider.
    UserId,
    "user"
);

external_id!(
    /// A user's safety circle (the notification group).
    CircleId,
    "circle"
);

external_id!(
    /// An emergency contact owned by a user.
    ContactId,
    "contact"
);
