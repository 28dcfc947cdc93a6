//! Error types and result aliases shared across Loops crates.
//!
//! Domain crates define their own error taxonomies and convert from this type
//! where a primitive operation (id parsing, configuration) fails.

/// The result type used by shared primitives.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in shared primitive operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_the_message() {
        let err = Error::internal("failed to bind to 0.0.0.0:8080");
        assert_eq!(err.to_string(), "internal error: failed to bind to 0.0.0.0:8080");

        let err = Error::InvalidInput("LOOPS_HTTP_PORT must be a u16".into());
        assert!(err.to_string().starts_with("invalid input"));
    }
}
