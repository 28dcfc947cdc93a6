//! Observability infrastructure for Loops.
//!
//! Structured logging with consistent spans. Every SOS code path logs with
//! `event_id` / `user_id` fields so a single alert can be followed from the
//! trigger request through each channel attempt.

use std::fmt;
use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `loops_sos=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let result = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_fmt::layer().pretty())
                .try_init(),
        };

        // A test harness may already have installed a subscriber.
        let _ = result;
    });
}

/// Creates a span for SOS lifecycle operations (trigger, resolve).
#[must_use]
pub fn sos_span(operation: &str, event_id: &str, user_id: &str) -> Span {
    tracing::info_span!("sos", op = operation, event_id = event_id, user_id = user_id)
}

/// Creates a span for notification dispatch of a single event.
#[must_use]
pub fn dispatch_span(operation: &str, event_id: &str) -> Span {
    tracing::info_span!("dispatch", op = operation, event_id = event_id)
}

/// Wrapper that hides its value in `Debug` and `Display` output.
///
/// Contact addresses, push tokens and bearer tokens go through this before
/// reaching a log line.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Redacted<T>(pub T);

impl<T> Redacted<T> {
    /// Returns the wrapped value.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn span_helpers_create_spans() {
        let span = sos_span("trigger", "01ARZ3NDEKTSV4RRFFQ69G5FAV", "uid-1");
        let _guard = span.enter();
        tracing::info!("inside sos span");

        let span = dispatch_span("notify", "01ARZ3NDEKTSV4RRFFQ69G5FAV");
        let _guard = span.enter();
        tracing::info!("inside dispatch span");
    }

    #[test]
    fn redacted_hides_value() {
        let secret = Redacted("contact@example.com");
        assert_eq!(format!("{secret}"), "[REDACTED]");
        assert_eq!(format!("{secret:?}"), "[REDACTED]");
        assert_eq!(secret.into_inner(), "contact@example.com");
    }
}
