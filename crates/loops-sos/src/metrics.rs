//! Engine metrics.
//!
//! Recorded through the `metrics` facade; the API crate installs a
//! Prometheus recorder and serves them at `/metrics`.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `loops_sos_admissions_total` | Counter | `outcome` | Admission decisions |
//! | `loops_sos_admission_conflicts_total` | Counter | - | Commit rounds lost to a concurrent writer |
//! | `loops_sos_abuse_corrections_total` | Counter | - | Events deleted by the correction sweep |
//! | `loops_sos_dispatch_publish_failures_total` | Counter | - | Dispatch publishes that failed after commit |
//! | `loops_sos_dispatch_messages_total` | Counter | `outcome` | Dispatch messages handled |
//! | `loops_sos_notification_attempts_total` | Counter | `channel`, `kind`, `status` | Channel attempts |
//! | `loops_sos_notification_attempt_seconds` | Histogram | `channel` | Channel attempt latency |
//! | `loops_sos_dispatch_queue_depth` | Gauge | - | Visible messages in the dispatch queue |

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Metric names.
pub mod names {
    /// Counter: admission decisions by outcome.
    pub const ADMISSIONS_TOTAL: &str = "loops_sos_admissions_total";
    /// Counter: admission commit conflicts.
    pub const ADMISSION_CONFLICTS_TOTAL: &str = "loops_sos_admission_conflicts_total";
    /// Counter: events deleted by abuse correction.
    pub const ABUSE_CORRECTIONS_TOTAL: &str = "loops_sos_abuse_corrections_total";
    /// Counter: failed dispatch publishes.
    pub const PUBLISH_FAILURES_TOTAL: &str = "loops_sos_dispatch_publish_failures_total";
    /// Counter: dispatch messages by outcome.
    pub const DISPATCH_MESSAGES_TOTAL: &str = "loops_sos_dispatch_messages_total";
    /// Counter: channel attempts.
    pub const NOTIFICATION_ATTEMPTS_TOTAL: &str = "loops_sos_notification_attempts_total";
    /// Histogram: channel attempt latency in seconds.
    pub const NOTIFICATION_ATTEMPT_SECONDS: &str = "loops_sos_notification_attempt_seconds";
    /// Gauge: visible dispatch queue depth.
    pub const DISPATCH_QUEUE_DEPTH: &str = "loops_sos_dispatch_queue_depth";
}

/// Label keys.
pub mod labels {
    /// Decision or handling outcome.
    pub const OUTCOME: &str = "outcome";
    /// Delivery channel.
    pub const CHANNEL: &str = "channel";
    /// Notification kind (alert, resolution).
    pub const KIND: &str = "kind";
    /// Delivery status.
    pub const STATUS: &str = "status";
}

/// Registers descriptions for all engine metrics with the installed recorder.
pub fn register_metrics() {
    describe_counter!(names::ADMISSIONS_TOTAL, "Admission decisions by outcome");
    describe_counter!(
        names::ADMISSION_CONFLICTS_TOTAL,
        "Admission commit rounds lost to a concurrent writer"
    );
    describe_counter!(
        names::ABUSE_CORRECTIONS_TOTAL,
        "Events deleted by the abuse correction sweep"
    );
    describe_counter!(
        names::PUBLISH_FAILURES_TOTAL,
        "Dispatch publishes that failed after the event was committed"
    );
    describe_counter!(names::DISPATCH_MESSAGES_TOTAL, "Dispatch messages handled by outcome");
    describe_counter!(
        names::NOTIFICATION_ATTEMPTS_TOTAL,
        "Notification channel attempts by channel, kind and status"
    );
    describe_histogram!(
        names::NOTIFICATION_ATTEMPT_SECONDS,
        "Notification channel attempt latency in seconds"
    );
    describe_gauge!(names::DISPATCH_QUEUE_DEPTH, "Visible messages in the dispatch queue");
}

/// Cheap, cloneable handle for recording engine metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct SosMetrics;

impl SosMetrics {
    /// Creates a recorder handle.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records an admission decision.
    pub fn record_admission(&self, outcome: &'static str) {
        counter!(names::ADMISSIONS_TOTAL, labels::OUTCOME => outcome).increment(1);
    }

    /// Records a lost commit round.
    pub fn record_admission_conflict(&self) {
        counter!(names::ADMISSION_CONFLICTS_TOTAL).increment(1);
    }

    /// Records events removed by the correction sweep.
    pub fn record_abuse_corrections(&self, count: usize) {
        counter!(names::ABUSE_CORRECTIONS_TOTAL).increment(count as u64);
    }

    /// Records a dispatch publish that failed after the event was committed.
    pub fn record_publish_failure(&self) {
        counter!(names::PUBLISH_FAILURES_TOTAL).increment(1);
    }

    /// Records how a dispatch message was handled.
    pub fn record_dispatch(&self, outcome: &'static str) {
        counter!(names::DISPATCH_MESSAGES_TOTAL, labels::OUTCOME => outcome).increment(1);
    }

    /// Records one channel attempt and its latency.
    pub fn record_attempt(
        &self,
        channel: &'static str,
        kind: &'static str,
        status: &'static str,
        elapsed: Duration,
    ) {
        counter!(
            names::NOTIFICATION_ATTEMPTS_TOTAL,
            labels::CHANNEL => channel,
            labels::KIND => kind,
            labels::STATUS => status,
        )
        .increment(1);
        histogram!(names::NOTIFICATION_ATTEMPT_SECONDS, labels::CHANNEL => channel)
            .record(elapsed.as_secs_f64());
    }

    /// Sets the visible dispatch queue depth.
    #[allow(clippy::cast_precision_loss)] // Queue depths are small.
    pub fn set_queue_depth(&self, depth: usize) {
        gauge!(names::DISPATCH_QUEUE_DEPTH).set(depth as f64);
    }
}
