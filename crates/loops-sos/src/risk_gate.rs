//! Client-side pocket-dial suppression.
//!
//! This module provides:
//!
//! - [`RiskGate`]: fuses tilt and proximity readings into a single
//!   "likely incidental" decision
//! - [`HoldActivation`]: the press-and-hold activation affordance that
//!   consults the gate exactly once when the hold completes
//!
//! A gate is owned by the affordance that mounts it. Readings are only
//! accepted while the gate is attached, and detaching clears them, so a
//! stale reading from an earlier gesture can never suppress a new one.

use std::time::{Duration, Instant};

/// Thresholds for pocket-dial detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskGateConfig {
    /// Tilt (degrees) that counts as upright. 90 is a phone held vertically.
    pub upright_tilt_deg: f64,
    /// Allowed deviation from upright, inclusive on both sides.
    pub tilt_tolerance_deg: f64,
    /// Proximity below this distance (cm) counts as covered.
    pub proximity_threshold_cm: f64,
}

impl Default for RiskGateConfig {
    fn default() -> Self {
        Self {
            upright_tilt_deg: 90.0,
            tilt_tolerance_deg: 15.0,
            proximity_threshold_cm: 5.0,
        }
    }
}

impl RiskGateConfig {
    fn tilt_in_pocket_band(&self, tilt_deg: f64) -> bool {
        let low = self.upright_tilt_deg - self.tilt_tolerance_deg;
        let high = self.upright_tilt_deg + self.tilt_tolerance_deg;
        (low..=high).contains(&tilt_deg)
    }
}

/// Instance-scoped sensor cache and pocket-dial evaluator.
#[derive(Debug, Clone, Default)]
pub struct RiskGate {
    config: RiskGateConfig,
    attached: bool,
    tilt_deg: Option<f64>,
    proximity_cm: Option<f64>,
}

impl RiskGate {
    /// Creates a detached gate with the given thresholds.
    #[must_use]
    pub fn new(config: RiskGateConfig) -> Self {
        Self {
            config,
            attached: false,
            tilt_deg: None,
            proximity_cm: None,
        }
    }

    /// Starts accepting sensor readings.
    pub fn attach(&mut self) {
        self.attached = true;
    }

    /// Stops accepting sensor readings and forgets the cached ones.
    pub fn detach(&mut self) {
        self.attached = false;
        self.tilt_deg = None;
        self.proximity_cm = None;
    }

    /// Returns true while readings are accepted.
    #[must_use]
    pub const fn is_attached(&self) -> bool {
        self.attached
    }

    /// Caches a tilt reading. Ignored while detached; non-finite values clear the cache.
    pub fn record_tilt(&mut self, tilt_deg: f64) {
        if self.attached {
            self.tilt_deg = tilt_deg.is_finite().then_some(tilt_deg);
        }
    }

    /// Caches a proximity reading. Ignored while detached; non-finite values clear the cache.
    pub fn record_proximity(&mut self, distance_cm: f64) {
        if self.attached {
            self.proximity_cm = distance_cm.is_finite().then_some(distance_cm);
        }
    }

    /// The tilt sensor reported an error.
    pub fn record_tilt_error(&mut self) {
        self.tilt_deg = None;
    }

    /// The proximity sensor reported an error.
    pub fn record_proximity_error(&mut self) {
        self.proximity_cm = None;
    }

    /// Cached tilt, if any.
    #[must_use]
    pub const fn tilt_deg(&self) -> Option<f64> {
        self.tilt_deg
    }

    /// Cached proximity, if any.
    #[must_use]
    pub const fn proximity_cm(&self) -> Option<f64> {
        self.proximity_cm
    }

    /// Returns true if the activation should be suppressed.
    ///
    /// Both readings must be present: a missing reading never suppresses.
    #[must_use]
    pub fn evaluate(&self) -> bool {
        match (self.tilt_deg, self.proximity_cm) {
            (Some(tilt), Some(distance)) => {
                self.config.tilt_in_pocket_band(tilt)
                    && distance < self.config.proximity_threshold_cm
            }
            _ => false,
        }
    }
}

/// Default press duration before an SOS activates.
pub const DEFAULT_HOLD_DURATION: Duration = Duration::from_secs(3);

/// Why an activation did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// The press ended before the hold duration elapsed.
    ReleasedEarly,
    /// The risk gate judged the gesture incidental.
    PocketDialRisk,
}

/// Result of a completed or abandoned hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HoldOutcome {
    /// Send the trigger request.
    Activated,
    /// Client-only cancellation; nothing is sent.
    Canceled(CancelReason),
}

/// State of the hold affordance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldState {
    /// Waiting for a press.
    Idle,
    /// Pressed since the given instant.
    Holding {
        /// When the press began.
        since: Instant,
    },
    /// The hold completed and passed the gate.
    Activated,
    /// The hold ended without activating.
    Canceled(CancelReason),
}

/// Press-and-hold activation with pocket-dial suppression.
///
/// ```
/// use std::time::{Duration, Instant};
/// use loops_sos::risk_gate::{HoldActivation, HoldOutcome};
///
/// let mut hold = HoldActivation::default();
/// hold.mount();
/// let start = Instant::now();
/// hold.press(start);
/// let outcome = hold.poll(start + Duration::from_secs(3));
/// assert_eq!(outcome, Some(HoldOutcome::Activated));
/// ```
#[derive(Debug, Clone)]
pub struct HoldActivation {
    gate: RiskGate,
    hold_duration: Duration,
    state: HoldState,
}

impl Default for HoldActivation {
    fn default() -> Self {
        Self::new(RiskGateConfig::default(), DEFAULT_HOLD_DURATION)
    }
}

impl HoldActivation {
    /// Creates an unmounted affordance.
    #[must_use]
    pub fn new(config: RiskGateConfig, hold_duration: Duration) -> Self {
        Self {
            gate: RiskGate::new(config),
            hold_duration,
            state: HoldState::Idle,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> HoldState {
        self.state
    }

    /// The gate, for feeding sensor readings.
    pub fn gate_mut(&mut self) -> &mut RiskGate {
        &mut self.gate
    }

    /// The affordance became visible: start listening to sensors.
    pub fn mount(&mut self) {
        self.gate.attach();
        self.state = HoldState::Idle;
    }

    /// The affordance went away: stop listening and abandon any hold.
    pub fn unmount(&mut self) {
        self.gate.detach();
        self.state = HoldState::Idle;
    }

    /// A press began. Re-attaches sensors if a previous hold detached them.
    pub fn press(&mut self, at: Instant) {
        if matches!(self.state, HoldState::Holding { .. }) {
            return;
        }
        if !self.gate.is_attached() {
            self.gate.attach();
        }
        self.state = HoldState::Holding { since: at };
    }

    /// Checks whether a held press has reached the hold duration.
    ///
    /// Returns the outcome once, at the moment the hold completes.
    pub fn poll(&mut self, now: Instant) -> Option<HoldOutcome> {
        let HoldState::Holding { since } = self.state else {
            return None;
        };
        if now.saturating_duration_since(since) < self.hold_duration {
            return None;
        }
        Some(self.complete())
    }

    /// The press ended.
    ///
    /// A release after the hold duration completes the hold, which matters when
    /// the caller never polled.
    pub fn release(&mut self, at: Instant) -> Option<HoldOutcome> {
        let HoldState::Holding { since } = self.state else {
            return None;
        };
        if at.saturating_duration_since(since) >= self.hold_duration {
            return Some(self.complete());
        }
        self.state = HoldState::Canceled(CancelReason::ReleasedEarly);
        Some(HoldOutcome::Canceled(CancelReason::ReleasedEarly))
    }

    fn complete(&mut self) -> HoldOutcome {
        let suppress = self.gate.evaluate();
        self.gate.detach();
        if suppress {
            tracing::debug!("activation suppressed: pocket dial risk");
            self.state = HoldState::Canceled(CancelReason::PocketDialRisk);
            HoldOutcome::Canceled(CancelReason::PocketDialRisk)
        } else {
            self.state = HoldState::Activated;
            HoldOutcome::Activated
        }
    }
}
