#![allow(clippy::expect_used, clippy::unwrap_used)]
//! Property tests for the risk gate, hold activation and admission decisions.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use proptest::prelude::*;

use loops_sos::limits::{AccountLimit, AdmissionDecision, AdmissionPolicy};
use loops_sos::risk_gate::{CancelReason, HoldActivation, HoldOutcome, RiskGate, RiskGateConfig};

fn attached_gate() -> RiskGate {
    let mut gate = RiskGate::new(RiskGateConfig::default());
    gate.attach();
    gate
}

#[test]
fn upright_and_covered_is_suppressed() {
    let mut gate = attached_gate();
    gate.record_tilt(90.0);
    gate.record_proximity(2.0);
    assert!(gate.evaluate());
}

#[test]
fn missing_proximity_never_suppresses() {
    let mut gate = attached_gate();
    gate.record_tilt(90.0);
    assert!(!gate.evaluate());
}

proptest! {
    #[test]
    fn suppression_matches_band_and_threshold(tilt in -180.0f64..180.0, distance in 0.0f64..50.0) {
        let mut gate = attached_gate();
        gate.record_tilt(tilt);
        gate.record_proximity(distance);
        let expected = (75.0..=105.0).contains(&tilt) && distance < 5.0;
        prop_assert_eq!(gate.evaluate(), expected);
    }

    #[test]
    fn a_single_reading_never_suppresses(value in -180.0f64..180.0, tilt_only in any::<bool>()) {
        let mut gate = attached_gate();
        if tilt_only {
            gate.record_tilt(value);
        } else {
            gate.record_proximity(value.abs());
        }
        prop_assert!(!gate.evaluate());
    }

    #[test]
    fn sensor_error_invalidates_reading(tilt in 75.0f64..=105.0, distance in 0.0f64..5.0) {
        let mut gate = attached_gate();
        gate.record_tilt(tilt);
        gate.record_proximity(distance);
        gate.record_proximity_error();
        prop_assert!(!gate.evaluate());
    }

    #[test]
    fn completed_hold_evaluates_once_and_detaches(
        tilt in -180.0f64..180.0,
        distance in 0.0f64..50.0,
        extra_ms in 0u64..2_000,
    ) {
        let mut hold = HoldActivation::default();
        hold.mount();
        hold.gate_mut().record_tilt(tilt);
        hold.gate_mut().record_proximity(distance);

        let start = Instant::now();
        hold.press(start);
        prop_assert_eq!(hold.poll(start + Duration::from_millis(2_999)), None);

        let outcome = hold.poll(start + Duration::from_millis(3_000 + extra_ms));
        let pocketed = (75.0..=105.0).contains(&tilt) && distance < 5.0;
        let expected = if pocketed {
            HoldOutcome::Canceled(CancelReason::PocketDialRisk)
        } else {
            HoldOutcome::Activated
        };
        prop_assert_eq!(outcome, Some(expected));
        prop_assert!(!hold.gate_mut().is_attached());
        prop_assert_eq!(hold.gate_mut().tilt_deg(), None);
        // The outcome is reported once.
        prop_assert_eq!(hold.poll(start + Duration::from_secs(10)), None);
    }

    #[test]
    fn early_release_cancels(held_ms in 0u64..3_000) {
        let mut hold = HoldActivation::default();
        hold.mount();
        let start = Instant::now();
        hold.press(start);
        prop_assert_eq!(
            hold.release(start + Duration::from_millis(held_ms)),
            Some(HoldOutcome::Canceled(CancelReason::ReleasedEarly))
        );
    }
}

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

proptest! {
    /// Replays one user's triggers through the policy, persisting what each
    /// decision writes, the way the admission controller does.
    #[test]
    fn admission_respects_quota_cooldown_and_reset(gaps in proptest::collection::vec(0i64..2_400, 1..60)) {
        let policy = AdmissionPolicy::default();
        let mut record: Option<AccountLimit> = None;
        let mut admitted_per_window: HashMap<DateTime<Utc>, u32> = HashMap::new();
        let mut now = t0();

        for gap in gaps {
            now += chrono::Duration::seconds(gap);
            let previous = record;
            let decision = policy.evaluate(record.as_ref(), None, now);

            match decision {
                AdmissionDecision::Admit { limit } => {
                    let admitted = admitted_per_window.entry(limit.window_start).or_insert(0);
                    *admitted += 1;
                    prop_assert!(*admitted <= policy.max_triggers);
                    prop_assert!(limit.trigger_count <= 3);
                    prop_assert_eq!(limit.trigger_count, *admitted);
                    prop_assert!(now - limit.window_start <= policy.window);

                    if let Some(until) = previous.and_then(|p| p.cooldown_until) {
                        prop_assert!(now >= until);
                        prop_assert_eq!(limit.trigger_count, 1);
                        prop_assert_eq!(limit.window_start, now);
                    }
                }
                AdmissionDecision::CoolingDown { cooldown_until, retry_after } => {
                    prop_assert!(cooldown_until > now);
                    prop_assert_eq!(retry_after, cooldown_until - now);
                }
                AdmissionDecision::Exhausted { limit, retry_after } => {
                    prop_assert_eq!(limit.trigger_count, policy.max_triggers);
                    prop_assert_eq!(limit.cooldown_until, Some(now + policy.cooldown));
                    prop_assert_eq!(retry_after, policy.cooldown);
                }
                AdmissionDecision::Locked { .. } => prop_assert!(false, "no lock was set"),
            }

            if let Some(limit) = decision.record_to_persist() {
                record = Some(limit);
            }
        }
    }
}
