//! Property-based tests for the daily quota state machine
//!
//! These tests verify the ledger invariants:
//! - `daily_used` never goes negative
//! - the effective group is always base, fallback, or an override
//! - a reset on a new UTC day always zeroes usage

use chrono::{DateTime, Duration, TimeZone, Utc};
use lurus_types::DailyQuotaState;
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Pre(i64),
    Post(i64),
    Advance(i64),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (-100i64..5_000).prop_map(Op::Pre),
        (-100i64..5_000).prop_map(Op::Post),
        (0i64..172_800).prop_map(Op::Advance),
    ]
}

fn arb_state() -> impl Strategy<Value = DailyQuotaState> {
    (
        -10i64..10_000,
        prop_oneof![Just("pro"), Just("free"), Just("vip")],
        prop_oneof![Just("free"), Just("")],
    )
        .prop_map(|(daily_quota, group, fallback)| DailyQuotaState {
            daily_quota,
            daily_used: 0,
            last_daily_reset: start().timestamp(),
            group: group.to_string(),
            base_group: "pro".to_string(),
            fallback_group: fallback.to_string(),
        })
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 10, 6, 0, 0).unwrap()
}

// ============================================================================
// Ledger Properties
// ============================================================================

proptest! {
    /// Property: no sequence of operations drives usage below zero or puts
    /// the user in a group outside {base, fallback, initial override}
    #[test]
    fn prop_ledger_invariants_hold(
        initial in arb_state(),
        ops in prop::collection::vec(arb_op(), 0..40)
    ) {
        let override_group = initial.group.clone();
        let mut state = initial;
        let mut now = start();

        for op in ops {
            match op {
                Op::Pre(delta) => { state.pre_consume(delta, now); }
                Op::Post(amount) => { state.post_consume(amount, now); }
                Op::Advance(secs) => now += Duration::seconds(secs),
            }
            prop_assert!(state.daily_used >= 0);
            prop_assert!(
                state.group == state.base_group
                    || state.group == state.fallback_group
                    || state.group == override_group,
                "unexpected group {:?}", state.group
            );
        }
    }

    /// Property: a reset tick on a later UTC day leaves a capped user at zero
    #[test]
    fn prop_reset_on_new_day_zeroes_usage(
        used in 0i64..1_000_000,
        quota in 1i64..1_000_000,
        days in 1i64..30,
        secs in 0i64..86_400
    ) {
        let mut state = DailyQuotaState {
            daily_quota: quota,
            daily_used: used,
            last_daily_reset: start().timestamp(),
            group: "free".into(),
            base_group: "pro".into(),
            fallback_group: "free".into(),
        };
        let later = start() + Duration::days(days) + Duration::seconds(secs);
        prop_assert!(state.reset(later));
        prop_assert_eq!(state.daily_used, 0);
        prop_assert_eq!(state.group.as_str(), "pro");
        prop_assert!(!state.reset(later));
    }

    /// Property: unlimited users are never limited
    #[test]
    fn prop_unlimited_never_limited(quota in -1_000i64..=0, delta in 0i64..i64::MAX / 4) {
        let mut state = DailyQuotaState {
            daily_quota: quota,
            daily_used: 0,
            last_daily_reset: 0,
            group: "pro".into(),
            base_group: "pro".into(),
            fallback_group: "free".into(),
        };
        prop_assert!(!state.pre_consume(delta, start()).limited);
        prop_assert_eq!(state.group.as_str(), "pro");
    }
}
