//! Daily quota state machine
//!
//! The daily quota ledger lives on the user row. The transitions here are
//! pure so that every store applies exactly the same rules while holding the
//! user row lock:
//!
//! - a user is unlimited when `daily_quota <= 0`
//! - a reset is due once the UTC calendar date of `last_daily_reset` is
//!   behind the current UTC date
//! - exhausting the cap moves a user still on `base_group` to
//!   `fallback_group`; the next reset moves them back

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Quota units credited per unit of currency (RMB) on top-up
pub const QUOTA_PER_UNIT: i64 = 500_000;

/// Daily quota fields of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyQuotaState {
    pub daily_quota: i64,
    pub daily_used: i64,
    /// Epoch seconds
    pub last_daily_reset: i64,
    pub group: String,
    pub base_group: String,
    pub fallback_group: String,
}

/// Result of a pre-consume check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PreConsume {
    /// The request would exceed the daily cap
    pub limited: bool,
    /// A lazy reset ran before the check
    pub reset: bool,
    /// The user was moved to the fallback group
    pub switched_to_fallback: bool,
}

/// Result of a post-consume update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PostConsume {
    pub reset: bool,
    pub switched_to_fallback: bool,
}

/// Snapshot returned by `get_daily_quota_info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyQuotaInfo {
    pub daily_quota: i64,
    pub daily_used: i64,
    pub daily_remaining: i64,
    pub last_daily_reset: i64,
    pub needs_reset: bool,
    pub is_unlimited: bool,
    pub is_using_fallback: bool,
    pub group: String,
    pub base_group: String,
    pub fallback_group: String,
}

/// UTC calendar date of an epoch-seconds timestamp
pub fn utc_date(epoch_secs: i64) -> NaiveDate {
    DateTime::<Utc>::from_timestamp(epoch_secs, 0)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .date_naive()
}

/// Epoch seconds of 00:00 UTC on the day containing `now`
pub fn utc_day_start(now: DateTime<Utc>) -> i64 {
    let midnight = now.date_naive().and_hms_opt(0, 0, 0).unwrap_or_default();
    Utc.from_utc_datetime(&midnight).timestamp()
}

impl DailyQuotaState {
    pub fn is_unlimited(&self) -> bool {
        self.daily_quota <= 0
    }

    pub fn is_using_fallback(&self) -> bool {
        !self.fallback_group.is_empty() && self.group == self.fallback_group
    }

    pub fn needs_reset(&self, now: DateTime<Utc>) -> bool {
        !self.is_unlimited() && utc_date(self.last_daily_reset) < now.date_naive()
    }

    pub fn remaining(&self) -> i64 {
        if self.is_unlimited() {
            return i64::MAX;
        }
        (self.daily_quota - self.daily_used).max(0)
    }

    /// Reset the day's usage if the UTC date rolled over.
    ///
    /// Returns whether a reset happened; calling it twice on the same day is
    /// a no-op.
    pub fn reset(&mut self, now: DateTime<Utc>) -> bool {
        if !self.needs_reset(now) {
            return false;
        }
        self.daily_used = 0;
        self.last_daily_reset = now.timestamp();
        if self.is_using_fallback() && !self.base_group.is_empty() {
            self.group = self.base_group.clone();
        }
        true
    }

    /// Move a user still on the base group to the fallback group
    fn switch_to_fallback(&mut self) -> bool {
        if self.fallback_group.is_empty()
            || self.base_group.is_empty()
            || self.group != self.base_group
            || self.fallback_group == self.base_group
        {
            return false;
        }
        self.group = self.fallback_group.clone();
        true
    }

    /// Check whether consuming `delta` would exceed today's cap
    pub fn pre_consume(&mut self, delta: i64, now: DateTime<Utc>) -> PreConsume {
        if self.is_unlimited() {
            return PreConsume::default();
        }
        let reset = self.reset(now);
        if self.daily_used.saturating_add(delta.max(0)) > self.daily_quota {
            let switched_to_fallback = self.switch_to_fallback();
            return PreConsume {
                limited: true,
                reset,
                switched_to_fallback,
            };
        }
        PreConsume {
            limited: false,
            reset,
            switched_to_fallback: false,
        }
    }

    /// Record `amount` as consumed today
    pub fn post_consume(&mut self, amount: i64, now: DateTime<Utc>) -> PostConsume {
        if amount <= 0 || self.is_unlimited() {
            return PostConsume::default();
        }
        let reset = self.reset(now);
        self.daily_used = self.daily_used.saturating_add(amount);
        let switched_to_fallback = self.daily_used >= self.daily_quota && self.switch_to_fallback();
        PostConsume {
            reset,
            switched_to_fallback,
        }
    }

    pub fn info(&self, now: DateTime<Utc>) -> DailyQuotaInfo {
        DailyQuotaInfo {
            daily_quota: self.daily_quota,
            daily_used: self.daily_used,
            daily_remaining: if self.is_unlimited() { -1 } else { self.remaining() },
            last_daily_reset: self.last_daily_reset,
            needs_reset: self.needs_reset(now),
            is_unlimited: self.is_unlimited(),
            is_using_fallback: self.is_using_fallback(),
            group: self.group.clone(),
            base_group: self.base_group.clone(),
            fallback_group: self.fallback_group.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn pro_user(now: DateTime<Utc>) -> DailyQuotaState {
        DailyQuotaState {
            daily_quota: 1000,
            daily_used: 0,
            last_daily_reset: now.timestamp(),
            group: "pro".into(),
            base_group: "pro".into(),
            fallback_group: "free".into(),
        }
    }

    #[test]
    fn cap_exceeded_switches_to_fallback() {
        let now = at("2025-01-10T08:00:00Z");
        let mut state = pro_user(now);

        let outcome = state.pre_consume(1500, now);
        assert!(outcome.limited);
        assert!(outcome.switched_to_fallback);
        assert_eq!(state.group, "free");

        let tomorrow = at("2025-01-11T00:00:30Z");
        assert!(state.reset(tomorrow));
        assert_eq!(state.daily_used, 0);
        assert_eq!(state.group, "pro");
    }

    #[test]
    fn reset_is_once_per_utc_day() {
        let now = at("2025-01-10T23:59:00Z");
        let mut state = pro_user(now);
        state.daily_used = 900;
        assert!(!state.reset(at("2025-01-10T23:59:59Z")));
        assert_eq!(state.daily_used, 900);

        assert!(state.reset(at("2025-01-11T00:00:01Z")));
        state.daily_used = 10;
        assert!(!state.reset(at("2025-01-11T23:00:00Z")));
        assert_eq!(state.daily_used, 10);
    }

    #[test]
    fn unlimited_never_limits_or_resets() {
        let now = at("2025-01-10T08:00:00Z");
        let mut state = pro_user(now);
        state.daily_quota = 0;
        state.last_daily_reset = 0;
        assert!(!state.needs_reset(now));
        let outcome = state.pre_consume(i64::MAX / 2, now);
        assert!(!outcome.limited);
        assert!(!state.reset(now));
        assert_eq!(state.info(now).daily_remaining, -1);
    }

    #[test]
    fn post_consume_exhaustion_switches_once() {
        let now = at("2025-01-10T08:00:00Z");
        let mut state = pro_user(now);
        assert!(!state.post_consume(999, now).switched_to_fallback);
        assert!(state.post_consume(1, now).switched_to_fallback);
        assert_eq!(state.group, "free");
        assert!(!state.post_consume(10, now).switched_to_fallback);
    }

    #[test]
    fn admin_override_group_is_left_alone() {
        let now = at("2025-01-10T08:00:00Z");
        let mut state = pro_user(now);
        state.group = "vip".into();
        let outcome = state.pre_consume(5000, now);
        assert!(outcome.limited);
        assert!(!outcome.switched_to_fallback);
        assert_eq!(state.group, "vip");
    }

    #[test]
    fn pre_consume_lazily_resets() {
        let yesterday = at("2025-01-09T12:00:00Z");
        let mut state = pro_user(yesterday);
        state.daily_used = 1000;
        state.group = "free".into();

        let now = at("2025-01-10T01:00:00Z");
        let outcome = state.pre_consume(100, now);
        assert!(outcome.reset);
        assert!(!outcome.limited);
        assert_eq!(state.group, "pro");
        assert_eq!(state.daily_used, 0);
    }

    #[test]
    fn day_start_is_midnight_utc() {
        let now = at("2025-03-02T17:45:12Z");
        assert_eq!(utc_day_start(now), at("2025-03-02T00:00:00Z").timestamp());
        assert_eq!(utc_date(now.timestamp()), now.date_naive());
    }
}
