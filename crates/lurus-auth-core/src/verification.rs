//! One-shot verification codes
//!
//! Codes live in a process-wide map keyed by `purpose tag || subject`. Each
//! entry is consumed by its first successful verification. Sending is
//! throttled per subject and per source IP, both measured against the
//! caller's clock.

use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use governor::clock::{Clock, FakeRelativeClock};
use governor::middleware::NoOpMiddleware;
use governor::nanos::Nanos;
use governor::state::keyed::DashMapStateStore;
use governor::{Quota, RateLimiter};

use crate::crypto::constant_time_str_eq;
use crate::{AuthConfig, AuthError};

/// Number of digits in a verification code
pub const VERIFICATION_CODE_LEN: usize = 6;

/// What a code may be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodePurpose {
    EmailVerify,
    PasswordReset,
    Login,
    Register,
    Reset,
    Bind,
}

impl CodePurpose {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email_verify" => Some(Self::EmailVerify),
            "password_reset" => Some(Self::PasswordReset),
            "login" => Some(Self::Login),
            "register" => Some(Self::Register),
            "reset" => Some(Self::Reset),
            "bind" => Some(Self::Bind),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EmailVerify => "email_verify",
            Self::PasswordReset => "password_reset",
            Self::Login => "login",
            Self::Register => "register",
            Self::Reset => "reset",
            Self::Bind => "bind",
        }
    }

    /// Key prefix in the code map
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::EmailVerify => "v",
            Self::PasswordReset => "r",
            Self::Login => "pl",
            Self::Register => "pr",
            Self::Reset => "prs",
            Self::Bind => "pb",
        }
    }

    /// Delivered to a phone number by SMS
    pub const fn is_phone(&self) -> bool {
        !matches!(self, Self::EmailVerify | Self::PasswordReset)
    }

    fn key(&self, subject: &str) -> String {
        format!("{}{}", self.tag(), subject)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    code: String,
    issued_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    codes: HashMap<String, Entry>,
    /// Subject -> time of the last accepted send
    last_sent: HashMap<String, DateTime<Utc>>,
    /// Wall time the per-IP limiter clock stands at
    limiter_at: Option<DateTime<Utc>>,
}

type IpLimiter =
    RateLimiter<IpAddr, DashMapStateStore<IpAddr>, FakeRelativeClock, NoOpMiddleware<Nanos>>;

/// In-memory verification code store
pub struct VerificationStore {
    inner: Mutex<Inner>,
    per_ip: IpLimiter,
    /// Advanced to each caller's `now` before the per-IP check
    limiter_clock: FakeRelativeClock,
    ttl: chrono::Duration,
    resend_interval: chrono::Duration,
    soft_cap: usize,
}

impl VerificationStore {
    pub fn new(ttl: Duration, resend_interval: Duration, per_ip_hourly: u32, soft_cap: usize) -> Self {
        let per_ip = NonZeroU32::new(per_ip_hourly).unwrap_or(NonZeroU32::MIN);
        let limiter_clock = FakeRelativeClock::default();
        Self {
            inner: Mutex::new(Inner::default()),
            per_ip: RateLimiter::dashmap_with_clock(Quota::per_hour(per_ip), &limiter_clock),
            limiter_clock,
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::minutes(10)),
            resend_interval: chrono::Duration::from_std(resend_interval)
                .unwrap_or(chrono::Duration::seconds(60)),
            soft_cap,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            config.verification_ttl,
            config.verification_resend_interval,
            config.verification_per_ip_hourly,
            config.verification_soft_cap,
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the maps inconsistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve a send slot for `subject` from `ip`.
    ///
    /// Call [`VerificationStore::release_send`] if delivery then fails.
    pub fn reserve_send(
        &self,
        subject: &str,
        ip: Option<IpAddr>,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        let mut inner = self.lock();
        if let Some(last) = inner.last_sent.get(subject) {
            let elapsed = now - *last;
            if elapsed < self.resend_interval {
                let wait = (self.resend_interval - elapsed).num_seconds().max(1) as u64;
                return Err(AuthError::RateLimited {
                    retry_after_secs: wait,
                });
            }
        }

        if let Some(ip) = ip {
            self.advance_limiter(&mut inner, now);
            if let Err(not_until) = self.per_ip.check_key(&ip) {
                let wait = not_until.wait_time_from(self.limiter_clock.now());
                tracing::warn!(%ip, "Verification code requests from IP over hourly limit");
                return Err(AuthError::RateLimited {
                    retry_after_secs: wait.as_secs().max(1),
                });
            }
        }

        inner.last_sent.insert(subject.to_string(), now);
        Ok(())
    }

    /// Move the limiter clock forward to `now`; it never runs backwards
    fn advance_limiter(&self, inner: &mut Inner, now: DateTime<Utc>) {
        let at = *inner.limiter_at.get_or_insert(now);
        if let Ok(step) = (now - at).to_std() {
            self.limiter_clock.advance(step);
            inner.limiter_at = Some(now);
        }
    }

    /// Undo a reservation whose delivery failed
    pub fn release_send(&self, subject: &str) {
        self.lock().last_sent.remove(subject);
    }

    /// Store `code` for `(purpose, subject)`
    pub fn store(&self, purpose: CodePurpose, subject: &str, code: String, now: DateTime<Utc>) {
        let mut inner = self.lock();
        inner.codes.insert(purpose.key(subject), Entry { code, issued_at: now });
        if inner.codes.len() > self.soft_cap {
            self.purge(&mut inner, now);
        }
    }

    /// Check `code`; a match consumes the entry
    pub fn verify(&self, purpose: CodePurpose, subject: &str, code: &str, now: DateTime<Utc>) -> bool {
        let key = purpose.key(subject);
        let mut inner = self.lock();
        let Some(entry) = inner.codes.get(&key) else {
            return false;
        };
        if now - entry.issued_at >= self.ttl {
            inner.codes.remove(&key);
            return false;
        }
        if !constant_time_str_eq(&entry.code, code) {
            return false;
        }
        inner.codes.remove(&key);
        true
    }

    /// Number of stored codes
    pub fn len(&self) -> usize {
        self.lock().codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop codes older than the TTL and stale send records; returns the
    /// number of codes removed
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.lock();
        self.purge(&mut inner, now)
    }

    fn purge(&self, inner: &mut Inner, now: DateTime<Utc>) -> usize {
        let before = inner.codes.len();
        inner.codes.retain(|_, e| now - e.issued_at < self.ttl);
        inner.last_sent.retain(|_, at| now - *at < self.resend_interval);
        self.advance_limiter(inner, now);
        self.per_ip.retain_recent();
        let removed = before - inner.codes.len();
        tracing::debug!(removed, "Purged expired verification codes");
        removed
    }
}

impl std::fmt::Debug for VerificationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationStore")
            .field("ttl", &self.ttl)
            .field("soft_cap", &self.soft_cap)
            .finish_non_exhaustive()
    }
}
