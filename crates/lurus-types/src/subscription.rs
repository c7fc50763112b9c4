//! Subscription types and state transitions
//!
//! ```text
//! pending --payment--> active --time--> expired
//!    |                   |
//!    +----cancel---------+--> cancelled --refund--> refunded
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{SubscriptionPlan, TenantId, TransitionError, User, UserId, DEFAULT_GROUP};

/// Pending orders older than this are swept to `expired`
pub const PENDING_TTL_HOURS: i64 = 24;

/// Relative tolerance applied when comparing paid and expected amounts
pub const AMOUNT_TOLERANCE_PERCENT: i64 = 5;

/// Unique subscription identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub i64);

impl SubscriptionId {
    pub fn parse(s: &str) -> Option<Self> {
        s.parse::<i64>().ok().filter(|id| *id > 0).map(Self)
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Expired,
    Cancelled,
    Refunded,
}

impl SubscriptionStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "expired" => Some(Self::Expired),
            "cancelled" => Some(Self::Cancelled),
            "refunded" => Some(Self::Refunded),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired | Self::Cancelled | Self::Refunded)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment gateway that settled a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Stripe,
    Creem,
    Epay,
    /// Granted through the internal API, no payment involved
    Internal,
}

impl PaymentMethod {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stripe => "stripe",
            Self::Creem => "creem",
            Self::Epay => "epay",
            Self::Internal => "internal",
        }
    }

    /// Parse a user-selectable gateway; `internal` is not accepted here
    pub fn parse_gateway(s: &str) -> Option<Self> {
        match s {
            "stripe" => Some(Self::Stripe),
            "creem" => Some(Self::Creem),
            "epay" => Some(Self::Epay),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's subscription to a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub plan_code: String,
    pub plan_name: String,
    pub status: SubscriptionStatus,
    pub daily_quota: i64,
    pub total_quota: i64,
    pub base_group: String,
    pub fallback_group: String,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub payment_method: String,
    /// Gateway reference; unique once set
    pub payment_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub auto_renew: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of confirming a payment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentTransition {
    /// The subscription moved from pending to active
    Activated,
    /// It was already active; nothing changed
    AlreadyActive,
}

/// Start of a new subscription: now, or the end of the one still running
pub fn stacked_start(now: DateTime<Utc>, current_expires_at: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match current_expires_at {
        Some(expires) if expires > now => expires,
        _ => now,
    }
}

/// Whether `paid` is within the tolerance band around `expected`
pub fn amount_within_tolerance(expected_cents: i64, paid_cents: i64) -> bool {
    let tolerance = expected_cents.abs() * AMOUNT_TOLERANCE_PERCENT / 100;
    (paid_cents - expected_cents).abs() <= tolerance
}

impl Subscription {
    /// Whether the subscription grants entitlements at `now`
    pub fn is_in_effect(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active && self.started_at <= now && now < self.expires_at
    }

    pub fn period(&self) -> Duration {
        self.expires_at - self.started_at
    }

    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_days().max(0)
    }

    /// Confirm a payment for this subscription.
    ///
    /// A pending row becomes active and records the gateway reference. A row
    /// that is already active is left untouched so that redelivered webhooks
    /// are harmless. If the row was stacked behind a running subscription its
    /// future start is kept; otherwise the period is shifted to begin now.
    pub fn confirm_payment(
        &mut self,
        payment_id: &str,
        method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> Result<PaymentTransition, TransitionError> {
        match self.status {
            SubscriptionStatus::Active => Ok(PaymentTransition::AlreadyActive),
            SubscriptionStatus::Pending => {
                if self.started_at <= now {
                    let period = self.period();
                    self.started_at = now;
                    self.expires_at = now + period;
                }
                self.status = SubscriptionStatus::Active;
                self.payment_id = Some(payment_id.to_string());
                self.payment_method = method.as_str().to_string();
                self.updated_at = now;
                Ok(PaymentTransition::Activated)
            }
            other => Err(TransitionError {
                action: "confirm payment",
                state: other.to_string(),
            }),
        }
    }

    /// Mark an overdue active subscription as expired
    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.status {
            SubscriptionStatus::Active | SubscriptionStatus::Pending => {
                self.status = SubscriptionStatus::Expired;
                self.updated_at = now;
                Ok(())
            }
            other => Err(TransitionError {
                action: "expire",
                state: other.to_string(),
            }),
        }
    }

    /// Cancel a pending order or stop an active subscription
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.status {
            SubscriptionStatus::Pending | SubscriptionStatus::Active => {
                self.status = SubscriptionStatus::Cancelled;
                self.auto_renew = false;
                self.updated_at = now;
                Ok(())
            }
            other => Err(TransitionError {
                action: "cancel",
                state: other.to_string(),
            }),
        }
    }

    /// Refund a paid subscription
    pub fn refund(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.status {
            SubscriptionStatus::Active | SubscriptionStatus::Cancelled | SubscriptionStatus::Expired
                if self.payment_id.is_some() =>
            {
                self.status = SubscriptionStatus::Refunded;
                self.auto_renew = false;
                self.updated_at = now;
                Ok(())
            }
            other => Err(TransitionError {
                action: "refund",
                state: other.to_string(),
            }),
        }
    }

    /// Whether an unpaid order is past its payment window
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Pending
            && now - self.created_at > Duration::hours(PENDING_TTL_HOURS)
    }

    /// Record the gateway checkout reference of a pending order
    pub fn attach_payment(
        &mut self,
        payment_id: &str,
        method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.status != SubscriptionStatus::Pending {
            return Err(TransitionError {
                action: "attach payment",
                state: self.status.to_string(),
            });
        }
        self.payment_id = Some(payment_id.to_string());
        self.payment_method = method.as_str().to_string();
        self.updated_at = now;
        Ok(())
    }

    /// Extend an active subscription by `days`, from its expiry or from now
    /// if it already lapsed
    pub fn renew(&mut self, days: i64, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != SubscriptionStatus::Active {
            return Err(TransitionError {
                action: "renew",
                state: self.status.to_string(),
            });
        }
        let base = if self.expires_at > now { self.expires_at } else { now };
        self.expires_at = base + Duration::days(days);
        self.updated_at = now;
        Ok(())
    }
}

/// Fields of a new subscription row, derived from a plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubscription {
    pub user_id: UserId,
    pub plan_code: String,
    pub plan_name: String,
    pub daily_quota: i64,
    pub total_quota: i64,
    pub base_group: String,
    pub fallback_group: String,
    pub days: i64,
    pub payment_method: PaymentMethod,
    pub amount_cents: i64,
    pub currency: String,
    pub auto_renew: bool,
}

impl NewSubscription {
    pub fn from_plan(
        user_id: UserId,
        plan: &SubscriptionPlan,
        payment_method: PaymentMethod,
        auto_renew: bool,
    ) -> Self {
        Self {
            user_id,
            plan_code: plan.code.clone(),
            plan_name: plan.name.clone(),
            daily_quota: plan.daily_quota,
            total_quota: plan.total_quota,
            base_group: plan.base_group.clone(),
            fallback_group: plan.fallback_group.clone(),
            days: plan.days,
            payment_method,
            amount_cents: plan.price_cents,
            currency: plan.currency.clone(),
            auto_renew,
        }
    }

    /// Override the duration (internal grants)
    pub fn with_days(mut self, days: i64) -> Self {
        self.days = days;
        self
    }

    /// `(started_at, expires_at)` for a row created at `now`
    pub fn period(&self, now: DateTime<Utc>, current_expires_at: Option<DateTime<Utc>>) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = stacked_start(now, current_expires_at);
        (start, start + Duration::days(self.days.max(1)))
    }
}

/// Install a subscription's daily cap and pricing groups on its user.
///
/// The daily ledger restarts at `now`.
pub fn install_plan(user: &mut User, sub: &Subscription, now: DateTime<Utc>) {
    user.daily_quota = sub.daily_quota;
    user.base_group = sub.base_group.clone();
    user.fallback_group = sub.fallback_group.clone();
    user.daily_used = 0;
    user.last_daily_reset = now.timestamp();
    if !sub.base_group.is_empty() {
        user.group = sub.base_group.clone();
    }
}

/// Credit the one-off quota of a plan; returns the amount credited
pub fn credit_plan_quota(user: &mut User, sub: &Subscription) -> i64 {
    if sub.total_quota <= 0 {
        return 0;
    }
    user.quota = user.quota.saturating_add(sub.total_quota);
    sub.total_quota
}

/// Apply a freshly activated subscription to its user.
///
/// Quota is credited immediately. A subscription stacked behind a running
/// one leaves the current groups alone until the running one lapses.
pub fn apply_activation(user: &mut User, sub: &Subscription, now: DateTime<Utc>) {
    if sub.started_at <= now {
        install_plan(user, sub, now);
    }
    credit_plan_quota(user, sub);
}

/// Release a subscription's entitlements from its user.
///
/// `successor` is another active subscription of the same user that is
/// still running; when present its plan takes over, otherwise the user
/// falls back to the default group.
pub fn release_entitlement(user: &mut User, successor: Option<&Subscription>, now: DateTime<Utc>) {
    match successor {
        Some(next) => install_plan(user, next, now),
        None => reset_user_entitlement(user),
    }
}

/// Drop a user back to the default group with no daily cap
pub fn reset_user_entitlement(user: &mut User) {
    user.daily_quota = 0;
    user.daily_used = 0;
    user.base_group.clear();
    user.fallback_group.clear();
    user.group = DEFAULT_GROUP.to_string();
}
