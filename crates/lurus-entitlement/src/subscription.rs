//! Subscription service
//!
//! Drives the subscription state machine: order creation, hosted checkout,
//! payment confirmation from the gateways, internal grants, renewal,
//! cancellation and refund.
//!
//! Payment confirmation is idempotent. A redelivered webhook for an order
//! that is already active is a logged no-op, so gateways may retry freely.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use lurus_db::{DbError, PaymentConfirmation, Store, TenantDb};
use lurus_types::{
    amount_within_tolerance, DailyQuotaInfo, NewSubscription, PaymentMethod, PaymentTransition,
    Role, Subscription, SubscriptionId, SubscriptionPlan, SubscriptionStatus, UserId,
};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::EntitlementConfig;
use crate::plans::PlanCatalog;
use crate::provider::{Checkout, PaymentProviders};
use crate::retry::with_retry;
use crate::webhook::PaymentEvent;
use crate::EntitlementError;

const DEFAULT_HISTORY_LIMIT: i64 = 10;
const MAX_HISTORY_LIMIT: i64 = 100;

fn subscription_not_found(err: DbError) -> EntitlementError {
    match err {
        DbError::NotFound => EntitlementError::SubscriptionNotFound,
        other => other.into(),
    }
}

/// The user's running subscription and today's quota state
#[derive(Debug, Clone, Serialize)]
pub struct CurrentSubscription {
    pub subscription: Option<Subscription>,
    pub days_remaining: i64,
    pub daily_quota: DailyQuotaInfo,
}

/// Payment progress of one order
#[derive(Debug, Clone, Serialize)]
pub struct PaymentStatus {
    pub subscription_id: SubscriptionId,
    pub status: SubscriptionStatus,
    pub payment_method: String,
    pub payment_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Subscription> for PaymentStatus {
    fn from(sub: &Subscription) -> Self {
        Self {
            subscription_id: sub.id,
            status: sub.status,
            payment_method: sub.payment_method.clone(),
            payment_id: sub.payment_id.clone(),
            amount: sub.amount_cents,
            currency: sub.currency.clone(),
            created_at: sub.created_at,
        }
    }
}

/// What a gateway notification did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Activated(SubscriptionId),
    Duplicate(SubscriptionId),
    Refunded(SubscriptionId),
    Ignored,
}

impl WebhookOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Activated(_) => "activated",
            Self::Duplicate(_) => "duplicate",
            Self::Refunded(_) => "refunded",
            Self::Ignored => "ignored",
        }
    }
}

/// Subscription orders, payments and grants
#[derive(Clone)]
pub struct SubscriptionService {
    store: Store,
    plans: Arc<PlanCatalog>,
    providers: PaymentProviders,
    config: Arc<EntitlementConfig>,
}

impl SubscriptionService {
    pub fn new(
        store: Store,
        plans: Arc<PlanCatalog>,
        providers: PaymentProviders,
        config: Arc<EntitlementConfig>,
    ) -> Self {
        Self {
            store,
            plans,
            providers,
            config,
        }
    }

    pub fn plan_catalog(&self) -> &Arc<PlanCatalog> {
        &self.plans
    }

    /// Plans open for purchase
    pub async fn plans(&self) -> Vec<SubscriptionPlan> {
        self.plans.enabled().await
    }

    pub async fn current(
        &self,
        db: &TenantDb,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<CurrentSubscription, EntitlementError> {
        let user = db
            .find_user(user_id)
            .await?
            .ok_or(EntitlementError::UserNotFound)?;
        let running = db.active_subscriptions(user_id, now).await?;
        // Stacked rows start later; prefer the one in effect right now
        let subscription = running
            .iter()
            .find(|s| s.is_in_effect(now))
            .or_else(|| running.first())
            .cloned();
        let days_remaining = subscription
            .as_ref()
            .map(|s| s.days_remaining(now))
            .unwrap_or(0);
        Ok(CurrentSubscription {
            subscription,
            days_remaining,
            daily_quota: user.daily_state().info(now),
        })
    }

    /// Most recent orders first; `limit` defaults to 10 and is capped at 100
    pub async fn history(
        &self,
        db: &TenantDb,
        user_id: UserId,
        limit: Option<i64>,
    ) -> Result<Vec<Subscription>, EntitlementError> {
        let limit = limit
            .filter(|l| *l > 0)
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .min(MAX_HISTORY_LIMIT);
        Ok(db.list_subscriptions(user_id, limit).await?)
    }

    /// Open a pending order for `plan_code`
    #[instrument(skip(self, db), fields(tenant_id = ?db.tenant_id()))]
    pub async fn create(
        &self,
        db: &TenantDb,
        user_id: UserId,
        plan_code: &str,
        payment_method: &str,
        auto_renew: bool,
        now: DateTime<Utc>,
    ) -> Result<Subscription, EntitlementError> {
        let method = PaymentMethod::parse_gateway(payment_method).ok_or_else(|| {
            EntitlementError::Validation(
                "Invalid payment method. Supported: stripe, creem, epay".into(),
            )
        })?;
        if !self.providers.is_enabled(method) {
            return Err(EntitlementError::GatewayDisabled(method.as_str()));
        }
        let plan = self.plans.find_purchasable(plan_code).await?;

        let user = db
            .find_user(user_id)
            .await?
            .ok_or(EntitlementError::UserNotFound)?;
        if !user.is_enabled() {
            return Err(EntitlementError::UserDisabled);
        }

        let sub = db
            .create_pending_subscription(NewSubscription::from_plan(user_id, &plan, method, auto_renew), now)
            .await
            .map_err(|e| match e {
                DbError::Conflict(_) => EntitlementError::Conflict(
                    "A pending order already exists, pay or cancel it first".into(),
                ),
                other => other.into(),
            })?;

        info!(
            subscription_id = %sub.id,
            %user_id,
            plan = %sub.plan_code,
            method = %method,
            started_at = %sub.started_at,
            "Subscription order created"
        );
        Ok(sub)
    }

    /// Start the hosted checkout for a pending order
    pub async fn initiate_payment(
        &self,
        db: &TenantDb,
        user_id: UserId,
        subscription_id: SubscriptionId,
        now: DateTime<Utc>,
    ) -> Result<Checkout, EntitlementError> {
        self.checkout(db, user_id, subscription_id, now, "pay").await
    }

    /// Re-open checkout for an order whose first attempt was abandoned
    pub async fn retry_payment(
        &self,
        db: &TenantDb,
        user_id: UserId,
        subscription_id: SubscriptionId,
        now: DateTime<Utc>,
    ) -> Result<Checkout, EntitlementError> {
        self.checkout(db, user_id, subscription_id, now, "retry").await
    }

    #[instrument(skip(self, db), fields(tenant_id = ?db.tenant_id()))]
    async fn checkout(
        &self,
        db: &TenantDb,
        user_id: UserId,
        subscription_id: SubscriptionId,
        now: DateTime<Utc>,
        attempt: &'static str,
    ) -> Result<Checkout, EntitlementError> {
        let sub = db
            .find_subscription(subscription_id)
            .await?
            .filter(|s| s.user_id == user_id)
            .ok_or(EntitlementError::SubscriptionNotFound)?;

        if sub.status != SubscriptionStatus::Pending {
            return Err(EntitlementError::InvalidState(format!(
                "Subscription is {}, not pending payment",
                sub.status
            )));
        }
        if sub.is_stale(now) {
            db.expire_pending_subscription(sub.id, now)
                .await
                .map_err(subscription_not_found)?;
            info!(subscription_id = %sub.id, "Stale order expired on checkout");
            return Err(EntitlementError::InvalidState(
                "Subscription order has expired, please create a new one".into(),
            ));
        }

        let method = PaymentMethod::parse_gateway(&sub.payment_method).ok_or_else(|| {
            EntitlementError::InvalidState(format!(
                "order has no gateway payment method: {}",
                sub.payment_method
            ))
        })?;
        let provider = self.providers.get(method)?;
        let email = db
            .find_user(user_id)
            .await?
            .map(|u| u.email)
            .unwrap_or_default();

        let checkout = with_retry(&self.config.retry, "create_checkout", || {
            provider.create_checkout(&sub, &email)
        })
        .await?;

        db.attach_payment(sub.id, user_id, &checkout.payment_id, method, now)
            .await
            .map_err(subscription_not_found)?;

        info!(
            subscription_id = %sub.id,
            %user_id,
            method = %method,
            attempt,
            "Checkout created"
        );
        Ok(checkout)
    }

    /// Payment progress, visible to the owner and to admins
    pub async fn payment_status(
        &self,
        db: &TenantDb,
        subscription_id: SubscriptionId,
        requester: UserId,
        role: Role,
    ) -> Result<PaymentStatus, EntitlementError> {
        let sub = db
            .find_subscription(subscription_id)
            .await?
            .ok_or(EntitlementError::SubscriptionNotFound)?;
        if sub.user_id != requester && !role.is_admin() {
            return Err(EntitlementError::SubscriptionNotFound);
        }
        Ok(PaymentStatus::from(&sub))
    }

    /// Cancel the caller's own order or subscription
    #[instrument(skip(self, db), fields(tenant_id = ?db.tenant_id()))]
    pub async fn cancel(
        &self,
        db: &TenantDb,
        user_id: UserId,
        subscription_id: SubscriptionId,
        now: DateTime<Utc>,
    ) -> Result<Subscription, EntitlementError> {
        let sub = db
            .cancel_subscription(subscription_id, Some(user_id), now)
            .await
            .map_err(subscription_not_found)?;
        info!(subscription_id = %sub.id, %user_id, "Subscription cancelled");
        Ok(sub)
    }

    /// Confirm a gateway payment for `subscription_id`.
    ///
    /// An amount outside the tolerance band is recorded but does not block
    /// activation; gateway fees and exchange rates move it legitimately.
    #[instrument(skip(self))]
    pub async fn process_payment(
        &self,
        subscription_id: SubscriptionId,
        payment_id: &str,
        method: PaymentMethod,
        amount_paid_cents: i64,
        now: DateTime<Utc>,
    ) -> Result<(Subscription, PaymentTransition), EntitlementError> {
        let db = self.store.system();
        let sub = db
            .find_subscription(subscription_id)
            .await?
            .ok_or(EntitlementError::SubscriptionNotFound)?;

        // A gateway only settles orders placed through it
        if sub.payment_method != method.as_str() {
            warn!(
                %subscription_id,
                payment_id,
                ordered_with = %sub.payment_method,
                notified_by = %method,
                "Payment notice from a different gateway"
            );
            return Err(EntitlementError::InvalidState(format!(
                "subscription was not ordered through {method}"
            )));
        }

        match sub.status {
            SubscriptionStatus::Active => {
                warn!(%subscription_id, payment_id, "Payment already processed");
                return Ok((sub, PaymentTransition::AlreadyActive));
            }
            SubscriptionStatus::Pending => {}
            other => {
                return Err(EntitlementError::InvalidState(format!(
                    "cannot confirm payment for a {other} subscription"
                )))
            }
        }

        if amount_paid_cents > 0 && !amount_within_tolerance(sub.amount_cents, amount_paid_cents) {
            metrics::counter!("iam_payment_amount_mismatch_total", "gateway" => method.as_str())
                .increment(1);
            warn!(
                %subscription_id,
                payment_id,
                expected = sub.amount_cents,
                paid = amount_paid_cents,
                "Payment amount mismatch"
            );
        }

        let (sub, transition) = with_retry(&self.config.retry, "confirm_payment", || {
            db.confirm_payment(
                subscription_id,
                PaymentConfirmation {
                    payment_id: payment_id.to_string(),
                    method,
                    now,
                },
            )
        })
        .await
        .map_err(subscription_not_found)?;

        match transition {
            PaymentTransition::Activated => info!(
                %subscription_id,
                user_id = %sub.user_id,
                plan = %sub.plan_code,
                method = %method,
                expires_at = %sub.expires_at,
                "Subscription activated"
            ),
            PaymentTransition::AlreadyActive => {
                warn!(%subscription_id, payment_id, "Payment already processed")
            }
        }
        Ok((sub, transition))
    }

    /// Apply a verified gateway notification
    pub async fn handle_event(
        &self,
        gateway: PaymentMethod,
        event: PaymentEvent,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, EntitlementError> {
        let kind = event.kind();
        let result = self.apply_event(event, now).await;
        let outcome = match &result {
            Ok(outcome) => outcome.label(),
            Err(_) => "error",
        };
        metrics::counter!(
            "iam_webhook_events_total",
            "gateway" => gateway.as_str(),
            "outcome" => outcome
        )
        .increment(1);
        debug!(gateway = %gateway, kind, outcome, "Webhook event handled");
        result
    }

    async fn apply_event(
        &self,
        event: PaymentEvent,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, EntitlementError> {
        match event {
            PaymentEvent::Paid(notice) => {
                let (sub, transition) = self
                    .process_payment(
                        notice.subscription_id,
                        &notice.payment_id,
                        notice.method,
                        notice.amount_cents,
                        now,
                    )
                    .await?;
                Ok(match transition {
                    PaymentTransition::Activated => WebhookOutcome::Activated(sub.id),
                    PaymentTransition::AlreadyActive => WebhookOutcome::Duplicate(sub.id),
                })
            }
            PaymentEvent::PaidByReference { method, payment_id } => {
                let sub = self
                    .store
                    .system()
                    .find_subscription_by_payment_id(&payment_id)
                    .await?
                    .ok_or(EntitlementError::SubscriptionNotFound)?;
                let (sub, transition) = self
                    .process_payment(sub.id, &payment_id, method, 0, now)
                    .await?;
                Ok(match transition {
                    PaymentTransition::Activated => WebhookOutcome::Activated(sub.id),
                    PaymentTransition::AlreadyActive => WebhookOutcome::Duplicate(sub.id),
                })
            }
            PaymentEvent::Refunded { payment_id, .. } => {
                let sub = self.refund(&payment_id, now).await?;
                Ok(WebhookOutcome::Refunded(sub.id))
            }
            PaymentEvent::CheckoutExpired { subscription_id } => {
                info!(subscription_id = ?subscription_id, "Checkout expired, order stays pending");
                Ok(WebhookOutcome::Ignored)
            }
            PaymentEvent::Ignored { reason } => {
                debug!(reason, "Webhook event ignored");
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    /// Hand out an already-active subscription without payment
    #[instrument(skip(self, db), fields(tenant_id = ?db.tenant_id()))]
    pub async fn grant(
        &self,
        db: &TenantDb,
        user_id: UserId,
        plan_code: &str,
        days: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Subscription, EntitlementError> {
        if days <= 0 {
            return Err(EntitlementError::Validation("days must be positive".into()));
        }
        let plan = self
            .plans
            .find(plan_code)
            .await
            .ok_or_else(|| EntitlementError::PlanNotFound(plan_code.to_string()))?;

        let mut new_sub =
            NewSubscription::from_plan(user_id, &plan, PaymentMethod::Internal, false).with_days(days);
        new_sub.amount_cents = 0;

        let sub = db.grant_subscription(new_sub, now).await.map_err(|e| match e {
            DbError::NotFound => EntitlementError::UserNotFound,
            other => other.into(),
        })?;
        info!(
            subscription_id = %sub.id,
            %user_id,
            plan = %sub.plan_code,
            days,
            reason,
            started_at = %sub.started_at,
            "Subscription granted"
        );
        Ok(sub)
    }

    /// Extend an active subscription by `days`
    pub async fn renew(
        &self,
        db: &TenantDb,
        subscription_id: SubscriptionId,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<Subscription, EntitlementError> {
        if days <= 0 {
            return Err(EntitlementError::Validation("days must be positive".into()));
        }
        let sub = db
            .renew_subscription(subscription_id, days, now)
            .await
            .map_err(subscription_not_found)?;
        info!(%subscription_id, days, expires_at = %sub.expires_at, "Subscription renewed");
        Ok(sub)
    }

    /// Refund the subscription paid with `payment_id`; repeat calls are
    /// no-ops
    pub async fn refund(
        &self,
        payment_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Subscription, EntitlementError> {
        let sub = self
            .store
            .system()
            .refund_by_payment_id(payment_id, now)
            .await
            .map_err(subscription_not_found)?;
        warn!(
            subscription_id = %sub.id,
            user_id = %sub.user_id,
            payment_id,
            clawback = sub.total_quota,
            "Subscription refunded"
        );
        Ok(sub)
    }
}
