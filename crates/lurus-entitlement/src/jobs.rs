//! Background loops
//!
//! Every loop is a named task that owns a clone of the root
//! [`CancellationToken`] and is tracked by the caller's [`TaskTracker`], so
//! shutdown can wait for in-flight ticks to finish. The subscription and
//! quota loops must run on a single master node; the catalog sync and the
//! verification code purge run everywhere.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lurus_auth_core::VerificationStore;
use lurus_db::Store;
use lurus_types::PENDING_TTL_HOURS;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::JobSettings;
use crate::plans::PlanCatalog;
use crate::quota::DailyQuotaEngine;
use crate::EntitlementError;

/// Run `tick` every `period` after `initial_delay` until `token` fires.
///
/// A tick that overruns its period delays the next one instead of bursting.
/// Tick errors are logged and retried on the next period.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    initial_delay: Duration,
    period: Duration,
    token: CancellationToken,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<u64, EntitlementError>>,
{
    let mut ticker = interval_at(Instant::now() + initial_delay, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(job = name, period_secs = period.as_secs(), "Background job started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match tick().await {
            Ok(processed) => {
                metrics::counter!("iam_job_runs_total", "job" => name, "outcome" => "ok").increment(1);
                if processed > 0 {
                    info!(job = name, processed, "Background job tick");
                } else {
                    debug!(job = name, "Background job tick, nothing to do");
                }
            }
            Err(e) => {
                metrics::counter!("iam_job_runs_total", "job" => name, "outcome" => "error")
                    .increment(1);
                error!(job = name, error = %e, "Background job tick failed");
            }
        }
    }
    info!(job = name, "Background job stopped");
}

/// Counts from one renewal scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenewalScan {
    pub due_for_renewal: u64,
    pub expiring_soon: u64,
}

/// The master-node loops over subscriptions and daily quotas
#[derive(Clone)]
pub struct JobRunner {
    store: Store,
    quota: DailyQuotaEngine,
    settings: JobSettings,
}

impl JobRunner {
    pub fn new(store: Store, quota: DailyQuotaEngine, settings: JobSettings) -> Self {
        Self {
            store,
            quota,
            settings,
        }
    }

    /// Expire overdue active subscriptions, batch by batch
    pub async fn expire_due_subscriptions(&self, now: DateTime<Utc>) -> Result<u64, EntitlementError> {
        let batch = self.settings.batch_size;
        let mut total = 0u64;
        loop {
            let expired = self.store.subscriptions.expire_due(now, batch).await?;
            for id in &expired {
                info!(subscription_id = %id, "Subscription expired");
            }
            total += expired.len() as u64;
            if (expired.len() as i64) < batch {
                break;
            }
        }
        Ok(total)
    }

    /// Expire unpaid orders past the payment window
    pub async fn sweep_stale_pending(&self, now: DateTime<Utc>) -> Result<u64, EntitlementError> {
        let cutoff = now - chrono::Duration::hours(PENDING_TTL_HOURS);
        Ok(self.store.subscriptions.expire_stale_pending(cutoff, now).await?)
    }

    /// Log auto-renew candidates and upcoming expiries.
    ///
    /// Charging the renewal is left to the gateway integration; the scan
    /// only reports.
    pub async fn scan_renewals(&self, now: DateTime<Utc>) -> Result<RenewalScan, EntitlementError> {
        let batch = self.settings.batch_size;
        let subs = &self.store.subscriptions;

        let due = subs
            .find_expiring(now, now + self.settings.renewal_window, true, batch)
            .await?;
        for sub in &due {
            info!(
                subscription_id = %sub.id,
                user_id = %sub.user_id,
                plan = %sub.plan_code,
                expires_at = %sub.expires_at,
                "Subscription needs renewal"
            );
        }

        let expiring = subs
            .find_expiring(now, now + self.settings.warning_window, false, batch)
            .await?;
        for sub in &expiring {
            warn!(
                subscription_id = %sub.id,
                user_id = %sub.user_id,
                days_remaining = sub.days_remaining(now),
                auto_renew = sub.auto_renew,
                "Subscription expiring soon"
            );
        }

        Ok(RenewalScan {
            due_for_renewal: due.len() as u64,
            expiring_soon: expiring.len() as u64,
        })
    }

    pub async fn reset_daily_quotas(&self, now: DateTime<Utc>) -> Result<u64, EntitlementError> {
        self.quota
            .reset_due(&self.store, now, self.settings.batch_size)
            .await
    }

    /// Start every master-node loop on `tracker`
    pub fn spawn_all(&self, token: &CancellationToken, tracker: &TaskTracker) {
        let s = &self.settings;

        let runner = self.clone();
        tracker.spawn(run_periodic(
            "subscription_expiry",
            Duration::ZERO,
            s.expiry_interval,
            token.clone(),
            move || {
                let runner = runner.clone();
                async move { runner.expire_due_subscriptions(Utc::now()).await }
            },
        ));

        let runner = self.clone();
        tracker.spawn(run_periodic(
            "stale_pending_sweep",
            s.stale_pending_delay,
            s.stale_pending_interval,
            token.clone(),
            move || {
                let runner = runner.clone();
                async move { runner.sweep_stale_pending(Utc::now()).await }
            },
        ));

        let runner = self.clone();
        tracker.spawn(run_periodic(
            "renewal_scan",
            s.renewal_delay,
            s.renewal_interval,
            token.clone(),
            move || {
                let runner = runner.clone();
                async move {
                    let scan = runner.scan_renewals(Utc::now()).await?;
                    Ok(scan.due_for_renewal)
                }
            },
        ));

        if self.quota.is_enabled() {
            let runner = self.clone();
            tracker.spawn(run_periodic(
                "daily_quota_reset",
                Duration::ZERO,
                s.daily_reset_interval,
                token.clone(),
                move || {
                    let runner = runner.clone();
                    async move { runner.reset_daily_quotas(Utc::now()).await }
                },
            ));
        }
    }
}

/// Keep the plan catalog in step with its option row
pub fn spawn_catalog_sync(
    plans: Arc<PlanCatalog>,
    period: Duration,
    token: &CancellationToken,
    tracker: &TaskTracker,
) {
    tracker.spawn(run_periodic("plan_catalog_sync", period, period, token.clone(), move || {
        let plans = plans.clone();
        async move {
            plans.refresh().await?;
            Ok(0)
        }
    }));
}

/// Drop expired verification codes every `period`; runs on every node
/// since each holds its own codes
pub fn spawn_code_purge(
    codes: Arc<VerificationStore>,
    period: Duration,
    token: &CancellationToken,
    tracker: &TaskTracker,
) {
    tracker.spawn(run_periodic("verification_code_purge", period, period, token.clone(), move || {
        let codes = codes.clone();
        async move { Ok(codes.purge_expired(Utc::now()) as u64) }
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lurus_auth_core::CodePurpose;
    use lurus_db::CreateUser;
    use lurus_types::{
        NewSubscription, PaymentMethod, Role, SubscriptionStatus, TenantId, UserId, DEFAULT_GROUP,
    };
    use std::sync::atomic::{AtomicU64, Ordering};

    fn at(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, d, 12, 0, 0).unwrap()
    }

    fn runner(store: &Store, batch_size: i64) -> JobRunner {
        JobRunner::new(
            store.clone(),
            DailyQuotaEngine::new(true),
            JobSettings {
                batch_size,
                ..JobSettings::default()
            },
        )
    }

    async fn user(store: &Store, name: &str) -> UserId {
        store
            .for_tenant(TenantId::default_tenant())
            .create_user(CreateUser {
                tenant_id: TenantId::default_tenant(),
                username: name.into(),
                password_hash: None,
                display_name: name.into(),
                email: String::new(),
                phone: String::new(),
                phone_verified: false,
                role: Role::Common,
                group: DEFAULT_GROUP.into(),
                quota: 0,
                aff_code: String::new(),
            })
            .await
            .unwrap()
            .id
    }

    fn plan(user_id: UserId, days: i64, auto_renew: bool) -> NewSubscription {
        NewSubscription {
            user_id,
            plan_code: "weekly".into(),
            plan_name: "Weekly".into(),
            daily_quota: 500,
            total_quota: 0,
            base_group: "weekly".into(),
            fallback_group: "free".into(),
            days,
            payment_method: PaymentMethod::Internal,
            amount_cents: 0,
            currency: "CNY".into(),
            auto_renew,
        }
    }

    #[tokio::test]
    async fn expiry_walks_every_batch_and_resets_users() {
        let store = Store::memory();
        let db = store.system();
        let mut users = Vec::new();
        for i in 0..5 {
            let id = user(&store, &format!("u{i}")).await;
            db.grant_subscription(plan(id, 1, false), at(1)).await.unwrap();
            users.push(id);
        }

        let expired = runner(&store, 2).expire_due_subscriptions(at(3)).await.unwrap();
        assert_eq!(expired, 5);
        for id in users {
            let u = db.find_user(id).await.unwrap().unwrap();
            assert_eq!(u.group, DEFAULT_GROUP);
            assert_eq!(u.daily_quota, 0);
        }
        assert_eq!(runner(&store, 2).expire_due_subscriptions(at(3)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_pending_orders_are_swept() {
        let store = Store::memory();
        let db = store.system();
        let id = user(&store, "pending").await;
        let mut order = plan(id, 7, false);
        order.payment_method = PaymentMethod::Stripe;
        let sub = db.create_pending_subscription(order, at(1)).await.unwrap();

        let jobs = runner(&store, 100);
        assert_eq!(jobs.sweep_stale_pending(at(1)).await.unwrap(), 0);
        assert_eq!(jobs.sweep_stale_pending(at(3)).await.unwrap(), 1);
        let swept = db.find_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(swept.status, SubscriptionStatus::Expired);
    }

    #[tokio::test]
    async fn renewal_scan_separates_auto_renew_from_warnings() {
        let store = Store::memory();
        let db = store.system();
        let renewing = user(&store, "renewing").await;
        let lapsing = user(&store, "lapsing").await;
        let later = user(&store, "later").await;
        db.grant_subscription(plan(renewing, 1, true), at(1)).await.unwrap();
        db.grant_subscription(plan(lapsing, 2, false), at(1)).await.unwrap();
        db.grant_subscription(plan(later, 30, true), at(1)).await.unwrap();

        let scan = runner(&store, 100).scan_renewals(at(1)).await.unwrap();
        assert_eq!(
            scan,
            RenewalScan {
                due_for_renewal: 1,
                expiring_soon: 2,
            }
        );
    }

    #[tokio::test]
    async fn periodic_loop_stops_on_cancel() {
        let token = CancellationToken::new();
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = ticks.clone();

        let handle = tokio::spawn(run_periodic(
            "test",
            Duration::ZERO,
            Duration::from_millis(10),
            token.clone(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(EntitlementError::Database("flaky".into()))
                }
            },
        ));

        tokio::time::sleep(Duration::from_millis(55)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop exits after cancel")
            .unwrap();
        // Errors do not stop the loop
        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn code_purge_loop_drops_expired_codes() {
        let codes = Arc::new(VerificationStore::new(
            Duration::from_secs(600),
            Duration::from_secs(60),
            10,
            100,
        ));
        let stale = Utc::now() - chrono::Duration::minutes(30);
        codes.store(CodePurpose::Login, "13800138000", "123456".into(), stale);
        codes.store(CodePurpose::PasswordReset, "amy@example.com", "654321".into(), Utc::now());

        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        spawn_code_purge(codes.clone(), Duration::from_millis(10), &token, &tracker);
        tracker.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), tracker.wait())
            .await
            .expect("purge loop stops");

        assert_eq!(codes.len(), 1);
        assert!(codes.verify(CodePurpose::PasswordReset, "amy@example.com", "654321", Utc::now()));
    }

    #[tokio::test]
    async fn tracked_jobs_drain_on_shutdown() {
        let store = Store::memory();
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        runner(&store, 100).spawn_all(&token, &tracker);
        spawn_catalog_sync(
            Arc::new(PlanCatalog::new(store.options.clone())),
            Duration::from_secs(60),
            &token,
            &tracker,
        );
        spawn_code_purge(
            Arc::new(VerificationStore::new(
                Duration::from_secs(600),
                Duration::from_secs(60),
                10,
                100,
            )),
            Duration::from_secs(60),
            &token,
            &tracker,
        );
        tracker.close();

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), tracker.wait())
            .await
            .expect("all loops stop");
    }
}
