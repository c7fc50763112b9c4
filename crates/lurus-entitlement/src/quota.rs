//! Daily quota engine
//!
//! Thin layer over the row-locked repository operations: the relay calls
//! [`DailyQuotaEngine::pre_consume`] before charging a request and
//! [`DailyQuotaEngine::post_consume`] afterwards. The reset sweep is driven
//! by the background jobs; the lazy reset inside pre-consume keeps the
//! engine correct while the sweep is down.

use chrono::{DateTime, Utc};
use lurus_db::{DbError, Store, TenantDb};
use lurus_types::{utc_day_start, DailyQuotaInfo, PostConsume, PreConsume, UserId};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::EntitlementError;

/// Pre-consume verdict together with the state it was taken against
#[derive(Debug, Clone, Serialize)]
pub struct QuotaCheck {
    #[serde(flatten)]
    pub outcome: PreConsume,
    pub info: DailyQuotaInfo,
}

fn user_not_found(err: DbError) -> EntitlementError {
    match err {
        DbError::NotFound => EntitlementError::UserNotFound,
        other => other.into(),
    }
}

#[derive(Debug, Clone)]
pub struct DailyQuotaEngine {
    enabled: bool,
}

impl DailyQuotaEngine {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check `delta` against today's cap. A limited user on their base
    /// group is moved to the fallback group in the same lock.
    #[instrument(skip(self, db), fields(tenant_id = ?db.tenant_id()))]
    pub async fn pre_consume(
        &self,
        db: &TenantDb,
        user_id: UserId,
        delta: i64,
        now: DateTime<Utc>,
    ) -> Result<QuotaCheck, EntitlementError> {
        if delta < 0 {
            return Err(EntitlementError::Validation("delta must not be negative".into()));
        }
        if !self.enabled {
            let user = db.find_user(user_id).await?.ok_or(EntitlementError::UserNotFound)?;
            return Ok(QuotaCheck {
                outcome: PreConsume::default(),
                info: user.daily_state().info(now),
            });
        }

        let (outcome, info) = db
            .pre_consume(user_id, delta, now)
            .await
            .map_err(user_not_found)?;

        if outcome.limited {
            metrics::counter!(
                "iam_quota_limited_total",
                "fallback" => if outcome.switched_to_fallback { "switched" } else { "none" }
            )
            .increment(1);
            info!(
                %user_id,
                delta,
                daily_used = info.daily_used,
                daily_quota = info.daily_quota,
                group = %info.group,
                "Daily quota limit reached"
            );
        }
        Ok(QuotaCheck { outcome, info })
    }

    /// Record `amount` as used today
    #[instrument(skip(self, db), fields(tenant_id = ?db.tenant_id()))]
    pub async fn post_consume(
        &self,
        db: &TenantDb,
        user_id: UserId,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<PostConsume, EntitlementError> {
        if amount < 0 {
            return Err(EntitlementError::Validation("amount must not be negative".into()));
        }
        if !self.enabled || amount == 0 {
            return Ok(PostConsume::default());
        }
        let outcome = db
            .post_consume(user_id, amount, now)
            .await
            .map_err(user_not_found)?;
        if outcome.switched_to_fallback {
            info!(%user_id, "Switched to fallback group after consumption");
        }
        Ok(outcome)
    }

    /// Reset every capped user whose last reset predates today (UTC).
    ///
    /// Pulls batches of `batch_size` until a batch comes back short or
    /// resets nothing. Returns the number of users reset.
    pub async fn reset_due(
        &self,
        store: &Store,
        now: DateTime<Utc>,
        batch_size: i64,
    ) -> Result<u64, EntitlementError> {
        if !self.enabled {
            return Ok(0);
        }
        let day_start = utc_day_start(now);
        let db = store.system();
        let mut total = 0u64;

        loop {
            let due = store.users.find_needing_daily_reset(day_start, batch_size).await?;
            let fetched = due.len();
            let mut reset_in_batch = 0u64;
            for user_id in due {
                match db.reset_daily(user_id, now).await {
                    Ok(true) => reset_in_batch += 1,
                    Ok(false) => debug!(%user_id, "Daily quota already reset"),
                    Err(e) => warn!(%user_id, error = %e, "Daily quota reset failed"),
                }
            }
            total += reset_in_batch;
            if (fetched as i64) < batch_size || reset_in_batch == 0 {
                break;
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use lurus_db::CreateUser;
    use lurus_types::{NewSubscription, PaymentMethod, Role, TenantId, DEFAULT_GROUP};

    fn day(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, d, h, 0, 0).unwrap()
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

    async fn capped_user(store: &Store, name: &str, now: DateTime<Utc>) -> UserId {
        let id = user(store, name).await;
        store
            .system()
            .grant_subscription(
                NewSubscription {
                    user_id: id,
                    plan_code: "monthly".into(),
                    plan_name: "Monthly".into(),
                    daily_quota: 1_000,
                    total_quota: 0,
                    base_group: "pro".into(),
                    fallback_group: "lite".into(),
                    days: 30,
                    payment_method: PaymentMethod::Internal,
                    amount_cents: 0,
                    currency: "CNY".into(),
                    auto_renew: false,
                },
                now,
            )
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let store = Store::memory();
        let engine = DailyQuotaEngine::new(true);
        let err = engine
            .pre_consume(&store.system(), UserId(999), 10, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::UserNotFound));
    }

    #[tokio::test]
    async fn uncapped_user_is_never_limited() {
        let store = Store::memory();
        let id = user(&store, "free").await;
        let engine = DailyQuotaEngine::new(true);

        let check = engine
            .pre_consume(&store.system(), id, 1_000_000_000, day(1, 12))
            .await
            .unwrap();
        assert!(!check.outcome.limited);
        assert!(check.info.is_unlimited);
        assert_eq!(engine.reset_due(&store, day(2, 1), 100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn exhausted_cap_falls_back_then_resets_next_day() {
        let store = Store::memory();
        let db = store.system();
        let id = capped_user(&store, "pro", day(1, 8)).await;
        let engine = DailyQuotaEngine::new(true);

        let first = engine.pre_consume(&db, id, 800, day(1, 9)).await.unwrap();
        assert!(!first.outcome.limited);
        engine.post_consume(&db, id, 800, day(1, 9)).await.unwrap();

        let second = engine.pre_consume(&db, id, 300, day(1, 10)).await.unwrap();
        assert!(second.outcome.limited);
        assert!(second.outcome.switched_to_fallback);
        assert_eq!(db.find_user(id).await.unwrap().unwrap().group, "lite");

        // The sweep restores the base group once the UTC date rolls over
        assert_eq!(engine.reset_due(&store, day(2, 0), 100).await.unwrap(), 1);
        let user = db.find_user(id).await.unwrap().unwrap();
        assert_eq!(user.group, "pro");
        assert_eq!(user.daily_used, 0);

        // Same day again is a no-op
        assert_eq!(engine.reset_due(&store, day(2, 6), 100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reset_sweep_walks_every_batch() {
        let store = Store::memory();
        for i in 0..5 {
            capped_user(&store, &format!("u{i}"), day(1, 8)).await;
        }
        let engine = DailyQuotaEngine::new(true);
        assert_eq!(engine.reset_due(&store, day(1, 8) + Duration::days(1), 2).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn disabled_engine_passes_everything() {
        let store = Store::memory();
        let id = capped_user(&store, "off", day(1, 8)).await;
        let engine = DailyQuotaEngine::new(false);
        let check = engine.pre_consume(&store.system(), id, 5_000, day(1, 9)).await.unwrap();
        assert!(!check.outcome.limited);
        let post = engine.post_consume(&store.system(), id, 5_000, day(1, 9)).await.unwrap();
        assert!(!post.switched_to_fallback);
        assert_eq!(engine.reset_due(&store, day(3, 0), 100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn negative_amounts_are_rejected() {
        let store = Store::memory();
        let engine = DailyQuotaEngine::new(true);
        assert!(engine.pre_consume(&store.system(), UserId(1), -1, Utc::now()).await.is_err());
        assert!(engine.post_consume(&store.system(), UserId(1), -1, Utc::now()).await.is_err());
    }
}
