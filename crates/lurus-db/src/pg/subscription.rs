//! PostgreSQL subscription repository implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lurus_types::{
    apply_activation, release_entitlement, NewSubscription, PaymentMethod, PaymentTransition,
    Subscription, SubscriptionId, SubscriptionStatus, TenantId, User, UserId,
};
use sqlx::{PgConnection, PgPool};

use super::{insert_log, lock_user, write_ledger};
use crate::error::{DbError, DbResult};
use crate::models::{LogKind, SubscriptionRow, SUBSCRIPTION_COLUMNS};
use crate::repo::{PaymentConfirmation, SubscriptionRepository};
use crate::scope::TenantScope;

/// PostgreSQL subscription repository
#[derive(Clone)]
pub struct PgSubscriptionRepository {
    pool: PgPool,
}

impl PgSubscriptionRepository {
    /// Create a new subscription repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Owner of a subscription, read without locking so that the user row
    /// can be locked first
    async fn owner_of(
        &self,
        scope: &TenantScope,
        column: &str,
        value: SubscriptionKey<'_>,
    ) -> DbResult<Option<(String, i64)>> {
        let sql = format!(
            "SELECT tenant_id, user_id FROM subscriptions \
             WHERE {column} = $1 AND ($2::text IS NULL OR tenant_id = $2)"
        );
        let query = sqlx::query_as::<_, (String, i64)>(&sql);
        let query = match value {
            SubscriptionKey::Id(id) => query.bind(id),
            SubscriptionKey::PaymentId(pid) => query.bind(pid),
        };
        Ok(query.bind(scope.filter()).fetch_optional(&self.pool).await?)
    }
}

enum SubscriptionKey<'a> {
    Id(i64),
    PaymentId(&'a str),
}

async fn lock_subscription(
    conn: &mut PgConnection,
    scope: &TenantScope,
    id: SubscriptionId,
) -> DbResult<Option<Subscription>> {
    let sql = format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
         WHERE id = $1 AND ($2::text IS NULL OR tenant_id = $2) FOR UPDATE"
    );
    let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
        .bind(id.0)
        .bind(scope.filter())
        .fetch_optional(&mut *conn)
        .await?;

    Ok(row.map(Subscription::from))
}

async fn store_subscription(conn: &mut PgConnection, sub: &Subscription) -> DbResult<()> {
    sqlx::query(
        r#"
        UPDATE subscriptions
        SET status = $2, started_at = $3, expires_at = $4, payment_id = $5,
            payment_method = $6, auto_renew = $7, updated_at = $8
        WHERE id = $1
        "#,
    )
    .bind(sub.id.0)
    .bind(sub.status.as_str())
    .bind(sub.started_at)
    .bind(sub.expires_at)
    .bind(&sub.payment_id)
    .bind(&sub.payment_method)
    .bind(sub.auto_renew)
    .bind(sub.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| DbError::from_unique(e, "payment"))?;

    Ok(())
}

/// Latest expiry among the user's running subscriptions
async fn current_expiry(
    conn: &mut PgConnection,
    user_id: UserId,
    now: DateTime<Utc>,
) -> DbResult<Option<DateTime<Utc>>> {
    let (expiry,): (Option<DateTime<Utc>>,) = sqlx::query_as(
        "SELECT MAX(expires_at) FROM subscriptions \
         WHERE user_id = $1 AND status = 'active' AND expires_at > $2",
    )
    .bind(user_id.0)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Ok(expiry)
}

/// Hand the user's entitlements to the next running subscription, or reset
/// them when there is none
async fn release_user(
    conn: &mut PgConnection,
    user: &mut User,
    released: SubscriptionId,
    now: DateTime<Utc>,
) -> DbResult<()> {
    let sql = format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
         WHERE user_id = $1 AND id <> $2 AND status = 'active' AND expires_at > $3 \
         ORDER BY started_at LIMIT 1"
    );
    let successor = sqlx::query_as::<_, SubscriptionRow>(&sql)
        .bind(user.id.0)
        .bind(released.0)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?
        .map(Subscription::from);

    release_entitlement(user, successor.as_ref(), now);
    Ok(())
}

async fn insert_subscription(
    conn: &mut PgConnection,
    tenant_id: &TenantId,
    sub: &NewSubscription,
    status: SubscriptionStatus,
    period: (DateTime<Utc>, DateTime<Utc>),
    now: DateTime<Utc>,
) -> DbResult<Subscription> {
    let sql = format!(
        "INSERT INTO subscriptions (tenant_id, user_id, plan_code, plan_name, status, \
             daily_quota, total_quota, base_group, fallback_group, started_at, expires_at, \
             payment_method, amount_cents, currency, auto_renew, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $16) \
         RETURNING {SUBSCRIPTION_COLUMNS}"
    );
    let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
        .bind(tenant_id.as_str())
        .bind(sub.user_id.0)
        .bind(&sub.plan_code)
        .bind(&sub.plan_name)
        .bind(status.as_str())
        .bind(sub.daily_quota)
        .bind(sub.total_quota)
        .bind(&sub.base_group)
        .bind(&sub.fallback_group)
        .bind(period.0)
        .bind(period.1)
        .bind(sub.payment_method.as_str())
        .bind(sub.amount_cents)
        .bind(&sub.currency)
        .bind(sub.auto_renew)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;

    Ok(row.into())
}

#[async_trait]
impl SubscriptionRepository for PgSubscriptionRepository {
    async fn find_by_id(
        &self,
        scope: &TenantScope,
        id: SubscriptionId,
    ) -> DbResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE id = $1 AND ($2::text IS NULL OR tenant_id = $2)"
        );
        let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(id.0)
            .bind(scope.filter())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Subscription::from))
    }

    async fn find_by_payment_id(
        &self,
        scope: &TenantScope,
        payment_id: &str,
    ) -> DbResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE payment_id = $1 AND ($2::text IS NULL OR tenant_id = $2)"
        );
        let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(payment_id)
            .bind(scope.filter())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Subscription::from))
    }

    async fn list_by_user(
        &self,
        scope: &TenantScope,
        user_id: UserId,
        limit: i64,
    ) -> DbResult<Vec<Subscription>> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE user_id = $1 AND ($2::text IS NULL OR tenant_id = $2) \
             ORDER BY created_at DESC, id DESC LIMIT $3"
        );
        let rows = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(user_id.0)
            .bind(scope.filter())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Subscription::from).collect())
    }

    async fn list_active(
        &self,
        scope: &TenantScope,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<Subscription>> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE user_id = $1 AND ($2::text IS NULL OR tenant_id = $2) \
               AND status = 'active' AND expires_at > $3 \
             ORDER BY started_at"
        );
        let rows = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(user_id.0)
            .bind(scope.filter())
            .bind(now)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Subscription::from).collect())
    }

    async fn create_pending(
        &self,
        tenant_id: &TenantId,
        sub: NewSubscription,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription> {
        let scope = TenantScope::Tenant(tenant_id.clone());
        let mut tx = self.pool.begin().await?;

        lock_user(&mut tx, &scope, sub.user_id)
            .await?
            .ok_or(DbError::NotFound)?;

        let pending: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM subscriptions WHERE user_id = $1 AND status = 'pending' \
             LIMIT 1 FOR UPDATE",
        )
        .bind(sub.user_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        if pending.is_some() {
            return Err(DbError::Conflict(
                "a pending subscription already exists".to_string(),
            ));
        }

        let running_until = current_expiry(&mut tx, sub.user_id, now).await?;
        let period = sub.period(now, running_until);
        let created =
            insert_subscription(&mut tx, tenant_id, &sub, SubscriptionStatus::Pending, period, now)
                .await?;

        tx.commit().await?;
        Ok(created)
    }

    async fn confirm_payment(
        &self,
        scope: &TenantScope,
        id: SubscriptionId,
        payment: PaymentConfirmation,
    ) -> DbResult<(Subscription, PaymentTransition)> {
        let (tenant, user_id) = self
            .owner_of(scope, "id", SubscriptionKey::Id(id.0))
            .await?
            .ok_or(DbError::NotFound)?;

        let mut tx = self.pool.begin().await?;
        let owner_scope = TenantScope::Tenant(TenantId(tenant));
        let mut user = lock_user(&mut tx, &owner_scope, UserId(user_id))
            .await?
            .ok_or(DbError::NotFound)?;
        let mut sub = lock_subscription(&mut tx, scope, id)
            .await?
            .ok_or(DbError::NotFound)?;

        let transition = sub.confirm_payment(&payment.payment_id, payment.method, payment.now)?;
        if transition == PaymentTransition::AlreadyActive {
            tx.commit().await?;
            return Ok((sub, transition));
        }
        store_subscription(&mut tx, &sub).await?;

        apply_activation(&mut user, &sub, payment.now);
        write_ledger(&mut tx, &user).await?;
        insert_log(
            &mut tx,
            &sub.tenant_id,
            sub.user_id,
            LogKind::Subscription,
            sub.total_quota.max(0),
            &format!(
                "activated plan {} via {} ({})",
                sub.plan_code, payment.method, payment.payment_id
            ),
        )
        .await?;

        tx.commit().await?;
        Ok((sub, transition))
    }

    async fn attach_payment(
        &self,
        scope: &TenantScope,
        id: SubscriptionId,
        owner: UserId,
        payment_id: &str,
        method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription> {
        let mut tx = self.pool.begin().await?;

        let mut sub = lock_subscription(&mut tx, scope, id)
            .await?
            .filter(|s| s.user_id == owner)
            .ok_or(DbError::NotFound)?;
        sub.attach_payment(payment_id, method, now)?;
        store_subscription(&mut tx, &sub).await?;

        tx.commit().await?;
        Ok(sub)
    }

    async fn expire_pending(
        &self,
        scope: &TenantScope,
        id: SubscriptionId,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription> {
        let mut tx = self.pool.begin().await?;

        let mut sub = lock_subscription(&mut tx, scope, id)
            .await?
            .ok_or(DbError::NotFound)?;
        if sub.status != SubscriptionStatus::Pending {
            return Err(DbError::InvalidState(format!(
                "cannot expire a {} subscription",
                sub.status
            )));
        }
        sub.expire(now)?;
        store_subscription(&mut tx, &sub).await?;

        tx.commit().await?;
        Ok(sub)
    }

    async fn grant(
        &self,
        tenant_id: &TenantId,
        sub: NewSubscription,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription> {
        let scope = TenantScope::Tenant(tenant_id.clone());
        let mut tx = self.pool.begin().await?;

        let mut user = lock_user(&mut tx, &scope, sub.user_id)
            .await?
            .ok_or(DbError::NotFound)?;
        let running_until = current_expiry(&mut tx, sub.user_id, now).await?;
        let period = sub.period(now, running_until);
        let created =
            insert_subscription(&mut tx, tenant_id, &sub, SubscriptionStatus::Active, period, now)
                .await?;

        apply_activation(&mut user, &created, now);
        write_ledger(&mut tx, &user).await?;
        insert_log(
            &mut tx,
            tenant_id,
            sub.user_id,
            LogKind::Subscription,
            created.total_quota.max(0),
            &format!("granted plan {} for {} days", created.plan_code, sub.days),
        )
        .await?;

        tx.commit().await?;
        Ok(created)
    }

    async fn expire_due(&self, now: DateTime<Utc>, limit: i64) -> DbResult<Vec<SubscriptionId>> {
        let due: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT id, user_id FROM subscriptions \
             WHERE status = 'active' AND expires_at < $1 ORDER BY expires_at LIMIT $2",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut expired = Vec::with_capacity(due.len());
        for (id, user_id) in due {
            let id = SubscriptionId(id);
            let mut tx = self.pool.begin().await?;

            let Some(mut user) = lock_user(&mut tx, &TenantScope::System, UserId(user_id)).await?
            else {
                // Owner deleted: the row still has to leave the active set
                if let Some(mut sub) = lock_subscription(&mut tx, &TenantScope::System, id).await? {
                    if sub.status == SubscriptionStatus::Active {
                        sub.expire(now)?;
                        store_subscription(&mut tx, &sub).await?;
                        expired.push(id);
                    }
                }
                tx.commit().await?;
                continue;
            };

            let Some(mut sub) = lock_subscription(&mut tx, &TenantScope::System, id).await? else {
                continue;
            };
            if sub.status != SubscriptionStatus::Active || sub.expires_at >= now {
                continue;
            }
            sub.expire(now)?;
            store_subscription(&mut tx, &sub).await?;
            release_user(&mut tx, &mut user, id, now).await?;
            write_ledger(&mut tx, &user).await?;

            tx.commit().await?;
            expired.push(id);
        }

        Ok(expired)
    }

    async fn expire_stale_pending(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions s
            SET status = 'expired', updated_at = $2
            WHERE s.status = 'pending'
              AND (s.created_at < $1
                   OR EXISTS (SELECT 1 FROM subscriptions n
                              WHERE n.user_id = s.user_id AND n.status = 'pending'
                                AND n.id > s.id))
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn cancel(
        &self,
        scope: &TenantScope,
        id: SubscriptionId,
        owner: Option<UserId>,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription> {
        let (tenant, user_id) = self
            .owner_of(scope, "id", SubscriptionKey::Id(id.0))
            .await?
            .ok_or(DbError::NotFound)?;
        if owner.is_some_and(|o| o.0 != user_id) {
            return Err(DbError::NotFound);
        }

        let mut tx = self.pool.begin().await?;
        let owner_scope = TenantScope::Tenant(TenantId(tenant));
        let mut user = lock_user(&mut tx, &owner_scope, UserId(user_id)).await?;
        let mut sub = lock_subscription(&mut tx, scope, id)
            .await?
            .ok_or(DbError::NotFound)?;

        let was_active = sub.status == SubscriptionStatus::Active;
        sub.cancel(now)?;
        store_subscription(&mut tx, &sub).await?;
        if let (true, Some(user)) = (was_active, user.as_mut()) {
            release_user(&mut tx, user, id, now).await?;
            write_ledger(&mut tx, user).await?;
        }

        tx.commit().await?;
        Ok(sub)
    }

    async fn refund_by_payment_id(
        &self,
        scope: &TenantScope,
        payment_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription> {
        let (tenant, user_id) = self
            .owner_of(scope, "payment_id", SubscriptionKey::PaymentId(payment_id))
            .await?
            .ok_or(DbError::NotFound)?;

        let mut tx = self.pool.begin().await?;
        let owner_scope = TenantScope::Tenant(TenantId(tenant));
        let mut user = lock_user(&mut tx, &owner_scope, UserId(user_id)).await?;

        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE payment_id = $1 AND ($2::text IS NULL OR tenant_id = $2) FOR UPDATE"
        );
        let mut sub: Subscription = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(payment_id)
            .bind(scope.filter())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(DbError::NotFound)?
            .into();

        if sub.status == SubscriptionStatus::Refunded {
            tx.commit().await?;
            return Ok(sub);
        }

        let was_active = sub.status == SubscriptionStatus::Active;
        sub.refund(now)?;
        store_subscription(&mut tx, &sub).await?;

        if let Some(user) = user.as_mut() {
            if was_active {
                release_user(&mut tx, user, sub.id, now).await?;
            }
            let clawback = sub.total_quota.max(0).min(user.quota.max(0));
            user.quota -= clawback;
            write_ledger(&mut tx, user).await?;
            insert_log(
                &mut tx,
                &sub.tenant_id,
                sub.user_id,
                LogKind::Refund,
                -clawback,
                &format!("refunded plan {} ({payment_id})", sub.plan_code),
            )
            .await?;
        }

        tx.commit().await?;
        Ok(sub)
    }

    async fn renew(
        &self,
        scope: &TenantScope,
        id: SubscriptionId,
        days: i64,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription> {
        let mut tx = self.pool.begin().await?;

        let mut sub = lock_subscription(&mut tx, scope, id)
            .await?
            .ok_or(DbError::NotFound)?;
        sub.renew(days, now)?;
        store_subscription(&mut tx, &sub).await?;

        tx.commit().await?;
        Ok(sub)
    }

    async fn find_expiring(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
        auto_renew_only: bool,
        limit: i64,
    ) -> DbResult<Vec<Subscription>> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE status = 'active' AND expires_at > $1 AND expires_at <= $2 \
               AND ($3 = FALSE OR auto_renew) \
             ORDER BY expires_at LIMIT $4"
        );
        let rows = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(now)
            .bind(until)
            .bind(auto_renew_only)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Subscription::from).collect())
    }
}
