//! PostgreSQL user repository implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lurus_types::{DailyQuotaInfo, PostConsume, PreConsume, User, UserId, UserUpdate};
use sqlx::PgPool;

use super::{insert_log, lock_user, write_ledger};
use crate::error::{DbError, DbResult};
use crate::models::{UserRow, USER_COLUMNS};
use crate::repo::{CreateUser, QuotaAdjustment, UserRepository};
use crate::scope::TenantScope;

/// PostgreSQL user repository
#[derive(Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    /// Create a new user repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_by_column(
        &self,
        scope: &TenantScope,
        column: &str,
        value: &str,
    ) -> DbResult<Option<User>> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE {column} = $1 AND deleted_at IS NULL \
               AND ($2::text IS NULL OR tenant_id = $2) \
             ORDER BY id LIMIT 1"
        );
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(value)
            .bind(scope.filter())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(User::from))
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn find_by_id(&self, scope: &TenantScope, id: UserId) -> DbResult<Option<User>> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE id = $1 AND deleted_at IS NULL AND ($2::text IS NULL OR tenant_id = $2)"
        );
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(id.0)
            .bind(scope.filter())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(User::from))
    }

    async fn find_by_username(
        &self,
        scope: &TenantScope,
        username: &str,
    ) -> DbResult<Option<User>> {
        self.find_by_column(scope, "username", username).await
    }

    async fn find_by_email(&self, scope: &TenantScope, email: &str) -> DbResult<Option<User>> {
        if email.is_empty() {
            return Ok(None);
        }
        self.find_by_column(scope, "email", email).await
    }

    async fn find_by_phone(&self, scope: &TenantScope, phone: &str) -> DbResult<Option<User>> {
        if phone.is_empty() {
            return Ok(None);
        }
        self.find_by_column(scope, "phone", phone).await
    }

    async fn create(&self, user: CreateUser) -> DbResult<User> {
        let sql = format!(
            r#"INSERT INTO users (tenant_id, username, password_hash, display_name, email, phone,
                                 phone_verified, role, "group", quota, aff_code)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
               RETURNING {USER_COLUMNS}"#
        );
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(user.tenant_id.as_str())
            .bind(&user.username)
            .bind(&user.password_hash)
            .bind(&user.display_name)
            .bind(&user.email)
            .bind(&user.phone)
            .bind(user.phone_verified)
            .bind(user.role.code())
            .bind(&user.group)
            .bind(user.quota)
            .bind(&user.aff_code)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DbError::from_unique(e, "user"))?;

        Ok(row.into())
    }

    async fn update(
        &self,
        scope: &TenantScope,
        id: UserId,
        update: &UserUpdate,
    ) -> DbResult<Option<User>> {
        let sql = format!(
            r#"UPDATE users
               SET display_name = COALESCE($3, display_name),
                   email = COALESCE($4, email),
                   phone = COALESCE($5, phone),
                   phone_verified = CASE WHEN $5::text IS NULL THEN phone_verified ELSE TRUE END,
                   status = COALESCE($6, status),
                   "group" = COALESCE($7, "group")
               WHERE id = $1 AND deleted_at IS NULL AND ($2::text IS NULL OR tenant_id = $2)
               RETURNING {USER_COLUMNS}"#
        );
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(id.0)
            .bind(scope.filter())
            .bind(&update.display_name)
            .bind(&update.email)
            .bind(&update.phone)
            .bind(update.status.map(|s| s.code()))
            .bind(&update.group)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DbError::from_unique(e, "phone or email"))?;

        Ok(row.map(User::from))
    }

    async fn set_password_hash(
        &self,
        scope: &TenantScope,
        id: UserId,
        hash: &str,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE users SET password_hash = $3 \
             WHERE id = $1 AND deleted_at IS NULL AND ($2::text IS NULL OR tenant_id = $2)",
        )
        .bind(id.0)
        .bind(scope.filter())
        .bind(hash)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, scope: &TenantScope, id: UserId) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE users SET deleted_at = NOW(), status = 2 \
             WHERE id = $1 AND deleted_at IS NULL AND ($2::text IS NULL OR tenant_id = $2)",
        )
        .bind(id.0)
        .bind(scope.filter())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            "UPDATE relay_tokens SET deleted_at = NOW(), status = 2 \
             WHERE user_id = $1 AND deleted_at IS NULL",
        )
        .bind(id.0)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE subscriptions SET status = 'cancelled', auto_renew = FALSE, updated_at = NOW() \
             WHERE user_id = $1 AND status = 'pending'",
        )
        .bind(id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn adjust_quota(
        &self,
        scope: &TenantScope,
        id: UserId,
        adjustment: QuotaAdjustment,
    ) -> DbResult<i64> {
        let mut tx = self.pool.begin().await?;

        let mut user = lock_user(&mut tx, scope, id).await?.ok_or(DbError::NotFound)?;
        let new_quota = user.quota.saturating_add(adjustment.delta);
        if adjustment.delta < 0 && new_quota < 0 && !adjustment.allow_negative {
            return Err(DbError::InsufficientQuota {
                balance: user.quota,
                requested: -adjustment.delta,
            });
        }
        user.quota = new_quota;

        write_ledger(&mut tx, &user).await?;
        insert_log(
            &mut tx,
            &user.tenant_id,
            user.id,
            adjustment.kind,
            adjustment.delta,
            &adjustment.content,
        )
        .await?;

        tx.commit().await?;
        Ok(new_quota)
    }

    async fn pre_consume(
        &self,
        scope: &TenantScope,
        id: UserId,
        delta: i64,
        now: DateTime<Utc>,
    ) -> DbResult<(PreConsume, DailyQuotaInfo)> {
        let mut tx = self.pool.begin().await?;

        let mut user = lock_user(&mut tx, scope, id).await?.ok_or(DbError::NotFound)?;
        let mut state = user.daily_state();
        let outcome = state.pre_consume(delta, now);
        let info = state.info(now);
        if outcome.reset || outcome.switched_to_fallback {
            user.apply_daily_state(state);
            write_ledger(&mut tx, &user).await?;
        }

        tx.commit().await?;
        Ok((outcome, info))
    }

    async fn post_consume(
        &self,
        scope: &TenantScope,
        id: UserId,
        amount: i64,
        now: DateTime<Utc>,
    ) -> DbResult<PostConsume> {
        let mut tx = self.pool.begin().await?;

        let mut user = lock_user(&mut tx, scope, id).await?.ok_or(DbError::NotFound)?;
        let mut state = user.daily_state();
        let outcome = state.post_consume(amount, now);
        user.apply_daily_state(state);
        write_ledger(&mut tx, &user).await?;

        tx.commit().await?;
        Ok(outcome)
    }

    async fn reset_daily(
        &self,
        scope: &TenantScope,
        id: UserId,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let Some(mut user) = lock_user(&mut tx, scope, id).await? else {
            return Ok(false);
        };
        let mut state = user.daily_state();
        let reset = state.reset(now);
        if reset {
            user.apply_daily_state(state);
            write_ledger(&mut tx, &user).await?;
        }

        tx.commit().await?;
        Ok(reset)
    }

    async fn find_needing_daily_reset(&self, day_start: i64, limit: i64) -> DbResult<Vec<UserId>> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM users \
             WHERE daily_quota > 0 AND last_daily_reset < $1 AND deleted_at IS NULL \
             ORDER BY id LIMIT $2",
        )
        .bind(day_start)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| UserId(id)).collect())
    }
}
