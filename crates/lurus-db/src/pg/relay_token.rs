//! PostgreSQL relay token repository implementation

use async_trait::async_trait;
use lurus_types::{Pagination, RelayToken, UserId};
use sqlx::PgPool;

use crate::error::{DbError, DbResult};
use crate::models::RelayTokenRow;
use crate::repo::{CreateRelayToken, RelayTokenRepository};
use crate::scope::TenantScope;

const TOKEN_COLUMNS: &str = r#"id, tenant_id, user_id, name, key_hash, key_prefix, status,
    remain_quota, unlimited_quota, used_quota, expired_time, "group", created_at"#;

/// PostgreSQL relay token repository
#[derive(Clone)]
pub struct PgRelayTokenRepository {
    pool: PgPool,
}

impl PgRelayTokenRepository {
    /// Create a new relay token repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RelayTokenRepository for PgRelayTokenRepository {
    async fn list_by_user(
        &self,
        scope: &TenantScope,
        user_id: UserId,
        page: &Pagination,
    ) -> DbResult<(Vec<RelayToken>, i64)> {
        let sql = format!(
            "SELECT {TOKEN_COLUMNS} FROM relay_tokens \
             WHERE user_id = $1 AND deleted_at IS NULL AND ($2::text IS NULL OR tenant_id = $2) \
             ORDER BY id DESC LIMIT $3 OFFSET $4"
        );
        let rows = sqlx::query_as::<_, RelayTokenRow>(&sql)
            .bind(user_id.0)
            .bind(scope.filter())
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;

        let (total,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM relay_tokens \
             WHERE user_id = $1 AND deleted_at IS NULL AND ($2::text IS NULL OR tenant_id = $2)",
        )
        .bind(user_id.0)
        .bind(scope.filter())
        .fetch_one(&self.pool)
        .await?;

        Ok((rows.into_iter().map(RelayToken::from).collect(), total))
    }

    async fn find_by_user_and_name(
        &self,
        scope: &TenantScope,
        user_id: UserId,
        name: &str,
    ) -> DbResult<Option<RelayToken>> {
        let sql = format!(
            "SELECT {TOKEN_COLUMNS} FROM relay_tokens \
             WHERE user_id = $1 AND name = $2 AND deleted_at IS NULL \
               AND ($3::text IS NULL OR tenant_id = $3) \
             ORDER BY id LIMIT 1"
        );
        let row = sqlx::query_as::<_, RelayTokenRow>(&sql)
            .bind(user_id.0)
            .bind(name)
            .bind(scope.filter())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(RelayToken::from))
    }

    async fn create(&self, token: CreateRelayToken) -> DbResult<RelayToken> {
        let sql = format!(
            r#"INSERT INTO relay_tokens (tenant_id, user_id, name, key_hash, key_prefix,
                                        remain_quota, unlimited_quota, "group")
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               RETURNING {TOKEN_COLUMNS}"#
        );
        let row = sqlx::query_as::<_, RelayTokenRow>(&sql)
            .bind(token.tenant_id.as_str())
            .bind(token.user_id.0)
            .bind(&token.name)
            .bind(&token.key_hash)
            .bind(&token.key_prefix)
            .bind(token.remain_quota)
            .bind(token.unlimited_quota)
            .bind(&token.group)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DbError::from_unique(e, "relay token"))?;

        Ok(row.into())
    }
}
