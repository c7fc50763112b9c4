//! PostgreSQL internal API key repository implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lurus_types::{ApiKey, ApiKeyId, Pagination};
use sqlx::PgPool;

use crate::error::{DbError, DbResult};
use crate::models::ApiKeyRow;
use crate::repo::{ApiKeyRepository, ApiKeyUpdate, CreateApiKey};

const API_KEY_COLUMNS: &str = "id, tenant_id, name, key_hash, key_prefix, scopes, created_by, \
    created_at, last_used_at, expires_at, enabled, description";

/// PostgreSQL API key repository
#[derive(Clone)]
pub struct PgApiKeyRepository {
    pool: PgPool,
}

impl PgApiKeyRepository {
    /// Create a new API key repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApiKeyRepository for PgApiKeyRepository {
    async fn find_by_hash(&self, key_hash: &str) -> DbResult<Option<ApiKey>> {
        let sql = format!("SELECT {API_KEY_COLUMNS} FROM internal_api_keys WHERE key_hash = $1");
        let row = sqlx::query_as::<_, ApiKeyRow>(&sql)
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(ApiKey::from))
    }

    async fn find_by_id(&self, id: ApiKeyId) -> DbResult<Option<ApiKey>> {
        let sql = format!("SELECT {API_KEY_COLUMNS} FROM internal_api_keys WHERE id = $1");
        let row = sqlx::query_as::<_, ApiKeyRow>(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(ApiKey::from))
    }

    async fn list(&self, page: &Pagination) -> DbResult<(Vec<ApiKey>, i64)> {
        let sql = format!(
            "SELECT {API_KEY_COLUMNS} FROM internal_api_keys ORDER BY id DESC LIMIT $1 OFFSET $2"
        );
        let rows = sqlx::query_as::<_, ApiKeyRow>(&sql)
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;
        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM internal_api_keys")
            .fetch_one(&self.pool)
            .await?;

        Ok((rows.into_iter().map(ApiKey::from).collect(), total))
    }

    async fn list_wildcard(&self) -> DbResult<Vec<ApiKey>> {
        let sql = format!(
            "SELECT {API_KEY_COLUMNS} FROM internal_api_keys WHERE '*' = ANY(scopes) ORDER BY id"
        );
        let rows = sqlx::query_as::<_, ApiKeyRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(ApiKey::from).collect())
    }

    async fn create(&self, key: CreateApiKey) -> DbResult<ApiKey> {
        let sql = format!(
            "INSERT INTO internal_api_keys (tenant_id, name, key_hash, key_prefix, scopes, \
                 created_by, expires_at, description) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {API_KEY_COLUMNS}"
        );
        let row = sqlx::query_as::<_, ApiKeyRow>(&sql)
            .bind(key.tenant_id.as_ref().map(|t| t.as_str()))
            .bind(&key.name)
            .bind(&key.key_hash)
            .bind(&key.key_prefix)
            .bind(&key.scopes)
            .bind(key.created_by.map(|u| u.0))
            .bind(key.expires_at)
            .bind(&key.description)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DbError::from_unique(e, "api key"))?;

        Ok(row.into())
    }

    async fn update(&self, id: ApiKeyId, update: ApiKeyUpdate) -> DbResult<Option<ApiKey>> {
        let sql = format!(
            "UPDATE internal_api_keys \
             SET name = COALESCE($2, name), \
                 scopes = COALESCE($3, scopes), \
                 description = COALESCE($4, description), \
                 expires_at = COALESCE($5, expires_at), \
                 enabled = COALESCE($6, enabled) \
             WHERE id = $1 \
             RETURNING {API_KEY_COLUMNS}"
        );
        let row = sqlx::query_as::<_, ApiKeyRow>(&sql)
            .bind(id.0)
            .bind(&update.name)
            .bind(&update.scopes)
            .bind(&update.description)
            .bind(update.expires_at)
            .bind(update.enabled)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(ApiKey::from))
    }

    async fn delete(&self, id: ApiKeyId) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM internal_api_keys WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn touch_last_used(&self, id: ApiKeyId, at: DateTime<Utc>) -> DbResult<()> {
        sqlx::query("UPDATE internal_api_keys SET last_used_at = $2 WHERE id = $1")
            .bind(id.0)
            .bind(at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
