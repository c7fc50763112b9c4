//! PostgreSQL tenant config, option and log repositories

use async_trait::async_trait;
use lurus_types::{TenantConfig, TenantId, UserId};
use sqlx::PgPool;

use crate::error::DbResult;
use crate::models::{LogRow, QuotaLog, TenantConfigRow};
use crate::repo::{HealthCheck, LogRepository, OptionRepository, TenantConfigRepository};
use crate::scope::TenantScope;

const CONFIG_COLUMNS: &str = "tenant_id, key, value, value_type, is_system, is_encrypted, updated_at";

/// PostgreSQL tenant config repository
#[derive(Clone)]
pub struct PgTenantConfigRepository {
    pool: PgPool,
}

impl PgTenantConfigRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantConfigRepository for PgTenantConfigRepository {
    async fn list(&self, tenant_id: &TenantId) -> DbResult<Vec<TenantConfig>> {
        let sql =
            format!("SELECT {CONFIG_COLUMNS} FROM tenant_configs WHERE tenant_id = $1 ORDER BY key");
        let rows = sqlx::query_as::<_, TenantConfigRow>(&sql)
            .bind(tenant_id.as_str())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(TenantConfig::from).collect())
    }

    async fn get(&self, tenant_id: &TenantId, key: &str) -> DbResult<Option<TenantConfig>> {
        let sql = format!(
            "SELECT {CONFIG_COLUMNS} FROM tenant_configs WHERE tenant_id = $1 AND key = $2"
        );
        let row = sqlx::query_as::<_, TenantConfigRow>(&sql)
            .bind(tenant_id.as_str())
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(TenantConfig::from))
    }

    async fn upsert(&self, config: TenantConfig) -> DbResult<TenantConfig> {
        let sql = format!(
            "INSERT INTO tenant_configs (tenant_id, key, value, value_type, is_system, is_encrypted) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (tenant_id, key) DO UPDATE \
             SET value = EXCLUDED.value, value_type = EXCLUDED.value_type, \
                 is_encrypted = EXCLUDED.is_encrypted, updated_at = NOW() \
             RETURNING {CONFIG_COLUMNS}"
        );
        let row = sqlx::query_as::<_, TenantConfigRow>(&sql)
            .bind(config.tenant_id.as_str())
            .bind(&config.key)
            .bind(&config.value)
            .bind(config.value_type.as_str())
            .bind(config.is_system)
            .bind(config.is_encrypted)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.into())
    }
}

/// PostgreSQL option repository
#[derive(Clone)]
pub struct PgOptionRepository {
    pool: PgPool,
}

impl PgOptionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OptionRepository for PgOptionRepository {
    async fn get(&self, key: &str) -> DbResult<Option<String>> {
        let value: Option<(String,)> = sqlx::query_as("SELECT value FROM options WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value.map(|(v,)| v))
    }

    async fn set(&self, key: &str, value: &str) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO options (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// PostgreSQL quota log reader
#[derive(Clone)]
pub struct PgLogRepository {
    pool: PgPool,
}

impl PgLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogRepository for PgLogRepository {
    async fn list_by_user(
        &self,
        scope: &TenantScope,
        user_id: UserId,
        limit: i64,
    ) -> DbResult<Vec<QuotaLog>> {
        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT id, tenant_id, user_id, kind, delta, content, created_at FROM logs \
             WHERE user_id = $1 AND ($2::text IS NULL OR tenant_id = $2) \
             ORDER BY id DESC LIMIT $3",
        )
        .bind(user_id.0)
        .bind(scope.filter())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(QuotaLog::from).collect())
    }
}

/// Round-trips a trivial query
#[derive(Clone)]
pub struct PgHealthCheck {
    pool: PgPool,
}

impl PgHealthCheck {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HealthCheck for PgHealthCheck {
    async fn ping(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
