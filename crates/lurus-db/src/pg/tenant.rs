//! PostgreSQL tenant repository implementation

use async_trait::async_trait;
use lurus_types::{Pagination, Tenant, TenantId, TenantStatus, DEFAULT_TENANT_CONFIGS};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use crate::models::TenantRow;
use crate::repo::{CreateTenant, TenantRepository};

const TENANT_COLUMNS: &str = "id, external_org_id, slug, name, status, plan_type, max_users, \
    max_quota, created_at, updated_at";

/// PostgreSQL tenant repository
#[derive(Clone)]
pub struct PgTenantRepository {
    pool: PgPool,
}

impl PgTenantRepository {
    /// Create a new tenant repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_by(&self, column: &str, value: &str) -> DbResult<Option<Tenant>> {
        let sql = format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE {column} = $1");
        let row = sqlx::query_as::<_, TenantRow>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Tenant::from))
    }
}

#[async_trait]
impl TenantRepository for PgTenantRepository {
    async fn find_by_id(&self, id: &TenantId) -> DbResult<Option<Tenant>> {
        self.find_by("id", id.as_str()).await
    }

    async fn find_by_slug(&self, slug: &str) -> DbResult<Option<Tenant>> {
        self.find_by("slug", slug).await
    }

    async fn find_by_external_org(&self, external_org_id: &str) -> DbResult<Option<Tenant>> {
        self.find_by("external_org_id", external_org_id).await
    }

    async fn create(&self, tenant: CreateTenant) -> DbResult<Tenant> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "INSERT INTO tenants (id, external_org_id, slug, name, plan_type, max_users, max_quota) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {TENANT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, TenantRow>(&sql)
            .bind(Uuid::new_v4().simple().to_string())
            .bind(&tenant.external_org_id)
            .bind(&tenant.slug)
            .bind(&tenant.name)
            .bind(&tenant.plan_type)
            .bind(tenant.max_users)
            .bind(tenant.max_quota)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| DbError::from_unique(e, "tenant"))?;

        for (key, value, value_type, is_system) in DEFAULT_TENANT_CONFIGS {
            sqlx::query(
                "INSERT INTO tenant_configs (tenant_id, key, value, value_type, is_system) \
                 VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING",
            )
            .bind(&row.id)
            .bind(*key)
            .bind(*value)
            .bind(value_type.as_str())
            .bind(*is_system)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(row.into())
    }

    async fn list(&self, page: &Pagination) -> DbResult<(Vec<Tenant>, i64)> {
        let sql = format!(
            "SELECT {TENANT_COLUMNS} FROM tenants ORDER BY created_at, id LIMIT $1 OFFSET $2"
        );
        let rows = sqlx::query_as::<_, TenantRow>(&sql)
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;
        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tenants")
            .fetch_one(&self.pool)
            .await?;

        Ok((rows.into_iter().map(Tenant::from).collect(), total))
    }

    async fn update_status(&self, id: &TenantId, status: TenantStatus) -> DbResult<bool> {
        let result =
            sqlx::query("UPDATE tenants SET status = $2, updated_at = NOW() WHERE id = $1")
                .bind(id.as_str())
                .bind(status.code())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }
}
