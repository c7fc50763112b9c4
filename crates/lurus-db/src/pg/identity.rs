//! PostgreSQL OIDC identity mapping repository

use async_trait::async_trait;
use lurus_types::{TenantId, User};
use sqlx::PgPool;

use crate::error::{DbError, DbResult};
use crate::models::{IdentityMapping, UserRow, USER_COLUMNS};
use crate::repo::{CreateUser, IdentityRepository};

const MAPPING_COLUMNS: &str = "tenant_id, external_user_id, user_id, display_name, email, synced_at";

/// PostgreSQL identity mapping repository
#[derive(Clone)]
pub struct PgIdentityRepository {
    pool: PgPool,
}

impl PgIdentityRepository {
    /// Create a new identity mapping repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityRepository for PgIdentityRepository {
    async fn find(
        &self,
        tenant_id: &TenantId,
        external_user_id: &str,
    ) -> DbResult<Option<IdentityMapping>> {
        let sql = format!(
            "SELECT {MAPPING_COLUMNS} FROM user_identity_mappings \
             WHERE tenant_id = $1 AND external_user_id = $2"
        );
        let mapping = sqlx::query_as::<_, IdentityMapping>(&sql)
            .bind(tenant_id.as_str())
            .bind(external_user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(mapping)
    }

    async fn create_with_user(
        &self,
        user: CreateUser,
        external_user_id: &str,
    ) -> DbResult<(User, IdentityMapping)> {
        let mut tx = self.pool.begin().await?;

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
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| DbError::from_unique(e, "user"))?;
        let created = User::from(row);

        let sql = format!(
            "INSERT INTO user_identity_mappings \
                 (tenant_id, external_user_id, user_id, display_name, email) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {MAPPING_COLUMNS}"
        );
        let mapping = sqlx::query_as::<_, IdentityMapping>(&sql)
            .bind(created.tenant_id.as_str())
            .bind(external_user_id)
            .bind(created.id.0)
            .bind(&created.display_name)
            .bind(&created.email)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| DbError::from_unique(e, "identity mapping"))?;

        tx.commit().await?;
        Ok((created, mapping))
    }

    async fn sync(
        &self,
        tenant_id: &TenantId,
        external_user_id: &str,
        display_name: &str,
        email: &str,
    ) -> DbResult<()> {
        sqlx::query(
            "UPDATE user_identity_mappings \
             SET display_name = $3, email = $4, synced_at = NOW() \
             WHERE tenant_id = $1 AND external_user_id = $2",
        )
        .bind(tenant_id.as_str())
        .bind(external_user_id)
        .bind(display_name)
        .bind(email)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
