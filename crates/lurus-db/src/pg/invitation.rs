//! PostgreSQL invitation code repository implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lurus_types::{InvitationCode, InvitationState, Pagination, TenantId, UserId};
use sqlx::PgPool;

use crate::error::{DbError, DbResult};
use crate::models::InvitationRow;
use crate::repo::InvitationRepository;
use crate::scope::TenantScope;

const INVITATION_COLUMNS: &str =
    "id, tenant_id, code, created_by, used_by, used_at, expires_at, created_at";

/// PostgreSQL invitation code repository
#[derive(Clone)]
pub struct PgInvitationRepository {
    pool: PgPool,
}

impl PgInvitationRepository {
    /// Create a new invitation code repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InvitationRepository for PgInvitationRepository {
    async fn create_many(
        &self,
        tenant_id: &TenantId,
        created_by: UserId,
        codes: Vec<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> DbResult<Vec<InvitationCode>> {
        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(codes.len());

        let sql = format!(
            "INSERT INTO invitation_codes (tenant_id, code, created_by, expires_at) \
             VALUES ($1, $2, $3, $4) \
             RETURNING {INVITATION_COLUMNS}"
        );
        for code in &codes {
            let row = sqlx::query_as::<_, InvitationRow>(&sql)
                .bind(tenant_id.as_str())
                .bind(code)
                .bind(created_by.0)
                .bind(expires_at)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| DbError::from_unique(e, "invitation code"))?;
            created.push(InvitationCode::from(row));
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn find_by_code(
        &self,
        scope: &TenantScope,
        code: &str,
    ) -> DbResult<Option<InvitationCode>> {
        let sql = format!(
            "SELECT {INVITATION_COLUMNS} FROM invitation_codes \
             WHERE code = $1 AND ($2::text IS NULL OR tenant_id = $2)"
        );
        let row = sqlx::query_as::<_, InvitationRow>(&sql)
            .bind(code)
            .bind(scope.filter())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(InvitationCode::from))
    }

    async fn list(
        &self,
        scope: &TenantScope,
        prefix: Option<&str>,
        page: &Pagination,
    ) -> DbResult<(Vec<InvitationCode>, i64)> {
        let pattern = prefix.map(|p| format!("{}%", p.replace('%', "").replace('_', "")));

        let sql = format!(
            "SELECT {INVITATION_COLUMNS} FROM invitation_codes \
             WHERE ($1::text IS NULL OR tenant_id = $1) AND ($2::text IS NULL OR code LIKE $2) \
             ORDER BY id DESC LIMIT $3 OFFSET $4"
        );
        let rows = sqlx::query_as::<_, InvitationRow>(&sql)
            .bind(scope.filter())
            .bind(&pattern)
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;

        let (total,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM invitation_codes \
             WHERE ($1::text IS NULL OR tenant_id = $1) AND ($2::text IS NULL OR code LIKE $2)",
        )
        .bind(scope.filter())
        .bind(&pattern)
        .fetch_one(&self.pool)
        .await?;

        Ok((rows.into_iter().map(InvitationCode::from).collect(), total))
    }

    async fn delete_unused(&self, scope: &TenantScope, id: i64) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let used: Option<(Option<i64>,)> = sqlx::query_as(
            "SELECT used_by FROM invitation_codes \
             WHERE id = $1 AND ($2::text IS NULL OR tenant_id = $2) FOR UPDATE",
        )
        .bind(id)
        .bind(scope.filter())
        .fetch_optional(&mut *tx)
        .await?;

        match used {
            None => Ok(false),
            Some((Some(_),)) => Err(DbError::InvalidState(
                "cannot delete a used invitation code".into(),
            )),
            Some((None,)) => {
                sqlx::query("DELETE FROM invitation_codes WHERE id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(true)
            }
        }
    }

    async fn redeem(
        &self,
        scope: &TenantScope,
        code: &str,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> DbResult<InvitationCode> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT {INVITATION_COLUMNS} FROM invitation_codes \
             WHERE code = $1 AND ($2::text IS NULL OR tenant_id = $2) FOR UPDATE"
        );
        let mut invitation = sqlx::query_as::<_, InvitationRow>(&sql)
            .bind(code)
            .bind(scope.filter())
            .fetch_optional(&mut *tx)
            .await?
            .map(InvitationCode::from)
            .ok_or(DbError::NotFound)?;

        let state = invitation.redeem(user_id, now);
        if state != InvitationState::Valid {
            return Err(DbError::invitation(state));
        }

        sqlx::query("UPDATE invitation_codes SET used_by = $2, used_at = $3 WHERE id = $1")
            .bind(invitation.id)
            .bind(user_id.0)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(invitation)
    }
}
