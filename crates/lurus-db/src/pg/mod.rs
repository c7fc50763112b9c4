//! PostgreSQL repository implementations

mod api_key;
mod identity;
mod invitation;
mod misc;
mod relay_token;
mod subscription;
mod tenant;
mod user;

pub use api_key::PgApiKeyRepository;
pub use identity::PgIdentityRepository;
pub use invitation::PgInvitationRepository;
pub use misc::{PgHealthCheck, PgLogRepository, PgOptionRepository, PgTenantConfigRepository};
pub use relay_token::PgRelayTokenRepository;
pub use subscription::PgSubscriptionRepository;
pub use tenant::PgTenantRepository;
pub use user::PgUserRepository;

use lurus_types::{TenantId, User, UserId};
use sqlx::PgConnection;

use crate::error::DbResult;
use crate::models::{LogKind, UserRow, USER_COLUMNS};
use crate::scope::TenantScope;

/// Lock a live user row for the rest of the transaction
pub(crate) async fn lock_user(
    conn: &mut PgConnection,
    scope: &TenantScope,
    id: UserId,
) -> DbResult<Option<User>> {
    let sql = format!(
        "SELECT {USER_COLUMNS} FROM users \
         WHERE id = $1 AND deleted_at IS NULL AND ($2::text IS NULL OR tenant_id = $2) \
         FOR UPDATE"
    );
    let row = sqlx::query_as::<_, UserRow>(&sql)
        .bind(id.0)
        .bind(scope.filter())
        .fetch_optional(&mut *conn)
        .await?;

    Ok(row.map(User::from))
}

/// Write the balance and daily ledger of a locked user back
pub(crate) async fn write_ledger(conn: &mut PgConnection, user: &User) -> DbResult<()> {
    sqlx::query(
        r#"
        UPDATE users
        SET quota = $2, daily_quota = $3, daily_used = $4, last_daily_reset = $5,
            "group" = $6, base_group = $7, fallback_group = $8
        WHERE id = $1
        "#,
    )
    .bind(user.id.0)
    .bind(user.quota)
    .bind(user.daily_quota)
    .bind(user.daily_used)
    .bind(user.last_daily_reset)
    .bind(&user.group)
    .bind(&user.base_group)
    .bind(&user.fallback_group)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Append a quota audit entry
pub(crate) async fn insert_log(
    conn: &mut PgConnection,
    tenant_id: &TenantId,
    user_id: UserId,
    kind: LogKind,
    delta: i64,
    content: &str,
) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO logs (tenant_id, user_id, kind, delta, content) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(tenant_id.as_str())
    .bind(user_id.0)
    .bind(kind.as_str())
    .bind(delta)
    .bind(content)
    .execute(&mut *conn)
    .await?;

    Ok(())
}
