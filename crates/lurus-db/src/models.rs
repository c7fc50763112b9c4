//! Database row models
//!
//! These types map directly to database rows using SQLx's FromRow derive and
//! convert into the domain types of `lurus-types`.

use chrono::{DateTime, Utc};
use lurus_types::{
    ApiKey, ApiKeyId, ConfigType, InvitationCode, RelayToken, RelayTokenStatus, Role,
    Subscription, SubscriptionId, SubscriptionStatus, Tenant, TenantConfig, TenantId,
    TenantStatus, User, UserId, UserStatus,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Column list shared by every `users` query
pub(crate) const USER_COLUMNS: &str = r#"id, tenant_id, username, password_hash, display_name,
    email, phone, phone_verified, role, status, "group", base_group, fallback_group, quota,
    used_quota, daily_quota, daily_used, last_daily_reset, aff_code, created_at"#;

/// Column list shared by every `subscriptions` query
pub(crate) const SUBSCRIPTION_COLUMNS: &str = "id, tenant_id, user_id, plan_code, plan_name, \
    status, daily_quota, total_quota, base_group, fallback_group, started_at, expires_at, \
    payment_method, payment_id, amount_cents, currency, auto_renew, created_at, updated_at";

/// Tenant row from the database
#[derive(Debug, Clone, FromRow)]
pub struct TenantRow {
    pub id: String,
    pub external_org_id: String,
    pub slug: String,
    pub name: String,
    pub status: i32,
    pub plan_type: String,
    pub max_users: i32,
    pub max_quota: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<TenantRow> for Tenant {
    fn from(row: TenantRow) -> Self {
        Self {
            id: TenantId(row.id),
            external_org_id: row.external_org_id,
            slug: row.slug,
            name: row.name,
            status: TenantStatus::from_code(row.status),
            plan_type: row.plan_type,
            max_users: row.max_users,
            max_quota: row.max_quota,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// User row from the database
#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: i64,
    pub tenant_id: String,
    pub username: String,
    pub password_hash: Option<String>,
    pub display_name: String,
    pub email: String,
    pub phone: String,
    pub phone_verified: bool,
    pub role: i32,
    pub status: i32,
    pub group: String,
    pub base_group: String,
    pub fallback_group: String,
    pub quota: i64,
    pub used_quota: i64,
    pub daily_quota: i64,
    pub daily_used: i64,
    pub last_daily_reset: i64,
    pub aff_code: String,
    pub created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: UserId(row.id),
            tenant_id: TenantId(row.tenant_id),
            username: row.username,
            password_hash: row.password_hash,
            display_name: row.display_name,
            email: row.email,
            phone: row.phone,
            phone_verified: row.phone_verified,
            role: Role::from_code(row.role),
            status: UserStatus::from_code(row.status),
            group: row.group,
            base_group: row.base_group,
            fallback_group: row.fallback_group,
            quota: row.quota,
            used_quota: row.used_quota,
            daily_quota: row.daily_quota,
            daily_used: row.daily_used,
            last_daily_reset: row.last_daily_reset,
            aff_code: row.aff_code,
            created_at: row.created_at,
        }
    }
}

/// Subscription row from the database
#[derive(Debug, Clone, FromRow)]
pub struct SubscriptionRow {
    pub id: i64,
    pub tenant_id: String,
    pub user_id: i64,
    pub plan_code: String,
    pub plan_name: String,
    pub status: String,
    pub daily_quota: i64,
    pub total_quota: i64,
    pub base_group: String,
    pub fallback_group: String,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub payment_method: String,
    pub payment_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub auto_renew: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        Self {
            id: SubscriptionId(row.id),
            tenant_id: TenantId(row.tenant_id),
            user_id: UserId(row.user_id),
            plan_code: row.plan_code,
            plan_name: row.plan_name,
            // The CHECK constraint keeps unknown values out
            status: SubscriptionStatus::parse(&row.status).unwrap_or(SubscriptionStatus::Expired),
            daily_quota: row.daily_quota,
            total_quota: row.total_quota,
            base_group: row.base_group,
            fallback_group: row.fallback_group,
            started_at: row.started_at,
            expires_at: row.expires_at,
            payment_method: row.payment_method,
            payment_id: row.payment_id,
            amount_cents: row.amount_cents,
            currency: row.currency,
            auto_renew: row.auto_renew,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Internal API key row from the database
#[derive(Debug, Clone, FromRow)]
pub struct ApiKeyRow {
    pub id: i64,
    pub tenant_id: Option<String>,
    pub name: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub scopes: Vec<String>,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: i64,
    pub enabled: bool,
    pub description: String,
}

impl From<ApiKeyRow> for ApiKey {
    fn from(row: ApiKeyRow) -> Self {
        Self {
            id: ApiKeyId(row.id),
            tenant_id: row.tenant_id.map(TenantId),
            name: row.name,
            key_hash: row.key_hash,
            key_prefix: row.key_prefix,
            scopes: row.scopes,
            created_by: row.created_by.map(UserId),
            created_at: row.created_at,
            last_used_at: row.last_used_at,
            expires_at: row.expires_at,
            enabled: row.enabled,
            description: row.description,
        }
    }
}

/// Invitation code row from the database
#[derive(Debug, Clone, FromRow)]
pub struct InvitationRow {
    pub id: i64,
    pub tenant_id: String,
    pub code: String,
    pub created_by: i64,
    pub used_by: Option<i64>,
    pub used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<InvitationRow> for InvitationCode {
    fn from(row: InvitationRow) -> Self {
        Self {
            id: row.id,
            tenant_id: TenantId(row.tenant_id),
            code: row.code,
            created_by: UserId(row.created_by),
            used_by: row.used_by.map(UserId),
            used_at: row.used_at,
            expires_at: row.expires_at,
            created_at: row.created_at,
        }
    }
}

/// Relay token row from the database
#[derive(Debug, Clone, FromRow)]
pub struct RelayTokenRow {
    pub id: i64,
    pub tenant_id: String,
    pub user_id: i64,
    pub name: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub status: i32,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    pub used_quota: i64,
    pub expired_time: i64,
    pub group: String,
    pub created_at: DateTime<Utc>,
}

impl From<RelayTokenRow> for RelayToken {
    fn from(row: RelayTokenRow) -> Self {
        Self {
            id: row.id,
            tenant_id: TenantId(row.tenant_id),
            user_id: UserId(row.user_id),
            name: row.name,
            key_hash: row.key_hash,
            key_prefix: row.key_prefix,
            status: RelayTokenStatus::from_code(row.status),
            remain_quota: row.remain_quota,
            unlimited_quota: row.unlimited_quota,
            used_quota: row.used_quota,
            expired_time: row.expired_time,
            group: row.group,
            created_at: row.created_at,
        }
    }
}

/// Tenant config row from the database
#[derive(Debug, Clone, FromRow)]
pub struct TenantConfigRow {
    pub tenant_id: String,
    pub key: String,
    pub value: String,
    pub value_type: String,
    pub is_system: bool,
    pub is_encrypted: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<TenantConfigRow> for TenantConfig {
    fn from(row: TenantConfigRow) -> Self {
        Self {
            tenant_id: TenantId(row.tenant_id),
            key: row.key,
            value: row.value,
            value_type: ConfigType::parse(&row.value_type).unwrap_or(ConfigType::String),
            is_system: row.is_system,
            is_encrypted: row.is_encrypted,
            updated_at: row.updated_at,
        }
    }
}

/// Link between an OIDC subject and a local user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct IdentityMapping {
    pub tenant_id: String,
    pub external_user_id: String,
    pub user_id: i64,
    pub display_name: String,
    pub email: String,
    pub synced_at: DateTime<Utc>,
}

/// Category of a quota log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    /// Manual or service adjustment
    System,
    Topup,
    Subscription,
    Refund,
}

impl LogKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Topup => "topup",
            Self::Subscription => "subscription",
            Self::Refund => "refund",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "topup" => Self::Topup,
            "subscription" => Self::Subscription,
            "refund" => Self::Refund,
            _ => Self::System,
        }
    }
}

/// Quota audit log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLog {
    pub id: i64,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub kind: LogKind,
    pub delta: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Quota log row from the database
#[derive(Debug, Clone, FromRow)]
pub struct LogRow {
    pub id: i64,
    pub tenant_id: String,
    pub user_id: i64,
    pub kind: String,
    pub delta: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl From<LogRow> for QuotaLog {
    fn from(row: LogRow) -> Self {
        Self {
            id: row.id,
            tenant_id: TenantId(row.tenant_id),
            user_id: UserId(row.user_id),
            kind: LogKind::parse(&row.kind),
            delta: row.delta,
            content: row.content,
            created_at: row.created_at,
        }
    }
}
