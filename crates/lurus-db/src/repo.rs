//! Repository traits
//!
//! Define async repository interfaces for database operations. Methods that
//! touch tenant-owned rows take a [`TenantScope`]; most callers reach them
//! through [`crate::TenantDb`], which supplies the scope.
//!
//! Mutators that span several rows run in one transaction and lock rows in
//! the fixed order users, subscriptions, logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lurus_types::{
    ApiKey, ApiKeyId, DailyQuotaInfo, InvitationCode, NewSubscription, Pagination, PaymentMethod,
    PaymentTransition, PostConsume, PreConsume, RelayToken, Role, Subscription, SubscriptionId,
    Tenant, TenantConfig, TenantId, TenantStatus, User, UserId, UserUpdate,
};

use crate::error::DbResult;
use crate::models::{IdentityMapping, LogKind, QuotaLog};
use crate::scope::TenantScope;

// ============================================================================
// Tenants
// ============================================================================

/// Tenant repository trait
#[async_trait]
pub trait TenantRepository: Send + Sync {
    async fn find_by_id(&self, id: &TenantId) -> DbResult<Option<Tenant>>;

    async fn find_by_slug(&self, slug: &str) -> DbResult<Option<Tenant>>;

    /// Find the tenant mapped to an identity-provider organisation
    async fn find_by_external_org(&self, external_org_id: &str) -> DbResult<Option<Tenant>>;

    /// Create a tenant; a taken slug or org is a conflict
    async fn create(&self, tenant: CreateTenant) -> DbResult<Tenant>;

    async fn list(&self, page: &Pagination) -> DbResult<(Vec<Tenant>, i64)>;

    async fn update_status(&self, id: &TenantId, status: TenantStatus) -> DbResult<bool>;
}

/// Create tenant input
#[derive(Debug, Clone)]
pub struct CreateTenant {
    pub external_org_id: String,
    pub slug: String,
    pub name: String,
    pub plan_type: String,
    pub max_users: i32,
    pub max_quota: i64,
}

// ============================================================================
// Users
// ============================================================================

/// User repository trait
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, scope: &TenantScope, id: UserId) -> DbResult<Option<User>>;

    async fn find_by_username(&self, scope: &TenantScope, username: &str)
        -> DbResult<Option<User>>;

    async fn find_by_email(&self, scope: &TenantScope, email: &str) -> DbResult<Option<User>>;

    async fn find_by_phone(&self, scope: &TenantScope, phone: &str) -> DbResult<Option<User>>;

    /// Insert a user; username, phone or email taken within the tenant is a
    /// conflict
    async fn create(&self, user: CreateUser) -> DbResult<User>;

    /// Apply a sparse update. Setting `phone` also marks it verified.
    async fn update(
        &self,
        scope: &TenantScope,
        id: UserId,
        update: &UserUpdate,
    ) -> DbResult<Option<User>>;

    async fn set_password_hash(&self, scope: &TenantScope, id: UserId, hash: &str)
        -> DbResult<bool>;

    /// Soft-delete a user and disable its relay tokens
    async fn delete(&self, scope: &TenantScope, id: UserId) -> DbResult<bool>;

    /// Add `delta` to the balance under the user row lock and write a log
    /// entry. Returns the new balance.
    async fn adjust_quota(
        &self,
        scope: &TenantScope,
        id: UserId,
        adjustment: QuotaAdjustment,
    ) -> DbResult<i64>;

    /// Lock the user, lazily reset, and check `delta` against today's cap
    async fn pre_consume(
        &self,
        scope: &TenantScope,
        id: UserId,
        delta: i64,
        now: DateTime<Utc>,
    ) -> DbResult<(PreConsume, DailyQuotaInfo)>;

    /// Lock the user, lazily reset, and record `amount` as used today
    async fn post_consume(
        &self,
        scope: &TenantScope,
        id: UserId,
        amount: i64,
        now: DateTime<Utc>,
    ) -> DbResult<PostConsume>;

    /// Reset the daily ledger if the UTC date rolled over
    async fn reset_daily(&self, scope: &TenantScope, id: UserId, now: DateTime<Utc>)
        -> DbResult<bool>;

    /// Capped users whose last reset falls before `day_start` (epoch seconds)
    async fn find_needing_daily_reset(&self, day_start: i64, limit: i64) -> DbResult<Vec<UserId>>;
}

/// Create user input
#[derive(Debug, Clone)]
pub struct CreateUser {
    pub tenant_id: TenantId,
    pub username: String,
    pub password_hash: Option<String>,
    pub display_name: String,
    pub email: String,
    pub phone: String,
    pub phone_verified: bool,
    pub role: Role,
    pub group: String,
    pub quota: i64,
    pub aff_code: String,
}

/// A balance change together with its audit entry
#[derive(Debug, Clone)]
pub struct QuotaAdjustment {
    pub delta: i64,
    /// Permit the balance to go below zero
    pub allow_negative: bool,
    pub kind: LogKind,
    pub content: String,
}

// ============================================================================
// Identity mappings
// ============================================================================

/// OIDC subject mapping repository trait
#[async_trait]
pub trait IdentityRepository: Send + Sync {
    async fn find(
        &self,
        tenant_id: &TenantId,
        external_user_id: &str,
    ) -> DbResult<Option<IdentityMapping>>;

    /// Create a user and its mapping in one transaction
    async fn create_with_user(
        &self,
        user: CreateUser,
        external_user_id: &str,
    ) -> DbResult<(User, IdentityMapping)>;

    /// Refresh the synced display name and email
    async fn sync(
        &self,
        tenant_id: &TenantId,
        external_user_id: &str,
        display_name: &str,
        email: &str,
    ) -> DbResult<()>;
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Subscription repository trait
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn find_by_id(&self, scope: &TenantScope, id: SubscriptionId)
        -> DbResult<Option<Subscription>>;

    async fn find_by_payment_id(
        &self,
        scope: &TenantScope,
        payment_id: &str,
    ) -> DbResult<Option<Subscription>>;

    /// Newest first
    async fn list_by_user(
        &self,
        scope: &TenantScope,
        user_id: UserId,
        limit: i64,
    ) -> DbResult<Vec<Subscription>>;

    /// Active subscriptions of a user that have not yet ended, earliest
    /// start first
    async fn list_active(
        &self,
        scope: &TenantScope,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<Subscription>>;

    /// Insert a pending order. Fails with a conflict if the user already has
    /// one; stacks behind the latest running subscription.
    async fn create_pending(
        &self,
        tenant_id: &TenantId,
        sub: NewSubscription,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription>;

    /// Confirm a payment under the subscription row lock.
    ///
    /// An already active row is returned unchanged; any other non-pending
    /// state is rejected.
    async fn confirm_payment(
        &self,
        scope: &TenantScope,
        id: SubscriptionId,
        payment: PaymentConfirmation,
    ) -> DbResult<(Subscription, PaymentTransition)>;

    /// Record the checkout reference of a pending order owned by `owner`.
    /// A reference already held by another subscription is a conflict.
    async fn attach_payment(
        &self,
        scope: &TenantScope,
        id: SubscriptionId,
        owner: UserId,
        payment_id: &str,
        method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription>;

    /// Expire a single pending order
    async fn expire_pending(
        &self,
        scope: &TenantScope,
        id: SubscriptionId,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription>;

    /// Create an already active subscription and apply it to the user
    async fn grant(
        &self,
        tenant_id: &TenantId,
        sub: NewSubscription,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription>;

    /// Expire up to `limit` overdue active subscriptions and release their
    /// entitlements. Returns the IDs that were expired.
    async fn expire_due(&self, now: DateTime<Utc>, limit: i64) -> DbResult<Vec<SubscriptionId>>;

    /// Expire pending orders created before `cutoff`
    async fn expire_stale_pending(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>)
        -> DbResult<u64>;

    /// Cancel a subscription owned by `owner` (any owner when `None`)
    async fn cancel(
        &self,
        scope: &TenantScope,
        id: SubscriptionId,
        owner: Option<UserId>,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription>;

    /// Refund the subscription paid with `payment_id`, release its
    /// entitlements and claw back credited quota
    async fn refund_by_payment_id(
        &self,
        scope: &TenantScope,
        payment_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription>;

    /// Extend an active subscription by `days`
    async fn renew(
        &self,
        scope: &TenantScope,
        id: SubscriptionId,
        days: i64,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription>;

    /// Active subscriptions ending before `until`
    async fn find_expiring(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
        auto_renew_only: bool,
        limit: i64,
    ) -> DbResult<Vec<Subscription>>;
}

/// Payment details handed to [`SubscriptionRepository::confirm_payment`]
#[derive(Debug, Clone)]
pub struct PaymentConfirmation {
    pub payment_id: String,
    pub method: PaymentMethod,
    pub now: DateTime<Utc>,
}

// ============================================================================
// Credentials
// ============================================================================

/// Internal API key repository trait.
///
/// Keys are platform-level records; the optional tenant only narrows what a
/// key's principal is bound to.
#[async_trait]
pub trait ApiKeyRepository: Send + Sync {
    async fn find_by_hash(&self, key_hash: &str) -> DbResult<Option<ApiKey>>;

    async fn find_by_id(&self, id: ApiKeyId) -> DbResult<Option<ApiKey>>;

    async fn list(&self, page: &Pagination) -> DbResult<(Vec<ApiKey>, i64)>;

    /// Keys whose scope set contains the wildcard
    async fn list_wildcard(&self) -> DbResult<Vec<ApiKey>>;

    async fn create(&self, key: CreateApiKey) -> DbResult<ApiKey>;

    async fn update(&self, id: ApiKeyId, update: ApiKeyUpdate) -> DbResult<Option<ApiKey>>;

    async fn delete(&self, id: ApiKeyId) -> DbResult<bool>;

    async fn touch_last_used(&self, id: ApiKeyId, at: DateTime<Utc>) -> DbResult<()>;
}

/// Create API key input
#[derive(Debug, Clone)]
pub struct CreateApiKey {
    pub tenant_id: Option<TenantId>,
    pub name: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub scopes: Vec<String>,
    pub created_by: Option<UserId>,
    pub expires_at: i64,
    pub description: String,
}

/// Sparse API key update
#[derive(Debug, Clone, Default)]
pub struct ApiKeyUpdate {
    pub name: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub description: Option<String>,
    pub expires_at: Option<i64>,
    pub enabled: Option<bool>,
}

/// Invitation code repository trait
#[async_trait]
pub trait InvitationRepository: Send + Sync {
    async fn create_many(
        &self,
        tenant_id: &TenantId,
        created_by: UserId,
        codes: Vec<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> DbResult<Vec<InvitationCode>>;

    async fn find_by_code(&self, scope: &TenantScope, code: &str)
        -> DbResult<Option<InvitationCode>>;

    /// Newest first; `prefix` narrows to codes starting with it
    async fn list(
        &self,
        scope: &TenantScope,
        prefix: Option<&str>,
        page: &Pagination,
    ) -> DbResult<(Vec<InvitationCode>, i64)>;

    /// Delete an unused code; a used one is an invalid state
    async fn delete_unused(&self, scope: &TenantScope, id: i64) -> DbResult<bool>;

    /// Consume a code under its row lock. Exactly one concurrent caller wins.
    async fn redeem(
        &self,
        scope: &TenantScope,
        code: &str,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> DbResult<InvitationCode>;
}

/// Relay token repository trait
#[async_trait]
pub trait RelayTokenRepository: Send + Sync {
    async fn list_by_user(
        &self,
        scope: &TenantScope,
        user_id: UserId,
        page: &Pagination,
    ) -> DbResult<(Vec<RelayToken>, i64)>;

    async fn find_by_user_and_name(
        &self,
        scope: &TenantScope,
        user_id: UserId,
        name: &str,
    ) -> DbResult<Option<RelayToken>>;

    async fn create(&self, token: CreateRelayToken) -> DbResult<RelayToken>;
}

/// Create relay token input
#[derive(Debug, Clone)]
pub struct CreateRelayToken {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub name: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    pub group: String,
}

// ============================================================================
// Configuration and logs
// ============================================================================

/// Tenant config repository trait
#[async_trait]
pub trait TenantConfigRepository: Send + Sync {
    async fn list(&self, tenant_id: &TenantId) -> DbResult<Vec<TenantConfig>>;

    async fn get(&self, tenant_id: &TenantId, key: &str) -> DbResult<Option<TenantConfig>>;

    async fn upsert(&self, config: TenantConfig) -> DbResult<TenantConfig>;
}

/// Process-wide option rows
#[async_trait]
pub trait OptionRepository: Send + Sync {
    async fn get(&self, key: &str) -> DbResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> DbResult<()>;
}

/// Quota audit log reader; entries are written by the mutators
#[async_trait]
pub trait LogRepository: Send + Sync {
    async fn list_by_user(
        &self,
        scope: &TenantScope,
        user_id: UserId,
        limit: i64,
    ) -> DbResult<Vec<QuotaLog>>;
}

/// Liveness probe of the backing store
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn ping(&self) -> DbResult<()>;
}
