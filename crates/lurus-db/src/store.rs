//! Repository bundle and tenant-bound data handle

use std::sync::Arc;

use chrono::{DateTime, Utc};
use lurus_types::{
    DailyQuotaInfo, InvitationCode, NewSubscription, Pagination, PaymentMethod, PaymentTransition,
    PostConsume, PreConsume, RelayToken, Subscription, SubscriptionId, TenantId, User, UserId,
    UserUpdate,
};
use sqlx::PgPool;

use crate::error::{DbError, DbResult};
use crate::memory::MemoryStore;
use crate::models::QuotaLog;
use crate::pg::{
    PgApiKeyRepository, PgHealthCheck, PgIdentityRepository, PgInvitationRepository,
    PgLogRepository, PgOptionRepository, PgRelayTokenRepository, PgSubscriptionRepository,
    PgTenantConfigRepository, PgTenantRepository, PgUserRepository,
};
use crate::repo::{
    ApiKeyRepository, CreateRelayToken, CreateUser, HealthCheck, IdentityRepository,
    InvitationRepository, LogRepository, OptionRepository, PaymentConfirmation, QuotaAdjustment,
    RelayTokenRepository, SubscriptionRepository, TenantConfigRepository, TenantRepository,
    UserRepository,
};
use crate::scope::TenantScope;

/// All repositories behind one cloneable handle
#[derive(Clone)]
pub struct Store {
    pub tenants: Arc<dyn TenantRepository>,
    pub users: Arc<dyn UserRepository>,
    pub identities: Arc<dyn IdentityRepository>,
    pub subscriptions: Arc<dyn SubscriptionRepository>,
    pub api_keys: Arc<dyn ApiKeyRepository>,
    pub invitations: Arc<dyn InvitationRepository>,
    pub relay_tokens: Arc<dyn RelayTokenRepository>,
    pub tenant_configs: Arc<dyn TenantConfigRepository>,
    pub options: Arc<dyn OptionRepository>,
    pub logs: Arc<dyn LogRepository>,
    pub health: Arc<dyn HealthCheck>,
}

impl Store {
    /// Repositories backed by PostgreSQL
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            tenants: Arc::new(PgTenantRepository::new(pool.clone())),
            users: Arc::new(PgUserRepository::new(pool.clone())),
            identities: Arc::new(PgIdentityRepository::new(pool.clone())),
            subscriptions: Arc::new(PgSubscriptionRepository::new(pool.clone())),
            api_keys: Arc::new(PgApiKeyRepository::new(pool.clone())),
            invitations: Arc::new(PgInvitationRepository::new(pool.clone())),
            relay_tokens: Arc::new(PgRelayTokenRepository::new(pool.clone())),
            tenant_configs: Arc::new(PgTenantConfigRepository::new(pool.clone())),
            options: Arc::new(PgOptionRepository::new(pool.clone())),
            logs: Arc::new(PgLogRepository::new(pool.clone())),
            health: Arc::new(PgHealthCheck::new(pool)),
        }
    }

    /// Repositories backed by a fresh in-memory store
    pub fn memory() -> Self {
        Self::from_memory(MemoryStore::new())
    }

    /// Repositories sharing an existing in-memory store
    pub fn from_memory(store: MemoryStore) -> Self {
        let shared = Arc::new(store);
        Self {
            tenants: shared.clone(),
            users: shared.clone(),
            identities: shared.clone(),
            subscriptions: shared.clone(),
            api_keys: shared.clone(),
            invitations: shared.clone(),
            relay_tokens: shared.clone(),
            tenant_configs: shared.clone(),
            options: shared.clone(),
            logs: shared.clone(),
            health: shared,
        }
    }

    /// Handle confined to one tenant's rows
    pub fn for_tenant(&self, tenant: TenantId) -> TenantDb {
        TenantDb {
            store: self.clone(),
            scope: TenantScope::Tenant(tenant),
        }
    }

    /// Unfiltered handle for background jobs, payment webhooks and platform
    /// administrators
    pub fn system(&self) -> TenantDb {
        TenantDb {
            store: self.clone(),
            scope: TenantScope::System,
        }
    }
}

/// Data handle bound to a [`TenantScope`].
///
/// Every read filters on the bound tenant and every insert is stamped with
/// it, so request handlers cannot reach another tenant's rows.
#[derive(Clone)]
pub struct TenantDb {
    store: Store,
    scope: TenantScope,
}

impl TenantDb {
    pub fn scope(&self) -> &TenantScope {
        &self.scope
    }

    /// The bound tenant; `None` on the system handle
    pub fn tenant_id(&self) -> Option<&TenantId> {
        self.scope.tenant()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Tenant that owns rows created for `user_id`
    async fn owning_tenant(&self, user_id: UserId) -> DbResult<TenantId> {
        match &self.scope {
            TenantScope::Tenant(id) => Ok(id.clone()),
            TenantScope::System => self
                .store
                .users
                .find_by_id(&self.scope, user_id)
                .await?
                .map(|u| u.tenant_id)
                .ok_or(DbError::NotFound),
        }
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    pub async fn find_user(&self, id: UserId) -> DbResult<Option<User>> {
        self.store.users.find_by_id(&self.scope, id).await
    }

    pub async fn find_user_by_username(&self, username: &str) -> DbResult<Option<User>> {
        self.store.users.find_by_username(&self.scope, username).await
    }

    pub async fn find_user_by_email(&self, email: &str) -> DbResult<Option<User>> {
        self.store.users.find_by_email(&self.scope, email).await
    }

    pub async fn find_user_by_phone(&self, phone: &str) -> DbResult<Option<User>> {
        self.store.users.find_by_phone(&self.scope, phone).await
    }

    /// Insert a user. A tenant handle overrides the requested tenant.
    pub async fn create_user(&self, mut user: CreateUser) -> DbResult<User> {
        if let TenantScope::Tenant(id) = &self.scope {
            user.tenant_id = id.clone();
        }
        self.store.users.create(user).await
    }

    pub async fn update_user(&self, id: UserId, update: &UserUpdate) -> DbResult<Option<User>> {
        self.store.users.update(&self.scope, id, update).await
    }

    pub async fn set_password_hash(&self, id: UserId, hash: &str) -> DbResult<bool> {
        self.store.users.set_password_hash(&self.scope, id, hash).await
    }

    pub async fn delete_user(&self, id: UserId) -> DbResult<bool> {
        self.store.users.delete(&self.scope, id).await
    }

    pub async fn adjust_quota(&self, id: UserId, adjustment: QuotaAdjustment) -> DbResult<i64> {
        self.store.users.adjust_quota(&self.scope, id, adjustment).await
    }

    pub async fn pre_consume(
        &self,
        id: UserId,
        delta: i64,
        now: DateTime<Utc>,
    ) -> DbResult<(PreConsume, DailyQuotaInfo)> {
        self.store.users.pre_consume(&self.scope, id, delta, now).await
    }

    pub async fn post_consume(
        &self,
        id: UserId,
        amount: i64,
        now: DateTime<Utc>,
    ) -> DbResult<PostConsume> {
        self.store.users.post_consume(&self.scope, id, amount, now).await
    }

    pub async fn reset_daily(&self, id: UserId, now: DateTime<Utc>) -> DbResult<bool> {
        self.store.users.reset_daily(&self.scope, id, now).await
    }

    pub async fn quota_logs(&self, user_id: UserId, limit: i64) -> DbResult<Vec<QuotaLog>> {
        self.store.logs.list_by_user(&self.scope, user_id, limit).await
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    pub async fn find_subscription(&self, id: SubscriptionId) -> DbResult<Option<Subscription>> {
        self.store.subscriptions.find_by_id(&self.scope, id).await
    }

    pub async fn find_subscription_by_payment_id(
        &self,
        payment_id: &str,
    ) -> DbResult<Option<Subscription>> {
        self.store
            .subscriptions
            .find_by_payment_id(&self.scope, payment_id)
            .await
    }

    pub async fn list_subscriptions(
        &self,
        user_id: UserId,
        limit: i64,
    ) -> DbResult<Vec<Subscription>> {
        self.store
            .subscriptions
            .list_by_user(&self.scope, user_id, limit)
            .await
    }

    pub async fn active_subscriptions(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<Subscription>> {
        self.store
            .subscriptions
            .list_active(&self.scope, user_id, now)
            .await
    }

    pub async fn create_pending_subscription(
        &self,
        sub: NewSubscription,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription> {
        let tenant = self.owning_tenant(sub.user_id).await?;
        self.store.subscriptions.create_pending(&tenant, sub, now).await
    }

    pub async fn confirm_payment(
        &self,
        id: SubscriptionId,
        payment: PaymentConfirmation,
    ) -> DbResult<(Subscription, PaymentTransition)> {
        self.store
            .subscriptions
            .confirm_payment(&self.scope, id, payment)
            .await
    }

    pub async fn attach_payment(
        &self,
        id: SubscriptionId,
        owner: UserId,
        payment_id: &str,
        method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription> {
        self.store
            .subscriptions
            .attach_payment(&self.scope, id, owner, payment_id, method, now)
            .await
    }

    pub async fn expire_pending_subscription(
        &self,
        id: SubscriptionId,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription> {
        self.store
            .subscriptions
            .expire_pending(&self.scope, id, now)
            .await
    }

    pub async fn grant_subscription(
        &self,
        sub: NewSubscription,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription> {
        let tenant = self.owning_tenant(sub.user_id).await?;
        self.store.subscriptions.grant(&tenant, sub, now).await
    }

    pub async fn cancel_subscription(
        &self,
        id: SubscriptionId,
        owner: Option<UserId>,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription> {
        self.store
            .subscriptions
            .cancel(&self.scope, id, owner, now)
            .await
    }

    pub async fn refund_by_payment_id(
        &self,
        payment_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription> {
        self.store
            .subscriptions
            .refund_by_payment_id(&self.scope, payment_id, now)
            .await
    }

    pub async fn renew_subscription(
        &self,
        id: SubscriptionId,
        days: i64,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription> {
        self.store.subscriptions.renew(&self.scope, id, days, now).await
    }

    // ------------------------------------------------------------------
    // Invitations and relay tokens
    // ------------------------------------------------------------------

    pub async fn create_invitations(
        &self,
        created_by: UserId,
        codes: Vec<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> DbResult<Vec<InvitationCode>> {
        let tenant = self.owning_tenant(created_by).await?;
        self.store
            .invitations
            .create_many(&tenant, created_by, codes, expires_at)
            .await
    }

    pub async fn find_invitation(&self, code: &str) -> DbResult<Option<InvitationCode>> {
        self.store.invitations.find_by_code(&self.scope, code).await
    }

    pub async fn list_invitations(
        &self,
        prefix: Option<&str>,
        page: &Pagination,
    ) -> DbResult<(Vec<InvitationCode>, i64)> {
        self.store.invitations.list(&self.scope, prefix, page).await
    }

    pub async fn delete_invitation(&self, id: i64) -> DbResult<bool> {
        self.store.invitations.delete_unused(&self.scope, id).await
    }

    pub async fn redeem_invitation(
        &self,
        code: &str,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> DbResult<InvitationCode> {
        self.store
            .invitations
            .redeem(&self.scope, code, user_id, now)
            .await
    }

    pub async fn list_relay_tokens(
        &self,
        user_id: UserId,
        page: &Pagination,
    ) -> DbResult<(Vec<RelayToken>, i64)> {
        self.store
            .relay_tokens
            .list_by_user(&self.scope, user_id, page)
            .await
    }

    pub async fn find_relay_token(
        &self,
        user_id: UserId,
        name: &str,
    ) -> DbResult<Option<RelayToken>> {
        self.store
            .relay_tokens
            .find_by_user_and_name(&self.scope, user_id, name)
            .await
    }

    pub async fn create_relay_token(&self, mut token: CreateRelayToken) -> DbResult<RelayToken> {
        token.tenant_id = self.owning_tenant(token.user_id).await?;
        self.store.relay_tokens.create(token).await
    }
}
