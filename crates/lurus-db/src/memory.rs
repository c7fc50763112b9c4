//! In-memory repository implementations
//!
//! Backs local development when no `DATABASE_URL` is configured, and the test
//! suites. Every mutator runs under one store-wide write guard, which stands
//! in for the row locks of the PostgreSQL implementation; reads go straight
//! to the maps.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lurus_types::{
    apply_activation, release_entitlement, ApiKey, ApiKeyId, DailyQuotaInfo, InvitationCode,
    InvitationState, NewSubscription, Pagination, PaymentMethod, PaymentTransition, PostConsume,
    PreConsume, RelayToken, RelayTokenStatus, Subscription, SubscriptionId, SubscriptionStatus, Tenant,
    TenantConfig, TenantId, TenantStatus, User, UserId, UserStatus, UserUpdate,
    DEFAULT_TENANT_CONFIGS,
};
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use crate::models::{IdentityMapping, LogKind, QuotaLog};
use crate::repo::{
    ApiKeyRepository, ApiKeyUpdate, CreateApiKey, CreateRelayToken, CreateTenant, CreateUser,
    HealthCheck, IdentityRepository, InvitationRepository, LogRepository, OptionRepository,
    PaymentConfirmation, QuotaAdjustment, RelayTokenRepository, SubscriptionRepository,
    TenantConfigRepository, TenantRepository, UserRepository,
};
use crate::scope::TenantScope;

#[derive(Default)]
struct Tables {
    tenants: DashMap<String, Tenant>,
    tenant_configs: DashMap<(String, String), TenantConfig>,
    users: DashMap<i64, User>,
    identities: DashMap<(String, String), IdentityMapping>,
    subscriptions: DashMap<i64, Subscription>,
    api_keys: DashMap<i64, ApiKey>,
    invitations: DashMap<i64, InvitationCode>,
    relay_tokens: DashMap<i64, RelayToken>,
    options: DashMap<String, String>,
    logs: DashMap<i64, QuotaLog>,
    seq: AtomicI64,
    write: Mutex<()>,
}

/// In-memory store implementing every repository trait
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Tables>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store holding only the default tenant
    pub fn new() -> Self {
        let store = Self {
            inner: Arc::new(Tables::default()),
        };
        let now = Utc::now();
        let default = TenantId::default_tenant();
        store.inner.tenants.insert(
            default.0.clone(),
            Tenant {
                id: default.clone(),
                external_org_id: default.0.clone(),
                slug: default.0.clone(),
                name: "Default".to_string(),
                status: TenantStatus::Enabled,
                plan_type: "free".to_string(),
                max_users: 0,
                max_quota: 0,
                created_at: now,
                updated_at: now,
            },
        );
        store.seed_configs(&default, now);
        store
    }

    fn seed_configs(&self, tenant: &TenantId, now: DateTime<Utc>) {
        for (key, value, value_type, is_system) in DEFAULT_TENANT_CONFIGS {
            self.inner
                .tenant_configs
                .entry((tenant.0.clone(), key.to_string()))
                .or_insert_with(|| TenantConfig {
                    tenant_id: tenant.clone(),
                    key: key.to_string(),
                    value: value.to_string(),
                    value_type: *value_type,
                    is_system: *is_system,
                    is_encrypted: false,
                    updated_at: now,
                });
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.inner.write.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self) -> i64 {
        self.inner.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn user(&self, scope: &TenantScope, id: UserId) -> Option<User> {
        self.inner
            .users
            .get(&id.0)
            .map(|u| u.value().clone())
            .filter(|u| scope.allows(&u.tenant_id))
    }

    fn put_user(&self, user: User) {
        self.inner.users.insert(user.id.0, user);
    }

    fn find_user(&self, scope: &TenantScope, pred: impl Fn(&User) -> bool) -> Option<User> {
        self.inner
            .users
            .iter()
            .filter(|u| scope.allows(&u.tenant_id) && pred(u.value()))
            .min_by_key(|u| u.id)
            .map(|u| u.value().clone())
    }

    fn check_user_unique(
        &self,
        tenant: &TenantId,
        username: &str,
        phone: &str,
        email: &str,
        except: Option<UserId>,
    ) -> DbResult<()> {
        let taken = self.inner.users.iter().any(|u| {
            Some(u.id) != except
                && &u.tenant_id == tenant
                && (u.username == username
                    || (!phone.is_empty() && u.phone == phone)
                    || (!email.is_empty() && u.email == email))
        });
        if taken {
            return Err(DbError::Conflict("user already exists".to_string()));
        }
        Ok(())
    }

    fn insert_user(&self, input: CreateUser) -> DbResult<User> {
        self.check_user_unique(&input.tenant_id, &input.username, &input.phone, &input.email, None)?;
        let user = User {
            id: UserId(self.next_id()),
            tenant_id: input.tenant_id,
            username: input.username,
            password_hash: input.password_hash,
            display_name: input.display_name,
            email: input.email,
            phone: input.phone,
            phone_verified: input.phone_verified,
            role: input.role,
            status: UserStatus::Enabled,
            group: input.group,
            base_group: String::new(),
            fallback_group: String::new(),
            quota: input.quota,
            used_quota: 0,
            daily_quota: 0,
            daily_used: 0,
            last_daily_reset: 0,
            aff_code: input.aff_code,
            created_at: Utc::now(),
        };
        self.put_user(user.clone());
        Ok(user)
    }

    fn log(&self, tenant: &TenantId, user: UserId, kind: LogKind, delta: i64, content: String) {
        let id = self.next_id();
        self.inner.logs.insert(
            id,
            QuotaLog {
                id,
                tenant_id: tenant.clone(),
                user_id: user,
                kind,
                delta,
                content,
                created_at: Utc::now(),
            },
        );
    }

    fn subscription(&self, scope: &TenantScope, id: SubscriptionId) -> Option<Subscription> {
        self.inner
            .subscriptions
            .get(&id.0)
            .map(|s| s.value().clone())
            .filter(|s| scope.allows(&s.tenant_id))
    }

    fn running(&self, user: UserId, now: DateTime<Utc>) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self
            .inner
            .subscriptions
            .iter()
            .filter(|s| {
                s.user_id == user && s.status == SubscriptionStatus::Active && s.expires_at > now
            })
            .map(|s| s.value().clone())
            .collect();
        subs.sort_by_key(|s| (s.started_at, s.id));
        subs
    }

    fn current_expiry(&self, user: UserId, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.running(user, now).iter().map(|s| s.expires_at).max()
    }

    fn release_user(&self, user: &mut User, released: SubscriptionId, now: DateTime<Utc>) {
        let successor = self
            .running(user.id, now)
            .into_iter()
            .find(|s| s.id != released);
        release_entitlement(user, successor.as_ref(), now);
    }

    fn store_subscription(&self, sub: &Subscription) -> DbResult<()> {
        if let Some(pid) = &sub.payment_id {
            let taken = self
                .inner
                .subscriptions
                .iter()
                .any(|s| s.id != sub.id && s.payment_id.as_deref() == Some(pid));
            if taken {
                return Err(DbError::Conflict("payment already exists".to_string()));
            }
        }
        self.inner.subscriptions.insert(sub.id.0, sub.clone());
        Ok(())
    }

    fn insert_subscription(
        &self,
        tenant_id: &TenantId,
        sub: &NewSubscription,
        status: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> Subscription {
        let (started_at, expires_at) = sub.period(now, self.current_expiry(sub.user_id, now));
        let created = Subscription {
            id: SubscriptionId(self.next_id()),
            tenant_id: tenant_id.clone(),
            user_id: sub.user_id,
            plan_code: sub.plan_code.clone(),
            plan_name: sub.plan_name.clone(),
            status,
            daily_quota: sub.daily_quota,
            total_quota: sub.total_quota,
            base_group: sub.base_group.clone(),
            fallback_group: sub.fallback_group.clone(),
            started_at,
            expires_at,
            payment_method: sub.payment_method.as_str().to_string(),
            payment_id: None,
            amount_cents: sub.amount_cents,
            currency: sub.currency.clone(),
            auto_renew: sub.auto_renew,
            created_at: now,
            updated_at: now,
        };
        self.inner.subscriptions.insert(created.id.0, created.clone());
        created
    }

    fn invitation_by_code(&self, scope: &TenantScope, code: &str) -> Option<InvitationCode> {
        self.inner
            .invitations
            .iter()
            .find(|i| i.code == code && scope.allows(&i.tenant_id))
            .map(|i| i.value().clone())
    }
}

fn paginate<T>(mut items: Vec<T>, page: &Pagination) -> (Vec<T>, i64) {
    let total = items.len() as i64;
    let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX);
    let limit = usize::try_from(page.limit()).unwrap_or(0);
    let items = if offset >= items.len() {
        Vec::new()
    } else {
        items.drain(offset..).take(limit).collect()
    };
    (items, total)
}

// ============================================================================
// Tenants
// ============================================================================

#[async_trait]
impl TenantRepository for MemoryStore {
    async fn find_by_id(&self, id: &TenantId) -> DbResult<Option<Tenant>> {
        Ok(self.inner.tenants.get(id.as_str()).map(|t| t.value().clone()))
    }

    async fn find_by_slug(&self, slug: &str) -> DbResult<Option<Tenant>> {
        Ok(self
            .inner
            .tenants
            .iter()
            .find(|t| t.slug == slug)
            .map(|t| t.value().clone()))
    }

    async fn find_by_external_org(&self, external_org_id: &str) -> DbResult<Option<Tenant>> {
        Ok(self
            .inner
            .tenants
            .iter()
            .find(|t| t.external_org_id == external_org_id)
            .map(|t| t.value().clone()))
    }

    async fn create(&self, tenant: CreateTenant) -> DbResult<Tenant> {
        let _guard = self.guard();
        let taken = self
            .inner
            .tenants
            .iter()
            .any(|t| t.slug == tenant.slug || t.external_org_id == tenant.external_org_id);
        if taken {
            return Err(DbError::Conflict("tenant already exists".to_string()));
        }

        let now = Utc::now();
        let created = Tenant {
            id: TenantId(Uuid::new_v4().simple().to_string()),
            external_org_id: tenant.external_org_id,
            slug: tenant.slug,
            name: tenant.name,
            status: TenantStatus::Enabled,
            plan_type: tenant.plan_type,
            max_users: tenant.max_users,
            max_quota: tenant.max_quota,
            created_at: now,
            updated_at: now,
        };
        self.inner.tenants.insert(created.id.0.clone(), created.clone());
        self.seed_configs(&created.id, now);
        Ok(created)
    }

    async fn list(&self, page: &Pagination) -> DbResult<(Vec<Tenant>, i64)> {
        let mut tenants: Vec<Tenant> = self.inner.tenants.iter().map(|t| t.value().clone()).collect();
        tenants.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(paginate(tenants, page))
    }

    async fn update_status(&self, id: &TenantId, status: TenantStatus) -> DbResult<bool> {
        let Some(mut tenant) = self.inner.tenants.get_mut(id.as_str()) else {
            return Ok(false);
        };
        tenant.status = status;
        tenant.updated_at = Utc::now();
        Ok(true)
    }
}

// ============================================================================
// Users
// ============================================================================

#[async_trait]
impl UserRepository for MemoryStore {
    async fn find_by_id(&self, scope: &TenantScope, id: UserId) -> DbResult<Option<User>> {
        Ok(self.user(scope, id))
    }

    async fn find_by_username(
        &self,
        scope: &TenantScope,
        username: &str,
    ) -> DbResult<Option<User>> {
        Ok(self.find_user(scope, |u| u.username == username))
    }

    async fn find_by_email(&self, scope: &TenantScope, email: &str) -> DbResult<Option<User>> {
        if email.is_empty() {
            return Ok(None);
        }
        Ok(self.find_user(scope, |u| u.email == email))
    }

    async fn find_by_phone(&self, scope: &TenantScope, phone: &str) -> DbResult<Option<User>> {
        if phone.is_empty() {
            return Ok(None);
        }
        Ok(self.find_user(scope, |u| u.phone == phone))
    }

    async fn create(&self, user: CreateUser) -> DbResult<User> {
        let _guard = self.guard();
        self.insert_user(user)
    }

    async fn update(
        &self,
        scope: &TenantScope,
        id: UserId,
        update: &UserUpdate,
    ) -> DbResult<Option<User>> {
        let _guard = self.guard();
        let Some(mut user) = self.user(scope, id) else {
            return Ok(None);
        };

        let phone = update.phone.as_deref().unwrap_or(&user.phone);
        let email = update.email.as_deref().unwrap_or(&user.email);
        let taken = self.inner.users.iter().any(|u| {
            u.id != id
                && u.tenant_id == user.tenant_id
                && ((!phone.is_empty() && u.phone == phone)
                    || (!email.is_empty() && u.email == email))
        });
        if taken {
            return Err(DbError::Conflict("phone or email already exists".to_string()));
        }

        if let Some(name) = &update.display_name {
            user.display_name = name.clone();
        }
        if let Some(email) = &update.email {
            user.email = email.clone();
        }
        if let Some(phone) = &update.phone {
            user.phone = phone.clone();
            user.phone_verified = true;
        }
        if let Some(status) = update.status {
            user.status = status;
        }
        if let Some(group) = &update.group {
            user.group = group.clone();
        }
        self.put_user(user.clone());
        Ok(Some(user))
    }

    async fn set_password_hash(
        &self,
        scope: &TenantScope,
        id: UserId,
        hash: &str,
    ) -> DbResult<bool> {
        let _guard = self.guard();
        let Some(mut user) = self.user(scope, id) else {
            return Ok(false);
        };
        user.password_hash = Some(hash.to_string());
        self.put_user(user);
        Ok(true)
    }

    async fn delete(&self, scope: &TenantScope, id: UserId) -> DbResult<bool> {
        let _guard = self.guard();
        if self.user(scope, id).is_none() {
            return Ok(false);
        }
        self.inner.users.remove(&id.0);
        self.inner.relay_tokens.retain(|_, t| t.user_id != id);
        let now = Utc::now();
        for mut sub in self.inner.subscriptions.iter_mut() {
            if sub.user_id == id && sub.status == SubscriptionStatus::Pending {
                sub.status = SubscriptionStatus::Cancelled;
                sub.auto_renew = false;
                sub.updated_at = now;
            }
        }
        Ok(true)
    }

    async fn adjust_quota(
        &self,
        scope: &TenantScope,
        id: UserId,
        adjustment: QuotaAdjustment,
    ) -> DbResult<i64> {
        let _guard = self.guard();
        let mut user = self.user(scope, id).ok_or(DbError::NotFound)?;
        let new_quota = user.quota.saturating_add(adjustment.delta);
        if adjustment.delta < 0 && new_quota < 0 && !adjustment.allow_negative {
            return Err(DbError::InsufficientQuota {
                balance: user.quota,
                requested: -adjustment.delta,
            });
        }
        user.quota = new_quota;
        let tenant = user.tenant_id.clone();
        self.put_user(user);
        self.log(&tenant, id, adjustment.kind, adjustment.delta, adjustment.content);
        Ok(new_quota)
    }

    async fn pre_consume(
        &self,
        scope: &TenantScope,
        id: UserId,
        delta: i64,
        now: DateTime<Utc>,
    ) -> DbResult<(PreConsume, DailyQuotaInfo)> {
        let _guard = self.guard();
        let mut user = self.user(scope, id).ok_or(DbError::NotFound)?;
        let mut state = user.daily_state();
        let outcome = state.pre_consume(delta, now);
        let info = state.info(now);
        if outcome.reset || outcome.switched_to_fallback {
            user.apply_daily_state(state);
            self.put_user(user);
        }
        Ok((outcome, info))
    }

    async fn post_consume(
        &self,
        scope: &TenantScope,
        id: UserId,
        amount: i64,
        now: DateTime<Utc>,
    ) -> DbResult<PostConsume> {
        let _guard = self.guard();
        let mut user = self.user(scope, id).ok_or(DbError::NotFound)?;
        let mut state = user.daily_state();
        let outcome = state.post_consume(amount, now);
        user.apply_daily_state(state);
        self.put_user(user);
        Ok(outcome)
    }

    async fn reset_daily(
        &self,
        scope: &TenantScope,
        id: UserId,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let _guard = self.guard();
        let Some(mut user) = self.user(scope, id) else {
            return Ok(false);
        };
        let mut state = user.daily_state();
        let reset = state.reset(now);
        if reset {
            user.apply_daily_state(state);
            self.put_user(user);
        }
        Ok(reset)
    }

    async fn find_needing_daily_reset(&self, day_start: i64, limit: i64) -> DbResult<Vec<UserId>> {
        let mut ids: Vec<UserId> = self
            .inner
            .users
            .iter()
            .filter(|u| u.daily_quota > 0 && u.last_daily_reset < day_start)
            .map(|u| u.id)
            .collect();
        ids.sort();
        ids.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(ids)
    }
}

// ============================================================================
// Identity mappings
// ============================================================================

#[async_trait]
impl IdentityRepository for MemoryStore {
    async fn find(
        &self,
        tenant_id: &TenantId,
        external_user_id: &str,
    ) -> DbResult<Option<IdentityMapping>> {
        Ok(self
            .inner
            .identities
            .get(&(tenant_id.0.clone(), external_user_id.to_string()))
            .map(|m| m.value().clone()))
    }

    async fn create_with_user(
        &self,
        user: CreateUser,
        external_user_id: &str,
    ) -> DbResult<(User, IdentityMapping)> {
        let _guard = self.guard();
        let key = (user.tenant_id.0.clone(), external_user_id.to_string());
        if self.inner.identities.contains_key(&key) {
            return Err(DbError::Conflict("identity mapping already exists".to_string()));
        }
        let created = self.insert_user(user)?;
        let mapping = IdentityMapping {
            tenant_id: created.tenant_id.0.clone(),
            external_user_id: external_user_id.to_string(),
            user_id: created.id.0,
            display_name: created.display_name.clone(),
            email: created.email.clone(),
            synced_at: Utc::now(),
        };
        self.inner.identities.insert(key, mapping.clone());
        Ok((created, mapping))
    }

    async fn sync(
        &self,
        tenant_id: &TenantId,
        external_user_id: &str,
        display_name: &str,
        email: &str,
    ) -> DbResult<()> {
        if let Some(mut mapping) = self
            .inner
            .identities
            .get_mut(&(tenant_id.0.clone(), external_user_id.to_string()))
        {
            mapping.display_name = display_name.to_string();
            mapping.email = email.to_string();
            mapping.synced_at = Utc::now();
        }
        Ok(())
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

#[async_trait]
impl SubscriptionRepository for MemoryStore {
    async fn find_by_id(
        &self,
        scope: &TenantScope,
        id: SubscriptionId,
    ) -> DbResult<Option<Subscription>> {
        Ok(self.subscription(scope, id))
    }

    async fn find_by_payment_id(
        &self,
        scope: &TenantScope,
        payment_id: &str,
    ) -> DbResult<Option<Subscription>> {
        Ok(self
            .inner
            .subscriptions
            .iter()
            .find(|s| s.payment_id.as_deref() == Some(payment_id) && scope.allows(&s.tenant_id))
            .map(|s| s.value().clone()))
    }

    async fn list_by_user(
        &self,
        scope: &TenantScope,
        user_id: UserId,
        limit: i64,
    ) -> DbResult<Vec<Subscription>> {
        let mut subs: Vec<Subscription> = self
            .inner
            .subscriptions
            .iter()
            .filter(|s| s.user_id == user_id && scope.allows(&s.tenant_id))
            .map(|s| s.value().clone())
            .collect();
        subs.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        subs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(subs)
    }

    async fn list_active(
        &self,
        scope: &TenantScope,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<Subscription>> {
        Ok(self
            .running(user_id, now)
            .into_iter()
            .filter(|s| scope.allows(&s.tenant_id))
            .collect())
    }

    async fn create_pending(
        &self,
        tenant_id: &TenantId,
        sub: NewSubscription,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription> {
        let _guard = self.guard();
        let scope = TenantScope::Tenant(tenant_id.clone());
        self.user(&scope, sub.user_id).ok_or(DbError::NotFound)?;

        let pending = self
            .inner
            .subscriptions
            .iter()
            .any(|s| s.user_id == sub.user_id && s.status == SubscriptionStatus::Pending);
        if pending {
            return Err(DbError::Conflict(
                "a pending subscription already exists".to_string(),
            ));
        }

        Ok(self.insert_subscription(tenant_id, &sub, SubscriptionStatus::Pending, now))
    }

    async fn confirm_payment(
        &self,
        scope: &TenantScope,
        id: SubscriptionId,
        payment: PaymentConfirmation,
    ) -> DbResult<(Subscription, PaymentTransition)> {
        let _guard = self.guard();
        let mut sub = self.subscription(scope, id).ok_or(DbError::NotFound)?;
        let owner_scope = TenantScope::Tenant(sub.tenant_id.clone());
        let mut user = self.user(&owner_scope, sub.user_id).ok_or(DbError::NotFound)?;

        let transition = sub.confirm_payment(&payment.payment_id, payment.method, payment.now)?;
        if transition == PaymentTransition::AlreadyActive {
            return Ok((sub, transition));
        }
        self.store_subscription(&sub)?;

        apply_activation(&mut user, &sub, payment.now);
        self.put_user(user);
        self.log(
            &sub.tenant_id,
            sub.user_id,
            LogKind::Subscription,
            sub.total_quota.max(0),
            format!(
                "activated plan {} via {} ({})",
                sub.plan_code, payment.method, payment.payment_id
            ),
        );
        Ok((sub, transition))
    }

    async fn attach_payment(
        &self,
        scope: &TenantScope,
        id: SubscriptionId,
        owner: UserId,
        payment_id: &str,
        method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription> {
        let _guard = self.guard();
        let mut sub = self
            .subscription(scope, id)
            .filter(|s| s.user_id == owner)
            .ok_or(DbError::NotFound)?;
        sub.attach_payment(payment_id, method, now)?;
        self.store_subscription(&sub)?;
        Ok(sub)
    }

    async fn expire_pending(
        &self,
        scope: &TenantScope,
        id: SubscriptionId,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription> {
        let _guard = self.guard();
        let mut sub = self.subscription(scope, id).ok_or(DbError::NotFound)?;
        if sub.status != SubscriptionStatus::Pending {
            return Err(DbError::InvalidState(format!(
                "cannot expire a {} subscription",
                sub.status
            )));
        }
        sub.expire(now)?;
        self.store_subscription(&sub)?;
        Ok(sub)
    }

    async fn grant(
        &self,
        tenant_id: &TenantId,
        sub: NewSubscription,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription> {
        let _guard = self.guard();
        let scope = TenantScope::Tenant(tenant_id.clone());
        let mut user = self.user(&scope, sub.user_id).ok_or(DbError::NotFound)?;

        let created = self.insert_subscription(tenant_id, &sub, SubscriptionStatus::Active, now);
        apply_activation(&mut user, &created, now);
        self.put_user(user);
        self.log(
            tenant_id,
            sub.user_id,
            LogKind::Subscription,
            created.total_quota.max(0),
            format!("granted plan {} for {} days", created.plan_code, sub.days),
        );
        Ok(created)
    }

    async fn expire_due(&self, now: DateTime<Utc>, limit: i64) -> DbResult<Vec<SubscriptionId>> {
        let _guard = self.guard();
        let mut due: Vec<Subscription> = self
            .inner
            .subscriptions
            .iter()
            .filter(|s| s.status == SubscriptionStatus::Active && s.expires_at < now)
            .map(|s| s.value().clone())
            .collect();
        due.sort_by_key(|s| (s.expires_at, s.id));
        due.truncate(usize::try_from(limit).unwrap_or(0));

        let mut expired = Vec::with_capacity(due.len());
        for mut sub in due {
            sub.expire(now)?;
            self.store_subscription(&sub)?;
            if let Some(mut user) = self.user(&TenantScope::System, sub.user_id) {
                self.release_user(&mut user, sub.id, now);
                self.put_user(user);
            }
            expired.push(sub.id);
        }
        Ok(expired)
    }

    async fn expire_stale_pending(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<u64> {
        let _guard = self.guard();
        let pending: Vec<(i64, UserId, DateTime<Utc>)> = self
            .inner
            .subscriptions
            .iter()
            .filter(|s| s.status == SubscriptionStatus::Pending)
            .map(|s| (s.id.0, s.user_id, s.created_at))
            .collect();

        let mut swept = 0;
        for (id, user_id, created_at) in &pending {
            let superseded = pending.iter().any(|(other, uid, _)| uid == user_id && other > id);
            if *created_at < cutoff || superseded {
                if let Some(mut sub) = self.inner.subscriptions.get_mut(id) {
                    sub.status = SubscriptionStatus::Expired;
                    sub.updated_at = now;
                    swept += 1;
                }
            }
        }
        Ok(swept)
    }

    async fn cancel(
        &self,
        scope: &TenantScope,
        id: SubscriptionId,
        owner: Option<UserId>,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription> {
        let _guard = self.guard();
        let mut sub = self.subscription(scope, id).ok_or(DbError::NotFound)?;
        if owner.is_some_and(|o| o != sub.user_id) {
            return Err(DbError::NotFound);
        }

        let was_active = sub.status == SubscriptionStatus::Active;
        sub.cancel(now)?;
        self.store_subscription(&sub)?;
        if was_active {
            if let Some(mut user) = self.user(&TenantScope::System, sub.user_id) {
                self.release_user(&mut user, id, now);
                self.put_user(user);
            }
        }
        Ok(sub)
    }

    async fn refund_by_payment_id(
        &self,
        scope: &TenantScope,
        payment_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription> {
        let _guard = self.guard();
        let mut sub = self
            .inner
            .subscriptions
            .iter()
            .find(|s| s.payment_id.as_deref() == Some(payment_id) && scope.allows(&s.tenant_id))
            .map(|s| s.value().clone())
            .ok_or(DbError::NotFound)?;
        if sub.status == SubscriptionStatus::Refunded {
            return Ok(sub);
        }

        let was_active = sub.status == SubscriptionStatus::Active;
        sub.refund(now)?;
        self.store_subscription(&sub)?;

        if let Some(mut user) = self.user(&TenantScope::System, sub.user_id) {
            if was_active {
                self.release_user(&mut user, sub.id, now);
            }
            let clawback = sub.total_quota.max(0).min(user.quota.max(0));
            user.quota -= clawback;
            self.put_user(user);
            self.log(
                &sub.tenant_id,
                sub.user_id,
                LogKind::Refund,
                -clawback,
                format!("refunded plan {} ({payment_id})", sub.plan_code),
            );
        }
        Ok(sub)
    }

    async fn renew(
        &self,
        scope: &TenantScope,
        id: SubscriptionId,
        days: i64,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription> {
        let _guard = self.guard();
        let mut sub = self.subscription(scope, id).ok_or(DbError::NotFound)?;
        sub.renew(days, now)?;
        self.store_subscription(&sub)?;
        Ok(sub)
    }

    async fn find_expiring(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
        auto_renew_only: bool,
        limit: i64,
    ) -> DbResult<Vec<Subscription>> {
        let mut subs: Vec<Subscription> = self
            .inner
            .subscriptions
            .iter()
            .filter(|s| {
                s.status == SubscriptionStatus::Active
                    && s.expires_at > now
                    && s.expires_at <= until
                    && (!auto_renew_only || s.auto_renew)
            })
            .map(|s| s.value().clone())
            .collect();
        subs.sort_by_key(|s| (s.expires_at, s.id));
        subs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(subs)
    }
}

// ============================================================================
// Credentials
// ============================================================================

#[async_trait]
impl ApiKeyRepository for MemoryStore {
    async fn find_by_hash(&self, key_hash: &str) -> DbResult<Option<ApiKey>> {
        Ok(self
            .inner
            .api_keys
            .iter()
            .find(|k| k.key_hash == key_hash)
            .map(|k| k.value().clone()))
    }

    async fn find_by_id(&self, id: ApiKeyId) -> DbResult<Option<ApiKey>> {
        Ok(self.inner.api_keys.get(&id.0).map(|k| k.value().clone()))
    }

    async fn list(&self, page: &Pagination) -> DbResult<(Vec<ApiKey>, i64)> {
        let mut keys: Vec<ApiKey> = self.inner.api_keys.iter().map(|k| k.value().clone()).collect();
        keys.sort_by(|a, b| b.id.0.cmp(&a.id.0));
        Ok(paginate(keys, page))
    }

    async fn list_wildcard(&self) -> DbResult<Vec<ApiKey>> {
        let mut keys: Vec<ApiKey> = self
            .inner
            .api_keys
            .iter()
            .filter(|k| lurus_types::contains_wildcard(&k.scopes))
            .map(|k| k.value().clone())
            .collect();
        keys.sort_by_key(|k| k.id.0);
        Ok(keys)
    }

    async fn create(&self, key: CreateApiKey) -> DbResult<ApiKey> {
        let _guard = self.guard();
        if self.inner.api_keys.iter().any(|k| k.key_hash == key.key_hash) {
            return Err(DbError::Conflict("api key already exists".to_string()));
        }
        let created = ApiKey {
            id: ApiKeyId(self.next_id()),
            tenant_id: key.tenant_id,
            name: key.name,
            key_hash: key.key_hash,
            key_prefix: key.key_prefix,
            scopes: key.scopes,
            created_by: key.created_by,
            created_at: Utc::now(),
            last_used_at: None,
            expires_at: key.expires_at,
            enabled: true,
            description: key.description,
        };
        self.inner.api_keys.insert(created.id.0, created.clone());
        Ok(created)
    }

    async fn update(&self, id: ApiKeyId, update: ApiKeyUpdate) -> DbResult<Option<ApiKey>> {
        let Some(mut key) = self.inner.api_keys.get_mut(&id.0) else {
            return Ok(None);
        };
        if let Some(name) = update.name {
            key.name = name;
        }
        if let Some(scopes) = update.scopes {
            key.scopes = scopes;
        }
        if let Some(description) = update.description {
            key.description = description;
        }
        if let Some(expires_at) = update.expires_at {
            key.expires_at = expires_at;
        }
        if let Some(enabled) = update.enabled {
            key.enabled = enabled;
        }
        Ok(Some(key.value().clone()))
    }

    async fn delete(&self, id: ApiKeyId) -> DbResult<bool> {
        Ok(self.inner.api_keys.remove(&id.0).is_some())
    }

    async fn touch_last_used(&self, id: ApiKeyId, at: DateTime<Utc>) -> DbResult<()> {
        if let Some(mut key) = self.inner.api_keys.get_mut(&id.0) {
            key.last_used_at = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl InvitationRepository for MemoryStore {
    async fn create_many(
        &self,
        tenant_id: &TenantId,
        created_by: UserId,
        codes: Vec<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> DbResult<Vec<InvitationCode>> {
        let _guard = self.guard();
        let taken = codes.iter().enumerate().any(|(i, code)| {
            codes[..i].contains(code) || self.inner.invitations.iter().any(|c| &c.code == code)
        });
        if taken {
            return Err(DbError::Conflict("invitation code already exists".to_string()));
        }

        let now = Utc::now();
        let created: Vec<InvitationCode> = codes
            .into_iter()
            .map(|code| InvitationCode {
                id: self.next_id(),
                tenant_id: tenant_id.clone(),
                code,
                created_by,
                used_by: None,
                used_at: None,
                expires_at,
                created_at: now,
            })
            .collect();
        for code in &created {
            self.inner.invitations.insert(code.id, code.clone());
        }
        Ok(created)
    }

    async fn find_by_code(
        &self,
        scope: &TenantScope,
        code: &str,
    ) -> DbResult<Option<InvitationCode>> {
        Ok(self.invitation_by_code(scope, code))
    }

    async fn list(
        &self,
        scope: &TenantScope,
        prefix: Option<&str>,
        page: &Pagination,
    ) -> DbResult<(Vec<InvitationCode>, i64)> {
        let mut codes: Vec<InvitationCode> = self
            .inner
            .invitations
            .iter()
            .filter(|c| {
                scope.allows(&c.tenant_id) && prefix.map_or(true, |p| c.code.starts_with(p))
            })
            .map(|c| c.value().clone())
            .collect();
        codes.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(paginate(codes, page))
    }

    async fn delete_unused(&self, scope: &TenantScope, id: i64) -> DbResult<bool> {
        let _guard = self.guard();
        let Some(code) = self
            .inner
            .invitations
            .get(&id)
            .map(|c| c.value().clone())
            .filter(|c| scope.allows(&c.tenant_id))
        else {
            return Ok(false);
        };
        if code.used_by.is_some() {
            return Err(DbError::InvalidState(
                "cannot delete a used invitation code".to_string(),
            ));
        }
        self.inner.invitations.remove(&id);
        Ok(true)
    }

    async fn redeem(
        &self,
        scope: &TenantScope,
        code: &str,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> DbResult<InvitationCode> {
        let _guard = self.guard();
        let mut invitation = self.invitation_by_code(scope, code).ok_or(DbError::NotFound)?;
        let state = invitation.redeem(user_id, now);
        if state != InvitationState::Valid {
            return Err(DbError::invitation(state));
        }
        self.inner.invitations.insert(invitation.id, invitation.clone());
        Ok(invitation)
    }
}

#[async_trait]
impl RelayTokenRepository for MemoryStore {
    async fn list_by_user(
        &self,
        scope: &TenantScope,
        user_id: UserId,
        page: &Pagination,
    ) -> DbResult<(Vec<RelayToken>, i64)> {
        let mut tokens: Vec<RelayToken> = self
            .inner
            .relay_tokens
            .iter()
            .filter(|t| t.user_id == user_id && scope.allows(&t.tenant_id))
            .map(|t| t.value().clone())
            .collect();
        tokens.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(paginate(tokens, page))
    }

    async fn find_by_user_and_name(
        &self,
        scope: &TenantScope,
        user_id: UserId,
        name: &str,
    ) -> DbResult<Option<RelayToken>> {
        Ok(self
            .inner
            .relay_tokens
            .iter()
            .filter(|t| t.user_id == user_id && t.name == name && scope.allows(&t.tenant_id))
            .min_by_key(|t| t.id)
            .map(|t| t.value().clone()))
    }

    async fn create(&self, token: CreateRelayToken) -> DbResult<RelayToken> {
        let _guard = self.guard();
        if self.inner.relay_tokens.iter().any(|t| t.key_hash == token.key_hash) {
            return Err(DbError::Conflict("relay token already exists".to_string()));
        }
        let created = RelayToken {
            id: self.next_id(),
            tenant_id: token.tenant_id,
            user_id: token.user_id,
            name: token.name,
            key_hash: token.key_hash,
            key_prefix: token.key_prefix,
            status: RelayTokenStatus::Enabled,
            remain_quota: token.remain_quota,
            unlimited_quota: token.unlimited_quota,
            used_quota: 0,
            expired_time: -1,
            group: token.group,
            created_at: Utc::now(),
        };
        self.inner.relay_tokens.insert(created.id, created.clone());
        Ok(created)
    }
}

// ============================================================================
// Configuration and logs
// ============================================================================

#[async_trait]
impl TenantConfigRepository for MemoryStore {
    async fn list(&self, tenant_id: &TenantId) -> DbResult<Vec<TenantConfig>> {
        let mut configs: Vec<TenantConfig> = self
            .inner
            .tenant_configs
            .iter()
            .filter(|c| &c.tenant_id == tenant_id)
            .map(|c| c.value().clone())
            .collect();
        configs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(configs)
    }

    async fn get(&self, tenant_id: &TenantId, key: &str) -> DbResult<Option<TenantConfig>> {
        Ok(self
            .inner
            .tenant_configs
            .get(&(tenant_id.0.clone(), key.to_string()))
            .map(|c| c.value().clone()))
    }

    async fn upsert(&self, mut config: TenantConfig) -> DbResult<TenantConfig> {
        config.updated_at = Utc::now();
        let key = (config.tenant_id.0.clone(), config.key.clone());
        if let Some(existing) = self.inner.tenant_configs.get(&key) {
            config.is_system = existing.is_system;
        }
        self.inner.tenant_configs.insert(key, config.clone());
        Ok(config)
    }
}

#[async_trait]
impl OptionRepository for MemoryStore {
    async fn get(&self, key: &str) -> DbResult<Option<String>> {
        Ok(self.inner.options.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> DbResult<()> {
        self.inner.options.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[async_trait]
impl LogRepository for MemoryStore {
    async fn list_by_user(
        &self,
        scope: &TenantScope,
        user_id: UserId,
        limit: i64,
    ) -> DbResult<Vec<QuotaLog>> {
        let mut logs: Vec<QuotaLog> = self
            .inner
            .logs
            .iter()
            .filter(|l| l.user_id == user_id && scope.allows(&l.tenant_id))
            .map(|l| l.value().clone())
            .collect();
        logs.sort_by(|a, b| b.id.cmp(&a.id));
        logs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(logs)
    }
}

#[async_trait]
impl HealthCheck for MemoryStore {
    async fn ping(&self) -> DbResult<()> {
        Ok(())
    }
}
