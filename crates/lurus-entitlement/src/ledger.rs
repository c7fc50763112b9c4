//! Entitlement store mutators
//!
//! Balance changes, service-driven account creation and the quota
//! snapshots read by the relay. Every operation runs against a
//! [`TenantDb`], so the caller's tenant binding decides which rows are
//! reachable.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use lurus_auth_core::crypto::random_alphanumeric;
use lurus_auth_core::password::hash_password_async;
use lurus_db::{CreateUser, DbError, LogKind, QuotaAdjustment, TenantDb};
use lurus_types::{
    validate_email, validate_password, validate_username, DailyQuotaInfo, Role, User, UserId,
    UserUpdate, DEFAULT_GROUP,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::EntitlementConfig;
use crate::EntitlementError;

const AFF_CODE_LEN: usize = 8;

/// Result of a balance adjustment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaChange {
    pub user_id: UserId,
    pub old_quota: i64,
    pub adjustment: i64,
    pub new_quota: i64,
}

/// Result of an RMB top-up
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopUp {
    pub user_id: UserId,
    pub old_balance: i64,
    /// Tokens credited
    pub amount: i64,
    pub amount_rmb: f64,
    pub new_balance: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Balance {
    pub user_id: UserId,
    pub balance: i64,
    pub balance_rmb: f64,
    pub used_quota: i64,
}

/// Quota fields of a user as served to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaInfo {
    pub user_id: UserId,
    pub quota: i64,
    pub used_quota: i64,
    pub daily_quota: i64,
    pub daily_used: i64,
    pub last_daily_reset: i64,
    pub group: String,
    pub base_group: String,
    pub fallback_group: String,
}

impl From<&User> for QuotaInfo {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id,
            quota: user.quota,
            used_quota: user.used_quota,
            daily_quota: user.daily_quota,
            daily_used: user.daily_used,
            last_daily_reset: user.last_daily_reset,
            group: user.group.clone(),
            base_group: user.base_group.clone(),
            fallback_group: user.fallback_group.clone(),
        }
    }
}

/// Account creation request from a trusted service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewAccount {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub quota: i64,
}

/// A created or replayed account
#[derive(Debug, Clone)]
pub struct AccountOutcome {
    pub user: User,
    /// The idempotency key matched an existing account
    pub is_duplicate: bool,
}

fn user_not_found(err: DbError) -> EntitlementError {
    match err {
        DbError::NotFound => EntitlementError::UserNotFound,
        other => other.into(),
    }
}

/// Quota and account mutators
#[derive(Clone)]
pub struct Ledger {
    config: Arc<EntitlementConfig>,
}

impl Ledger {
    pub fn new(config: Arc<EntitlementConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EntitlementConfig {
        &self.config
    }

    async fn user(&self, db: &TenantDb, user_id: UserId) -> Result<User, EntitlementError> {
        db.find_user(user_id).await?.ok_or(EntitlementError::UserNotFound)
    }

    /// Add `delta` to the balance and record a `system` log entry.
    ///
    /// A negative delta may not take the balance below zero unless
    /// `allow_negative` is set.
    #[instrument(skip(self, db, reason), fields(tenant_id = ?db.tenant_id()))]
    pub async fn adjust_quota(
        &self,
        db: &TenantDb,
        user_id: UserId,
        delta: i64,
        reason: &str,
        allow_negative: bool,
    ) -> Result<QuotaChange, EntitlementError> {
        if delta == 0 {
            return Err(EntitlementError::Validation("Adjustment amount must not be zero".into()));
        }
        let content = if reason.trim().is_empty() {
            format!("Quota adjusted by {delta}")
        } else {
            reason.trim().to_string()
        };

        let new_quota = db
            .adjust_quota(
                user_id,
                QuotaAdjustment {
                    delta,
                    allow_negative,
                    kind: LogKind::System,
                    content,
                },
            )
            .await
            .map_err(user_not_found)?;

        info!(%user_id, delta, new_quota, reason, "Quota adjusted");
        Ok(QuotaChange {
            user_id,
            old_quota: new_quota - delta,
            adjustment: delta,
            new_quota,
        })
    }

    /// Credit an RMB payment at the configured token rate
    #[instrument(skip(self, db, reason), fields(tenant_id = ?db.tenant_id()))]
    pub async fn top_up(
        &self,
        db: &TenantDb,
        user_id: UserId,
        amount_rmb: f64,
        order_id: Option<&str>,
        reason: &str,
    ) -> Result<TopUp, EntitlementError> {
        if !amount_rmb.is_finite() || amount_rmb <= 0.0 {
            return Err(EntitlementError::Validation("amount_rmb must be positive".into()));
        }
        let amount = self.config.rmb_to_quota(amount_rmb);
        if amount <= 0 {
            return Err(EntitlementError::Validation("amount_rmb is too small".into()));
        }

        let mut content = format!("Top-up {amount_rmb:.2} RMB");
        if let Some(order) = order_id.filter(|o| !o.is_empty()) {
            content.push_str(&format!(" (order {order})"));
        }
        if !reason.trim().is_empty() {
            content.push_str(&format!(": {}", reason.trim()));
        }

        let new_balance = db
            .adjust_quota(
                user_id,
                QuotaAdjustment {
                    delta: amount,
                    allow_negative: false,
                    kind: LogKind::Topup,
                    content,
                },
            )
            .await
            .map_err(user_not_found)?;

        info!(%user_id, amount, amount_rmb, order_id, "Balance topped up");
        Ok(TopUp {
            user_id,
            old_balance: new_balance - amount,
            amount,
            amount_rmb,
            new_balance,
        })
    }

    pub async fn balance(&self, db: &TenantDb, user_id: UserId) -> Result<Balance, EntitlementError> {
        let user = self.user(db, user_id).await?;
        Ok(Balance {
            user_id,
            balance: user.quota,
            balance_rmb: self.config.quota_to_rmb(user.quota),
            used_quota: user.used_quota,
        })
    }

    pub async fn quota_info(&self, db: &TenantDb, user_id: UserId) -> Result<QuotaInfo, EntitlementError> {
        Ok(QuotaInfo::from(&self.user(db, user_id).await?))
    }

    /// Snapshot used by the daily quota engine
    pub async fn get_daily_quota_info(
        &self,
        db: &TenantDb,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<DailyQuotaInfo, EntitlementError> {
        Ok(self.user(db, user_id).await?.daily_state().info(now))
    }

    /// Create an account for a trusted service.
    ///
    /// With an idempotency key, an existing account of the same username is
    /// returned as a duplicate instead of failing.
    #[instrument(skip(self, db, account), fields(tenant_id = ?db.tenant_id(), username = %account.username))]
    pub async fn create_user(
        &self,
        db: &TenantDb,
        account: NewAccount,
        idempotency_key: Option<&str>,
    ) -> Result<AccountOutcome, EntitlementError> {
        let username = account.username.trim().to_string();
        validate_username(&username)?;
        validate_password(&account.password)?;
        let email = account.email.trim().to_string();
        validate_email(&email)?;
        if account.quota < 0 {
            return Err(EntitlementError::Validation("Quota must not be negative".into()));
        }

        if let Some(existing) = db.find_user_by_username(&username).await? {
            if idempotency_key.is_some_and(|k| !k.is_empty()) {
                info!(user_id = %existing.id, "Replayed account creation");
                return Ok(AccountOutcome {
                    user: existing,
                    is_duplicate: true,
                });
            }
            return Err(EntitlementError::UserExists("Username already exists".into()));
        }
        if !email.is_empty() && db.find_user_by_email(&email).await?.is_some() {
            return Err(EntitlementError::UserExists("Email already exists".into()));
        }

        let password_hash = hash_password_async(account.password).await?;
        let group = Some(account.group.trim())
            .filter(|g| !g.is_empty())
            .unwrap_or(DEFAULT_GROUP)
            .to_string();
        let display_name = Some(account.display_name.trim())
            .filter(|d| !d.is_empty())
            .unwrap_or(&username)
            .to_string();
        let tenant_id = db
            .tenant_id()
            .cloned()
            .ok_or_else(|| EntitlementError::Internal("account creation needs a tenant".into()))?;

        let user = db
            .create_user(CreateUser {
                tenant_id,
                username,
                password_hash: Some(password_hash),
                display_name,
                email,
                phone: String::new(),
                phone_verified: false,
                role: Role::Common,
                group,
                quota: account.quota,
                aff_code: random_alphanumeric(AFF_CODE_LEN),
            })
            .await
            .map_err(|e| match e {
                DbError::Conflict(msg) => EntitlementError::UserExists(msg),
                other => other.into(),
            })?;

        info!(user_id = %user.id, "Account created");
        Ok(AccountOutcome {
            user,
            is_duplicate: false,
        })
    }

    /// Delete an ordinary account; privileged accounts are protected
    #[instrument(skip(self, db), fields(tenant_id = ?db.tenant_id()))]
    pub async fn delete_user(&self, db: &TenantDb, user_id: UserId) -> Result<(), EntitlementError> {
        let user = self.user(db, user_id).await?;
        if user.role >= Role::Admin {
            warn!(%user_id, role = user.role.as_str(), "Refused to delete privileged user");
            return Err(EntitlementError::Forbidden("Cannot delete admin/root user".into()));
        }
        if !db.delete_user(user_id).await? {
            return Err(EntitlementError::UserNotFound);
        }
        info!(%user_id, "User deleted");
        Ok(())
    }

    /// Sparse update; setting `phone` also marks it verified
    #[instrument(skip(self, db, update), fields(tenant_id = ?db.tenant_id()))]
    pub async fn update_user(
        &self,
        db: &TenantDb,
        user_id: UserId,
        update: &UserUpdate,
    ) -> Result<User, EntitlementError> {
        if update.is_empty() {
            return Err(EntitlementError::Validation("No fields to update".into()));
        }
        if let Some(email) = &update.email {
            validate_email(email)?;
        }
        if let Some(group) = &update.group {
            if group.trim().is_empty() {
                return Err(EntitlementError::Validation("Group must not be empty".into()));
            }
        }
        db.update_user(user_id, update)
            .await
            .map_err(|e| match e {
                DbError::Conflict(msg) => EntitlementError::UserExists(msg),
                other => other.into(),
            })?
            .ok_or(EntitlementError::UserNotFound)
    }
}
