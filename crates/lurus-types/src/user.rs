//! User types

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{DailyQuotaState, TenantId, ValidationError};

/// Pricing group assigned to users without an active plan
pub const DEFAULT_GROUP: &str = "default";

/// Unique user identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl UserId {
    /// Parse a user ID from a path segment; only positive integers are valid
    pub fn parse(s: &str) -> Option<Self> {
        s.parse::<i64>().ok().filter(|id| *id > 0).map(Self)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Coarse privilege level of a user.
///
/// The ordering matters: `Common < Admin < Root`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Common,
    Admin,
    Root,
}

impl Role {
    /// Numeric code persisted in the `users.role` column
    pub const fn code(&self) -> i32 {
        match self {
            Self::Common => 1,
            Self::Admin => 10,
            Self::Root => 100,
        }
    }

    /// Decode a persisted role; unknown values degrade to `Common`
    pub fn from_code(code: i32) -> Self {
        match code {
            c if c >= 100 => Self::Root,
            c if c >= 10 => Self::Admin,
            _ => Self::Common,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Common => "common",
            Self::Admin => "admin",
            Self::Root => "root",
        }
    }

    pub fn is_admin(&self) -> bool {
        *self >= Self::Admin
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Enabled,
    Disabled,
}

impl UserStatus {
    pub const fn code(&self) -> i32 {
        match self {
            Self::Enabled => 1,
            Self::Disabled => 2,
        }
    }

    pub fn from_code(code: i32) -> Self {
        if code == 1 {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }
}

/// A user together with its entitlement ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub tenant_id: TenantId,
    pub username: String,
    /// Argon2 PHC string; `None` for OIDC-only accounts
    #[serde(skip)]
    pub password_hash: Option<String>,
    pub display_name: String,
    pub email: String,
    pub phone: String,
    pub phone_verified: bool,
    pub role: Role,
    pub status: UserStatus,
    /// Effective pricing group
    pub group: String,
    pub base_group: String,
    pub fallback_group: String,
    pub quota: i64,
    pub used_quota: i64,
    pub daily_quota: i64,
    pub daily_used: i64,
    /// Epoch seconds of the last daily reset
    pub last_daily_reset: i64,
    pub aff_code: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_enabled(&self) -> bool {
        self.status == UserStatus::Enabled
    }

    /// Snapshot of the daily quota fields
    pub fn daily_state(&self) -> DailyQuotaState {
        DailyQuotaState {
            daily_quota: self.daily_quota,
            daily_used: self.daily_used,
            last_daily_reset: self.last_daily_reset,
            group: self.group.clone(),
            base_group: self.base_group.clone(),
            fallback_group: self.fallback_group.clone(),
        }
    }

    /// Write a daily quota state back onto the user
    pub fn apply_daily_state(&mut self, state: DailyQuotaState) {
        self.daily_quota = state.daily_quota;
        self.daily_used = state.daily_used;
        self.last_daily_reset = state.last_daily_reset;
        self.group = state.group;
        self.base_group = state.base_group;
        self.fallback_group = state.fallback_group;
    }
}

/// Sparse update applied by `update_user`; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserUpdate {
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: Option<UserStatus>,
    pub group: Option<String>,
}

impl UserUpdate {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none()
            && self.email.is_none()
            && self.phone.is_none()
            && self.status.is_none()
            && self.group.is_none()
    }
}

static USERNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]{3,20}$").expect("static username pattern"));

static CN_PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^1[3-9]\d{9}$").expect("static phone pattern"));

/// Minimum password length accepted at account creation
pub const MIN_PASSWORD_LEN: usize = 8;

/// Validate a username: 3-20 characters of `[A-Za-z0-9_]`
pub fn validate_username(username: &str) -> Result<(), ValidationError> {
    let len = username.chars().count();
    if !(3..=20).contains(&len) {
        return Err(ValidationError::new("Username must be 3-20 characters"));
    }
    if !USERNAME_RE.is_match(username) {
        return Err(ValidationError::new("Username contains invalid characters"));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), ValidationError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ValidationError::new("Password must be at least 8 characters"));
    }
    Ok(())
}

/// Email is optional; when present it must contain `@`
pub fn validate_email(email: &str) -> Result<(), ValidationError> {
    if !email.is_empty() && !email.contains('@') {
        return Err(ValidationError::new("Invalid email format"));
    }
    Ok(())
}

/// Mainland China mobile number check
pub fn is_valid_chinese_phone(phone: &str) -> bool {
    CN_PHONE_RE.is_match(phone)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ordering() {
        assert!(Role::Common < Role::Admin);
        assert!(Role::Admin < Role::Root);
        assert!(Role::Root.is_admin());
        assert!(!Role::Common.is_admin());
    }

    #[test]
    fn role_codes_roundtrip() {
        for role in [Role::Common, Role::Admin, Role::Root] {
            assert_eq!(Role::from_code(role.code()), role);
        }
        assert_eq!(Role::from_code(0), Role::Common);
    }

    #[test]
    fn user_id_parse_rejects_non_positive() {
        assert_eq!(UserId::parse("42"), Some(UserId(42)));
        assert_eq!(UserId::parse("0"), None);
        assert_eq!(UserId::parse("-3"), None);
        assert_eq!(UserId::parse("abc"), None);
    }

    #[test]
    fn username_rules() {
        assert!(validate_username("alice_01").is_ok());
        assert!(validate_username("ab").is_err());
        assert!(validate_username("a".repeat(21).as_str()).is_err());
        assert!(validate_username("bad-name").is_err());
    }

    #[test]
    fn password_and_email_rules() {
        assert!(validate_password("12345678").is_ok());
        assert!(validate_password("1234567").is_err());
        assert!(validate_email("").is_ok());
        assert!(validate_email("a@b.c").is_ok());
        assert!(validate_email("nope").is_err());
    }

    #[test]
    fn phone_regex() {
        assert!(is_valid_chinese_phone("13800138000"));
        assert!(is_valid_chinese_phone("19912345678"));
        assert!(!is_valid_chinese_phone("12800138000"));
        assert!(!is_valid_chinese_phone("1380013800"));
        assert!(!is_valid_chinese_phone("+8613800138000"));
    }
}
