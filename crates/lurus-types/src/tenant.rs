//! Tenant types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tenant used by legacy endpoints that carry no tenant information
pub const DEFAULT_TENANT_ID: &str = "default";

/// Opaque tenant identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The default tenant
    pub fn default_tenant() -> Self {
        Self(DEFAULT_TENANT_ID.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Tenant lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Enabled,
    Disabled,
    Suspended,
}

impl TenantStatus {
    pub const fn code(&self) -> i32 {
        match self {
            Self::Enabled => 1,
            Self::Disabled => 2,
            Self::Suspended => 3,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Enabled,
            3 => Self::Suspended,
            _ => Self::Disabled,
        }
    }
}

/// An isolation boundary, mapped 1:1 to an identity-provider organisation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub external_org_id: String,
    pub slug: String,
    pub name: String,
    pub status: TenantStatus,
    pub plan_type: String,
    pub max_users: i32,
    pub max_quota: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn is_enabled(&self) -> bool {
        self.status == TenantStatus::Enabled
    }
}

/// Turn an organisation domain or name into a URL-safe slug.
///
/// Lowercases, maps every run of non-alphanumeric characters to a single
/// `-`, trims dashes and caps the result at 64 characters.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut dash = false;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            dash = false;
        } else if !dash && !slug.is_empty() {
            slug.push('-');
            dash = true;
        }
    }
    let trimmed = slug.trim_end_matches('-');
    trimmed.chars().take(64).collect()
}

/// Value type of a tenant config row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    String,
    Int,
    Bool,
    Float,
    Json,
}

impl ConfigType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Bool => "bool",
            Self::Float => "float",
            Self::Json => "json",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(Self::String),
            "int" => Some(Self::Int),
            "bool" => Some(Self::Bool),
            "float" => Some(Self::Float),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// Check that `value` parses as this type
    pub fn accepts(&self, value: &str) -> bool {
        match self {
            Self::String => true,
            Self::Int => value.parse::<i64>().is_ok(),
            Self::Bool => value.parse::<bool>().is_ok(),
            Self::Float => value.parse::<f64>().is_ok(),
            Self::Json => serde_json::from_str::<serde_json::Value>(value).is_ok(),
        }
    }
}

/// Per-tenant key/value configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: TenantId,
    pub key: String,
    pub value: String,
    pub value_type: ConfigType,
    /// System rows are read-only to tenant admins
    pub is_system: bool,
    pub is_encrypted: bool,
    pub updated_at: DateTime<Utc>,
}

/// Config rows seeded for every new tenant: `(key, value, type, is_system)`.
///
/// `registration_mode` and `sms_auto_register` are not seeded; when absent
/// the process-wide settings apply.
pub const DEFAULT_TENANT_CONFIGS: &[(&str, &str, ConfigType, bool)] = &[
    ("quota.new_user_quota", "0", ConfigType::Int, false),
    ("billing.currency", "CNY", ConfigType::String, false),
    ("features.enable_subscriptions", "true", ConfigType::Bool, true),
    ("features.enable_oauth", "true", ConfigType::Bool, true),
];
