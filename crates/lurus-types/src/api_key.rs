//! Internal service API key types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{TenantId, UserId, ValidationError};

/// Internal API key ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiKeyId(pub i64);

impl ApiKeyId {
    pub fn parse(s: &str) -> Option<Self> {
        s.parse::<i64>().ok().filter(|id| *id > 0).map(Self)
    }
}

impl std::fmt::Display for ApiKeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Prefix of every raw internal API key
pub const API_KEY_PREFIX: &str = "lurus_ik_";

/// Number of random characters after the prefix
pub const API_KEY_RANDOM_LEN: usize = 32;

/// Length of the display prefix kept in storage
pub const API_KEY_DISPLAY_PREFIX_LEN: usize = 16;

/// Scope granting every capability
pub const WILDCARD_SCOPE: &str = "*";

/// The fixed scope vocabulary
pub const KNOWN_SCOPES: &[&str] = &[
    "user:read",
    "user:write",
    "user:delete",
    "subscription:read",
    "subscription:write",
    "quota:read",
    "quota:write",
    "balance:read",
    "balance:write",
    "token:read",
    "token:write",
    "auth:login",
    WILDCARD_SCOPE,
];

/// Whether `scopes` grants `scope`
pub fn has_scope<S: AsRef<str>>(scopes: &[S], scope: &str) -> bool {
    scopes
        .iter()
        .any(|s| s.as_ref() == scope || s.as_ref() == WILDCARD_SCOPE)
}

/// Whether `scopes` contains the wildcard
pub fn contains_wildcard<S: AsRef<str>>(scopes: &[S]) -> bool {
    scopes.iter().any(|s| s.as_ref() == WILDCARD_SCOPE)
}

/// Reject empty scope sets and anything outside the vocabulary
pub fn validate_scopes<S: AsRef<str>>(scopes: &[S]) -> Result<(), ValidationError> {
    if scopes.is_empty() {
        return Err(ValidationError::new("At least one scope is required"));
    }
    if let Some(unknown) = scopes
        .iter()
        .map(AsRef::as_ref)
        .find(|s| !KNOWN_SCOPES.contains(s))
    {
        return Err(ValidationError::new(format!("Unknown scope: {unknown}")));
    }
    Ok(())
}

/// Internal API key as stored; the raw key is never persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: ApiKeyId,
    /// `None` for platform-wide keys
    pub tenant_id: Option<TenantId>,
    pub name: String,
    /// Lowercase SHA-256 hex of the raw key
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub key_prefix: String,
    pub scopes: Vec<String>,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Epoch seconds; 0 means never
    pub expires_at: i64,
    pub enabled: bool,
    pub description: String,
}

impl ApiKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at != 0 && self.expires_at <= now.timestamp()
    }

    /// Enabled and not expired
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.enabled && !self.is_expired(now)
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        has_scope(&self.scopes, scope)
    }
}

/// Admin request to mint a key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateApiKeyRequest {
    pub name: String,
    pub scopes: Vec<String>,
    #[serde(default)]
    pub description: String,
    /// Epoch seconds; 0 or absent means never
    #[serde(default)]
    pub expires_at: i64,
    /// Bind the key to one tenant; absent means platform-wide
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// Admin request to modify a key
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateApiKeyRequest {
    pub name: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub description: Option<String>,
    pub expires_at: Option<i64>,
    pub enabled: Option<bool>,
}

/// Response to a mint: the only time the raw key is returned
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateApiKeyResponse {
    pub id: ApiKeyId,
    pub key: String,
    pub key_prefix: String,
    pub name: String,
    pub scopes: Vec<String>,
    pub expires_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(scopes: &[&str], enabled: bool, expires_at: i64) -> ApiKey {
        ApiKey {
            id: ApiKeyId(1),
            tenant_id: None,
            name: "svc".into(),
            key_hash: "00".repeat(32),
            key_prefix: "lurus_ik_abcdefg".into(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            created_by: None,
            created_at: Utc::now(),
            last_used_at: None,
            expires_at,
            enabled,
            description: String::new(),
        }
    }

    #[test]
    fn wildcard_grants_anything() {
        let k = key(&["*"], true, 0);
        assert!(k.has_scope("quota:write"));
        assert!(k.has_scope("not-a-scope"));
    }

    #[test]
    fn explicit_scopes_only() {
        let k = key(&["user:read"], true, 0);
        assert!(k.has_scope("user:read"));
        assert!(!k.has_scope("user:write"));
    }

    #[test]
    fn validity_honours_enabled_and_expiry() {
        let now = Utc::now();
        assert!(key(&["user:read"], true, 0).is_valid(now));
        assert!(!key(&["user:read"], false, 0).is_valid(now));
        assert!(!key(&["user:read"], true, now.timestamp() - 1).is_valid(now));
        assert!(key(&["user:read"], true, now.timestamp() + 60).is_valid(now));
    }

    #[test]
    fn scope_vocabulary() {
        assert!(validate_scopes(&["user:read", "*"]).is_ok());
        assert!(validate_scopes::<&str>(&[]).is_err());
        let err = validate_scopes(&["user:admin"]).unwrap_err();
        assert!(err.0.contains("user:admin"));
    }

    #[test]
    fn hash_is_not_serialized() {
        let json = serde_json::to_value(key(&["user:read"], true, 0)).unwrap();
        assert!(json.get("key_hash").is_none());
        assert_eq!(json["key_prefix"], "lurus_ik_abcdefg");
    }
}
