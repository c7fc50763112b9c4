//! Per-user relay tokens
//!
//! Relay tokens are the `sk-` keys end users hand to LLM clients. The core
//! only issues and lists them; metering happens in the relay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{TenantId, UserId, ValidationError};

/// Prefix of a raw relay token
pub const RELAY_TOKEN_PREFIX: &str = "sk-";

/// Number of random characters after the prefix
pub const RELAY_TOKEN_RANDOM_LEN: usize = 48;

/// Relay token status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayTokenStatus {
    Enabled,
    Disabled,
    Expired,
    Exhausted,
}

impl RelayTokenStatus {
    pub const fn code(&self) -> i32 {
        match self {
            Self::Enabled => 1,
            Self::Disabled => 2,
            Self::Expired => 3,
            Self::Exhausted => 4,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Enabled,
            3 => Self::Expired,
            4 => Self::Exhausted,
            _ => Self::Disabled,
        }
    }
}

/// A relay token as stored; only the hash of the raw key is kept
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayToken {
    pub id: i64,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub name: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub key_prefix: String,
    pub status: RelayTokenStatus,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    pub used_quota: i64,
    /// Epoch seconds; -1 never expires
    pub expired_time: i64,
    pub group: String,
    pub created_at: DateTime<Utc>,
}

/// Request body of `POST /internal/token`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRelayTokenRequest {
    pub user_id: UserId,
    pub name: String,
    #[serde(default)]
    pub unlimited_quota: bool,
    #[serde(default)]
    pub remain_quota: i64,
}

impl CreateRelayTokenRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let name = self.name.trim();
        if name.is_empty() || name.chars().count() > 50 {
            return Err(ValidationError::new("Token name must be 1-50 characters"));
        }
        if self.remain_quota < 0 {
            return Err(ValidationError::new("remain_quota must not be negative"));
        }
        Ok(())
    }
}
