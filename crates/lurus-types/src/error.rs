//! Common error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error codes carried in the `error_code` field of the
/// response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthFailed,
    UserDisabled,
    UserNotFound,
    UserExists,
    ValidationFailed,
    Forbidden,
    Conflict,
    InsufficientQuota,
    InvalidState,
    TenantDisabled,
    Expired,
    InvalidSignature,
    UnknownPlane,
    RateLimited,
    NotFound,
    Internal,
}

impl ErrorCode {
    /// Wire representation of the code
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AuthFailed => "AUTH_FAILED",
            Self::UserDisabled => "USER_DISABLED",
            Self::UserNotFound => "USER_NOT_FOUND",
            Self::UserExists => "USER_EXISTS",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::Forbidden => "FORBIDDEN",
            Self::Conflict => "CONFLICT",
            Self::InsufficientQuota => "INSUFFICIENT_QUOTA",
            Self::InvalidState => "INVALID_STATE",
            Self::TenantDisabled => "TENANT_DISABLED",
            Self::Expired => "EXPIRED",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::UnknownPlane => "UNKNOWN_PLANE",
            Self::RateLimited => "RATE_LIMITED",
            Self::NotFound => "NOT_FOUND",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    /// Default HTTP status for the code
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::AuthFailed
            | Self::UserDisabled
            | Self::Expired
            | Self::InvalidSignature
            | Self::UnknownPlane => 401,
            Self::Forbidden | Self::TenantDisabled => 403,
            Self::ValidationFailed | Self::InvalidState | Self::InsufficientQuota => 400,
            Self::UserNotFound | Self::NotFound => 404,
            Self::UserExists | Self::Conflict => 409,
            Self::RateLimited => 429,
            Self::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input validation failure with a human-readable reason
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Illegal state transition on a domain object
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot {action} while {state}")]
pub struct TransitionError {
    /// Attempted transition
    pub action: &'static str,
    /// State the object was in
    pub state: String,
}
