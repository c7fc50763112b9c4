//! Auth errors

use lurus_db::DbError;
use lurus_types::{ErrorCode, ValidationError};
use thiserror::Error;

/// Authentication and authorisation errors
#[derive(Error, Debug)]
pub enum AuthError {
    /// Bad credentials; never says which part was wrong
    #[error("invalid credentials")]
    AuthFailed,

    /// Credentials were right but the account is locked out
    #[error("user account is disabled")]
    UserDisabled,

    #[error("user not found")]
    UserNotFound,

    #[error("token expired")]
    TokenExpired,

    #[error("invalid token signature")]
    InvalidSignature,

    /// Malformed token, wrong issuer or unknown key
    #[error("invalid token")]
    InvalidToken,

    /// The request carried no credentials of a recognised kind
    #[error("no supported credentials presented")]
    UnknownPlane,

    #[error("tenant is disabled")]
    TenantDisabled,

    #[error("tenant not found")]
    TenantNotFound,

    /// Missing scope or role; the message names the required capability
    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Validation(String),

    #[error("Invalid or expired verification code")]
    InvalidCode,

    #[error("{0}")]
    RegistrationClosed(String),

    #[error("{0}")]
    UserExists(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    NotFound(String),

    #[error("please wait {retry_after_secs} seconds before requesting another code")]
    RateLimited { retry_after_secs: u64 },

    /// An identity provider or SMS gateway failed
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Code carried in the response envelope
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AuthFailed | Self::InvalidToken | Self::TenantNotFound => ErrorCode::AuthFailed,
            Self::UserDisabled => ErrorCode::UserDisabled,
            Self::UserNotFound => ErrorCode::UserNotFound,
            Self::TokenExpired => ErrorCode::Expired,
            Self::InvalidSignature => ErrorCode::InvalidSignature,
            Self::UnknownPlane => ErrorCode::UnknownPlane,
            Self::TenantDisabled => ErrorCode::TenantDisabled,
            Self::Forbidden(_) | Self::RegistrationClosed(_) => ErrorCode::Forbidden,
            Self::Validation(_) | Self::InvalidCode => ErrorCode::ValidationFailed,
            Self::UserExists(_) => ErrorCode::UserExists,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::InvalidState(_) => ErrorCode::InvalidState,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::Upstream(_)
            | Self::Database(_)
            | Self::Configuration(_)
            | Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        self.code().http_status()
    }

    /// Get error code for API responses
    pub fn error_code(&self) -> &'static str {
        self.code().as_str()
    }

    pub fn forbidden_scope(scope: &str) -> Self {
        Self::Forbidden(format!("Insufficient permissions, required scope: {scope}"))
    }

    pub fn forbidden_role(role: &str) -> Self {
        Self::Forbidden(format!("Insufficient permissions, required role: {role}"))
    }
}

impl From<ValidationError> for AuthError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err.0)
    }
}

impl From<DbError> for AuthError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound => Self::NotFound("record not found".into()),
            DbError::Conflict(msg) => Self::Conflict(msg),
            DbError::InvalidState(msg) => Self::InvalidState(msg),
            DbError::InsufficientQuota { .. } => Self::InvalidState(err.to_string()),
            DbError::Sqlx(_) => {
                tracing::error!(error = %err, "Database error");
                Self::Database(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_failures_are_401() {
        for err in [
            AuthError::AuthFailed,
            AuthError::UserDisabled,
            AuthError::TokenExpired,
            AuthError::InvalidSignature,
            AuthError::UnknownPlane,
        ] {
            assert_eq!(err.status_code(), 401, "{err:?}");
        }
        assert_eq!(AuthError::UserDisabled.error_code(), "USER_DISABLED");
        assert_eq!(AuthError::TokenExpired.error_code(), "EXPIRED");
    }

    #[test]
    fn authorisation_failures_are_403() {
        let err = AuthError::forbidden_scope("quota:write");
        assert_eq!(err.status_code(), 403);
        assert_eq!(err.error_code(), "FORBIDDEN");
        assert!(err.to_string().contains("quota:write"));
        assert_eq!(AuthError::TenantDisabled.status_code(), 403);
        assert_eq!(AuthError::TenantDisabled.error_code(), "TENANT_DISABLED");
    }

    #[test]
    fn db_errors_map_onto_envelope_codes() {
        let conflict: AuthError = DbError::Conflict("phone already exists".into()).into();
        assert_eq!(conflict.status_code(), 409);

        let used: AuthError = DbError::invitation(lurus_types::InvitationState::Used).into();
        assert_eq!(used.error_code(), "CONFLICT");

        let expired: AuthError = DbError::invitation(lurus_types::InvitationState::Expired).into();
        assert_eq!(expired.status_code(), 400);
    }

    #[test]
    fn invalid_code_message() {
        assert_eq!(
            AuthError::InvalidCode.to_string(),
            "Invalid or expired verification code"
        );
        assert_eq!(AuthError::InvalidCode.status_code(), 400);
    }
}
