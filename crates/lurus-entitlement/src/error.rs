//! Entitlement errors

use lurus_auth_core::AuthError;
use lurus_db::DbError;
use lurus_types::{ErrorCode, ValidationError};
use thiserror::Error;

use crate::webhook::WebhookError;

/// Errors raised by the ledger, the subscription state machine and the
/// payment gateways
#[derive(Error, Debug)]
pub enum EntitlementError {
    #[error("User not found")]
    UserNotFound,

    #[error("Subscription not found")]
    SubscriptionNotFound,

    #[error("Plan not found or disabled: {0}")]
    PlanNotFound(String),

    #[error("{0}")]
    UserExists(String),

    #[error("User is disabled")]
    UserDisabled,

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("insufficient quota: balance {balance}, requested {requested}")]
    InsufficientQuota { balance: i64, requested: i64 },

    /// The payment gateway is not configured on this deployment
    #[error("{0} is not configured")]
    GatewayDisabled(&'static str),

    /// A payment gateway call failed
    #[error("payment gateway error: {0}")]
    Gateway(String),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error("database error: {0}")]
    Database(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EntitlementError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UserNotFound => ErrorCode::UserNotFound,
            Self::SubscriptionNotFound => ErrorCode::NotFound,
            Self::PlanNotFound(_) | Self::Validation(_) => ErrorCode::ValidationFailed,
            Self::UserExists(_) => ErrorCode::UserExists,
            Self::UserDisabled | Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::InvalidState(_) | Self::GatewayDisabled(_) => ErrorCode::InvalidState,
            Self::InsufficientQuota { .. } => ErrorCode::InsufficientQuota,
            Self::Webhook(err) => err.code(),
            Self::Gateway(_) | Self::Database(_) | Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        self.code().http_status()
    }

    /// Get error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            // Disabled accounts keep their own code even though they map to 403
            Self::UserDisabled => ErrorCode::UserDisabled.as_str(),
            _ => self.code().as_str(),
        }
    }

    /// Whether retrying the operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Gateway(_))
    }
}

impl From<ValidationError> for EntitlementError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err.0)
    }
}

impl From<DbError> for EntitlementError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound => Self::UserNotFound,
            DbError::Conflict(msg) => Self::Conflict(msg),
            DbError::InvalidState(msg) => Self::InvalidState(msg),
            DbError::InsufficientQuota { balance, requested } => {
                Self::InsufficientQuota { balance, requested }
            }
            DbError::Sqlx(_) => {
                tracing::error!(error = %err, "Database error");
                Self::Database(err.to_string())
            }
        }
    }
}

impl From<AuthError> for EntitlementError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Validation(msg) => Self::Validation(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}
