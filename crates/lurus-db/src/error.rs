//! Database errors

use thiserror::Error;

/// Database errors
#[derive(Error, Debug)]
pub enum DbError {
    /// SQLx error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Record not found
    #[error("record not found")]
    NotFound,

    /// A uniqueness rule was violated
    #[error("conflict: {0}")]
    Conflict(String),

    /// The row is not in a state that allows the operation
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A debit would drive the balance below zero
    #[error("insufficient quota: balance {balance}, requested {requested}")]
    InsufficientQuota { balance: i64, requested: i64 },
}

impl DbError {
    /// Map a unique violation onto [`DbError::Conflict`], passing other
    /// errors through
    pub fn from_unique(err: sqlx::Error, what: &str) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict(format!("{what} already exists"))
            }
            _ => Self::Sqlx(err),
        }
    }

    /// Error for an invitation code that could not be redeemed
    pub fn invitation(state: lurus_types::InvitationState) -> Self {
        use lurus_types::InvitationState;
        match state {
            InvitationState::Used => Self::Conflict("invitation code already used".into()),
            InvitationState::Expired => Self::InvalidState("invitation code expired".into()),
            InvitationState::Valid => Self::InvalidState("invitation code not redeemed".into()),
        }
    }
}

impl From<lurus_types::TransitionError> for DbError {
    fn from(err: lurus_types::TransitionError) -> Self {
        Self::InvalidState(err.to_string())
    }
}

/// Result type for database operations
pub type DbResult<T> = Result<T, DbError>;
