//! Invitation code types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{TenantId, UserId, ValidationError};

/// Length of an invitation code in hex characters
pub const INVITATION_CODE_LEN: usize = 16;

/// Upper bound on codes minted per admin request
pub const MAX_INVITATION_BATCH: usize = 100;

/// A one-shot registration invitation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationCode {
    pub id: i64,
    pub tenant_id: TenantId,
    pub code: String,
    pub created_by: UserId,
    pub used_by: Option<UserId>,
    pub used_at: Option<DateTime<Utc>>,
    /// `None` never expires
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Why an invitation cannot be used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationState {
    Valid,
    Used,
    Expired,
}

impl InvitationCode {
    pub fn state(&self, now: DateTime<Utc>) -> InvitationState {
        if self.used_by.is_some() {
            return InvitationState::Used;
        }
        match self.expires_at {
            Some(expires) if expires <= now => InvitationState::Expired,
            _ => InvitationState::Valid,
        }
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.state(now) == InvitationState::Valid
    }

    /// Consume the code for `user`
    pub fn redeem(&mut self, user: UserId, now: DateTime<Utc>) -> InvitationState {
        let state = self.state(now);
        if state == InvitationState::Valid {
            self.used_by = Some(user);
            self.used_at = Some(now);
        }
        state
    }
}

/// Shape check for user-supplied codes: 16 lowercase hex characters
pub fn validate_invitation_code(code: &str) -> Result<(), ValidationError> {
    let ok = code.len() == INVITATION_CODE_LEN
        && code.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if ok {
        Ok(())
    } else {
        Err(ValidationError::new("Invalid invitation code"))
    }
}

/// Admin request to mint invitation codes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInvitationRequest {
    pub count: usize,
    /// Lifetime in seconds; absent or non-positive never expires
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl CreateInvitationRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.count == 0 || self.count > MAX_INVITATION_BATCH {
            return Err(ValidationError::new("count must be between 1 and 100"));
        }
        Ok(())
    }

    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_in
            .filter(|secs| *secs > 0)
            .map(|secs| now + chrono::Duration::seconds(secs))
    }
}
