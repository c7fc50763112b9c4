//! Invitation codes gating `invite_only` registration

use chrono::{DateTime, Utc};
use lurus_db::TenantDb;
use lurus_types::{
    validate_invitation_code, CreateInvitationRequest, InvitationCode, InvitationState,
    Pagination, UserId, INVITATION_CODE_LEN,
};
use tracing::instrument;

use crate::crypto::random_hex;
use crate::AuthError;

/// 8 random bytes as 16 lowercase hex characters
pub fn generate_invitation_code() -> String {
    random_hex(INVITATION_CODE_LEN / 2)
}

/// Mint a batch of codes in the handle's tenant
#[instrument(skip(db, request), fields(count = request.count))]
pub async fn create_invitations(
    db: &TenantDb,
    actor: UserId,
    request: &CreateInvitationRequest,
    now: DateTime<Utc>,
) -> Result<Vec<InvitationCode>, AuthError> {
    request.validate()?;
    let codes = (0..request.count).map(|_| generate_invitation_code()).collect();
    let created = db
        .create_invitations(actor, codes, request.expires_at(now))
        .await?;
    tracing::info!(actor = %actor, count = created.len(), "Invitation codes created");
    Ok(created)
}

/// Look up a code without consuming it
pub async fn check_invitation(
    db: &TenantDb,
    code: &str,
    now: DateTime<Utc>,
) -> Result<InvitationCode, AuthError> {
    validate_invitation_code(code)?;
    let invitation = db
        .find_invitation(code)
        .await?
        .ok_or_else(|| AuthError::NotFound("Invitation code not found".into()))?;
    match invitation.state(now) {
        InvitationState::Valid => Ok(invitation),
        InvitationState::Used => Err(AuthError::Conflict("Invitation code already used".into())),
        InvitationState::Expired => Err(AuthError::InvalidState("Invitation code expired".into())),
    }
}

/// Consume a code for `user_id`; exactly one concurrent caller wins
#[instrument(skip(db, code))]
pub async fn redeem_invitation(
    db: &TenantDb,
    code: &str,
    user_id: UserId,
    now: DateTime<Utc>,
) -> Result<InvitationCode, AuthError> {
    validate_invitation_code(code)?;
    db.redeem_invitation(code, user_id, now)
        .await
        .map_err(|e| match e {
            lurus_db::DbError::NotFound => AuthError::NotFound("Invitation code not found".into()),
            other => other.into(),
        })
}

pub async fn list_invitations(
    db: &TenantDb,
    prefix: Option<&str>,
    page: &Pagination,
) -> Result<(Vec<InvitationCode>, i64), AuthError> {
    let prefix = prefix.map(str::trim).filter(|p| !p.is_empty());
    Ok(db.list_invitations(prefix, &page.normalized()).await?)
}

/// Delete an unused code
pub async fn delete_invitation(db: &TenantDb, id: i64) -> Result<(), AuthError> {
    if db.delete_invitation(id).await? {
        Ok(())
    } else {
        Err(AuthError::NotFound("Invitation code not found".into()))
    }
}
