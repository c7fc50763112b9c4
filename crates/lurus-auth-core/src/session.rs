//! Session cookies with HMAC signing
//!
//! The cookie value is `base64url(json payload) "." base64url(hmac)`. It is
//! stateless: logout clears the cookie on the client and expiry is carried
//! in the payload.

use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use lurus_types::{Principal, Role, TenantId, User, UserId};
use serde::{Deserialize, Serialize};

use crate::crypto::{constant_time_eq, HmacKey, HmacKeyError};
use crate::AuthError;

/// Name of the session cookie
pub const SESSION_COOKIE_NAME: &str = "session";

/// Session cookie payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPayload {
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub role: Role,
    /// Expiry, epoch seconds
    pub exp: i64,
}

impl SessionPayload {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.exp
    }

    pub fn principal(&self) -> Principal {
        Principal::session(self.tenant_id.clone(), self.user_id, self.role)
    }
}

/// Signs and validates session cookies
#[derive(Clone)]
pub struct SessionManager {
    /// Pre-validated HMAC key for efficient signing
    hmac_key: HmacKey,
    duration: Duration,
}

impl SessionManager {
    /// Create a new session manager.
    ///
    /// # Errors
    /// Fails if `secret` is shorter than 32 bytes.
    pub fn new(secret: impl AsRef<[u8]>, duration: Duration) -> Result<Self, HmacKeyError> {
        Ok(Self {
            hmac_key: HmacKey::new(secret)?,
            duration,
        })
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Issue a signed cookie value for `user`
    pub fn issue(&self, user: &User, now: DateTime<Utc>) -> Result<(String, SessionPayload), AuthError> {
        let payload = SessionPayload {
            user_id: user.id,
            tenant_id: user.tenant_id.clone(),
            role: user.role,
            exp: now.timestamp() + self.duration.as_secs() as i64,
        };
        let cookie = self.sign_payload(&payload)?;
        Ok((cookie, payload))
    }

    /// Validate a signed session cookie
    pub fn validate_cookie(&self, cookie: &str, now: DateTime<Utc>) -> Result<SessionPayload, AuthError> {
        let (payload_b64, signature) = cookie.rsplit_once('.').ok_or(AuthError::InvalidToken)?;

        let expected_sig = self.compute_signature(payload_b64);
        if !constant_time_eq(signature.as_bytes(), expected_sig.as_bytes()) {
            tracing::debug!("Session signature mismatch");
            return Err(AuthError::InvalidToken);
        }

        let payload_json = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| AuthError::InvalidToken)?;
        let payload: SessionPayload =
            serde_json::from_slice(&payload_json).map_err(|_| AuthError::InvalidToken)?;

        if payload.is_expired(now) {
            return Err(AuthError::TokenExpired);
        }

        Ok(payload)
    }

    /// `Set-Cookie` value carrying a fresh session
    pub fn set_cookie(&self, value: &str) -> String {
        format!(
            "{SESSION_COOKIE_NAME}={value}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
            self.duration.as_secs()
        )
    }

    /// `Set-Cookie` value that removes the session
    pub fn clear_cookie(&self) -> String {
        format!("{SESSION_COOKIE_NAME}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax")
    }

    fn sign_payload(&self, payload: &SessionPayload) -> Result<String, AuthError> {
        let payload_json = serde_json::to_vec(payload).map_err(|e| {
            tracing::error!(error = %e, "Failed to serialize session payload");
            AuthError::Internal("Failed to create session".to_string())
        })?;

        let payload_b64 = URL_SAFE_NO_PAD.encode(&payload_json);
        let signature = self.compute_signature(&payload_b64);

        Ok(format!("{payload_b64}.{signature}"))
    }

    fn compute_signature(&self, data: &str) -> String {
        URL_SAFE_NO_PAD.encode(self.hmac_key.sign(data.as_bytes()))
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("duration", &self.duration)
            .finish_non_exhaustive()
    }
}

/// Pull the session cookie out of a `Cookie` header value
pub fn session_from_cookie_header(header: &str) -> Option<&str> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE_NAME)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}
