//! Password hashing using Argon2id.

use std::sync::LazyLock;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};

use crate::AuthError;

/// Hash verified when the user does not exist, so a miss costs as much as a
/// wrong password.
static DUMMY_HASH: LazyLock<Option<String>> = LazyLock::new(|| {
    let salt = SaltString::encode_b64(b"lurus-dummy-salt").ok()?;
    Argon2::default()
        .hash_password(b"lurus-dummy-password", &salt)
        .ok()
        .map(|h| h.to_string())
});

/// Hash a plaintext password into PHC format
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| {
            tracing::error!(error = %e, "Password hashing failed");
            AuthError::Internal("Failed to hash password".into())
        })
}

/// Verify a plaintext password against a PHC-format hash.
///
/// A malformed stored hash counts as a mismatch.
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        tracing::warn!("Stored password hash is malformed");
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Burn the same work as a real verification and return `false`
pub fn verify_dummy(password: &str) -> bool {
    if let Some(hash) = DUMMY_HASH.as_deref() {
        let _ = verify_password(password, hash);
    }
    false
}

/// [`hash_password`] off the async executor
pub async fn hash_password_async(password: String) -> Result<String, AuthError> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| AuthError::Internal(format!("hashing task failed: {e}")))?
}

/// Verify `password` against `hash`, or against the dummy hash when the
/// account has none. Runs off the async executor.
pub async fn verify_password_async(password: String, hash: Option<String>) -> bool {
    tokio::task::spawn_blocking(move || match hash {
        Some(hash) => verify_password(&password, &hash),
        None => verify_dummy(&password),
    })
    .await
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correct_password_matches() {
        let hash = hash_password("hunter2hunter2").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("hunter2hunter2", &hash));
    }

    #[test]
    fn wrong_password_does_not_match() {
        let hash = hash_password("hunter2hunter2").unwrap();
        assert!(!verify_password("wrong-password", &hash));
    }

    #[test]
    fn malformed_hash_does_not_match() {
        assert!(!verify_password("pw", "not-a-hash"));
    }

    #[test]
    fn dummy_never_matches() {
        assert!(DUMMY_HASH.is_some());
        assert!(!verify_dummy("lurus-dummy-password"));
    }

    #[tokio::test]
    async fn async_wrappers() {
        let hash = hash_password_async("correct horse".into()).await.unwrap();
        assert!(verify_password_async("correct horse".into(), Some(hash)).await);
        assert!(!verify_password_async("correct horse".into(), None).await);
    }
}
