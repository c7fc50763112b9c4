//! Cryptographic primitives for credentials
//!
//! Everything that compares secrets goes through [`constant_time_eq`] so the
//! comparison time depends only on the length of the inputs.

use hmac::{Hmac, Mac};
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// HMAC-SHA256 keyed once and cloned per signature; signs session cookies
#[derive(Clone)]
pub struct HmacKey {
    mac: Hmac<Sha256>,
    key_len: usize,
}

impl HmacKey {
    /// `SESSION_SECRET` must carry at least 256 bits
    pub const MIN_KEY_LENGTH: usize = 32;

    pub fn new(key: impl AsRef<[u8]>) -> Result<Self, HmacKeyError> {
        let secret = key.as_ref();
        if secret.len() < Self::MIN_KEY_LENGTH {
            return Err(HmacKeyError::KeyTooShort {
                actual: secret.len(),
                minimum: Self::MIN_KEY_LENGTH,
            });
        }
        Ok(Self {
            mac: Hmac::<Sha256>::new_from_slice(secret).map_err(|_| HmacKeyError::InvalidKey)?,
            key_len: secret.len(),
        })
    }

    pub fn sign(&self, data: &[u8]) -> [u8; 32] {
        let mut mac = self.mac.clone();
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let expected = self.sign(data);
        constant_time_eq(&expected, signature)
    }
}

impl std::fmt::Debug for HmacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacKey")
            .field("key_length", &self.key_len)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum HmacKeyError {
    #[error("HMAC key too short: got {actual} bytes, need at least {minimum}")]
    KeyTooShort { actual: usize, minimum: usize },

    #[error("HMAC key rejected")]
    InvalidKey,
}

/// HMAC-SHA256 of `data` under an arbitrary-length shared secret, hex
/// encoded. Used for webhook signatures where the secret length is set by
/// the gateway.
pub fn hmac_sha256_hex(secret: &[u8], data: &[u8]) -> Option<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).ok()?;
    mac.update(data);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Differing lengths return `false` immediately; length is not secret.
#[inline]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[inline]
pub fn constant_time_str_eq(a: &str, b: &str) -> bool {
    constant_time_eq(a.as_bytes(), b.as_bytes())
}

/// Lowercase SHA-256 hex of the UTF-8 bytes of `token`.
///
/// This is the persisted form of API keys and relay tokens; the raw value
/// cannot be recovered from it.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// `len` characters from `[A-Za-z0-9]` drawn from the OS CSPRNG
pub fn random_alphanumeric(len: usize) -> String {
    Alphanumeric.sample_string(&mut OsRng, len)
}

/// `bytes` random bytes, lowercase hex encoded
pub fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// `len` decimal digits drawn from the OS CSPRNG
pub fn random_digits(len: usize) -> String {
    (0..len)
        .map(|_| char::from(b'0' + OsRng.gen_range(0..10u8)))
        .collect()
}
