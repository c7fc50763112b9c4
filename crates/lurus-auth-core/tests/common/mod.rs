//! Shared helpers for lurus-auth-core integration tests

pub mod jwks_mock;

#[allow(unused_imports)]
pub use jwks_mock::{JwksMockServer, TestKeyPair, TestOidcClaims};
