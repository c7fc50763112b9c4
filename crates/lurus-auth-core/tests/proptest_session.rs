//! Property-based tests for session cookies
//!
//! - Issued cookies validate back to the same payload
//! - Malformed cookies are rejected without panicking
//! - Any change to payload or signature is detected
//! - Short HMAC keys are refused

use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{TimeZone, Utc};
use lurus_auth_core::{HmacKey, SessionManager};
use lurus_types::{Role, TenantId, User, UserId, UserStatus};
use proptest::prelude::*;

const SECRET: &str = "0123456789abcdef0123456789abcdef";

fn manager() -> SessionManager {
    SessionManager::new(SECRET, Duration::from_secs(90 * 24 * 3600)).unwrap()
}

fn user(id: i64, tenant: String, role: Role) -> User {
    User {
        id: UserId(id),
        tenant_id: TenantId::new(tenant),
        username: "u".into(),
        password_hash: None,
        display_name: String::new(),
        email: String::new(),
        phone: String::new(),
        phone_verified: false,
        role,
        status: UserStatus::Enabled,
        group: "default".into(),
        base_group: String::new(),
        fallback_group: String::new(),
        quota: 0,
        used_quota: 0,
        daily_quota: 0,
        daily_used: 0,
        last_daily_reset: 0,
        aff_code: String::new(),
        created_at: Utc::now(),
    }
}

// ============================================================================
// Strategies
// ============================================================================

fn arb_user() -> impl Strategy<Value = User> {
    (
        1i64..i64::MAX,
        "[a-z0-9]{1,32}",
        prop_oneof![Just(Role::Common), Just(Role::Admin), Just(Role::Root)],
    )
        .prop_map(|(id, tenant, role)| user(id, tenant, role))
}

fn arb_malformed_cookie() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-zA-Z0-9_-]{10,50}",
        "[a-zA-Z0-9_-]{10,20}\\.[a-zA-Z0-9_-]{5,10}\\.[a-zA-Z0-9_-]{5,10}",
        Just(".signature".to_string()),
        Just("payload.".to_string()),
        Just("..".to_string()),
        Just(".".to_string()),
        Just(String::new()),
        "[!@#$%^&*()]{10,30}\\.[a-zA-Z0-9_-]{20,40}",
        any::<[u8; 32]>().prop_map(|bytes| format!("{}.fake_sig", URL_SAFE_NO_PAD.encode(bytes))),
    ]
}

fn arb_printable_key(len: std::ops::Range<usize>) -> impl Strategy<Value = String> {
    prop::collection::vec(any::<u8>(), len)
        .prop_map(|bytes| bytes.iter().map(|b| (b % 94 + 33) as char).collect())
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_valid_hmac_key_accepted(key in arb_printable_key(32..64)) {
        prop_assert!(HmacKey::new(&key).is_ok());
    }

    #[test]
    fn prop_short_hmac_key_rejected(key in arb_printable_key(1..31)) {
        prop_assert!(HmacKey::new(&key).is_err());
    }

    #[test]
    fn prop_issued_cookie_roundtrips(user in arb_user()) {
        let sessions = manager();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let (cookie, payload) = sessions.issue(&user, now).unwrap();
        let parsed = sessions.validate_cookie(&cookie, now).unwrap();
        prop_assert_eq!(&parsed, &payload);
        prop_assert_eq!(parsed.user_id, user.id);
        prop_assert_eq!(&parsed.tenant_id, &user.tenant_id);
        prop_assert_eq!(parsed.role, user.role);
    }

    #[test]
    fn prop_malformed_cookie_rejected(cookie in arb_malformed_cookie()) {
        prop_assert!(manager().validate_cookie(&cookie, Utc::now()).is_err());
    }

    #[test]
    fn prop_tampered_cookie_rejected(user in arb_user(), flip in any::<prop::sample::Index>()) {
        let sessions = manager();
        let now = Utc::now();
        let (cookie, _) = sessions.issue(&user, now).unwrap();

        let mut bytes = cookie.into_bytes();
        let at = flip.index(bytes.len());
        if bytes[at] == b'.' {
            return Ok(());
        }
        bytes[at] = if bytes[at] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();
        prop_assert!(sessions.validate_cookie(&tampered, now).is_err());
    }

    #[test]
    fn prop_other_secret_rejected(user in arb_user()) {
        let now = Utc::now();
        let (cookie, _) = manager().issue(&user, now).unwrap();
        let other = SessionManager::new("fedcba9876543210fedcba9876543210", Duration::from_secs(60)).unwrap();
        prop_assert!(other.validate_cookie(&cookie, now).is_err());
    }
}

#[test]
fn expired_cookie_is_rejected() {
    let sessions = SessionManager::new(SECRET, Duration::from_secs(60)).unwrap();
    let now = Utc::now();
    let (cookie, _) = sessions.issue(&user(1, "default".into(), Role::Common), now).unwrap();
    let later = now + chrono::Duration::seconds(61);
    assert!(sessions.validate_cookie(&cookie, later).is_err());
}

#[test]
fn set_cookie_attributes() {
    let header = manager().set_cookie("abc.def");
    assert!(header.starts_with("session=abc.def;"));
    assert!(header.contains("HttpOnly"));
    assert!(header.contains("SameSite=Lax"));
    assert!(header.contains(&format!("Max-Age={}", 90 * 24 * 3600)));
    assert!(manager().clear_cookie().contains("Max-Age=0"));
}
