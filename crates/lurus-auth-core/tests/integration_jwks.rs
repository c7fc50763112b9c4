//! Integration tests for the bearer plane
//!
//! A wiremock server plays the identity provider's JWKS endpoint; tokens are
//! signed with the matching test key.

mod common;

use chrono::Utc;
use common::{JwksMockServer, TestKeyPair, TestOidcClaims};
use lurus_auth_core::{
    AuthConfig, AuthError, Credentials, OidcConfig, OidcValidator, PrincipalResolver,
};
use lurus_db::Store;
use lurus_types::{AuthPlane, TenantStatus};

const TEST_CLIENT_ID: &str = "test-client-id";
const SECRET: &str = "0123456789abcdef0123456789abcdef";

fn oidc_config(server: &JwksMockServer) -> OidcConfig {
    OidcConfig::new(server.issuer(), TEST_CLIENT_ID)
}

#[tokio::test]
async fn test_valid_jwt_validates_successfully() {
    let server = JwksMockServer::start().await;
    let validator = OidcValidator::new(oidc_config(&server));
    let keypair = TestKeyPair::load();

    let claims = TestOidcClaims::valid(&server.issuer(), TEST_CLIENT_ID).with_role("tenant_admin");
    let token = keypair.sign(&claims);

    let validated = validator.validate(&token).await.expect("valid token");
    assert_eq!(validated.sub, claims.sub);
    assert_eq!(validated.organisation(), Some("281937461293847"));
    assert_eq!(validated.role_names(), vec!["tenant_admin".to_string()]);
}

#[tokio::test]
async fn test_expired_jwt_returns_token_expired() {
    let server = JwksMockServer::start().await;
    let validator = OidcValidator::new(oidc_config(&server));
    let keypair = TestKeyPair::load();

    let token = keypair.sign(&TestOidcClaims::expired(&server.issuer(), TEST_CLIENT_ID));
    let err = validator.validate(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::TokenExpired), "{err:?}");
    assert_eq!(err.status_code(), 401);
}

#[tokio::test]
async fn test_not_yet_valid_jwt_is_rejected() {
    let server = JwksMockServer::start().await;
    let validator = OidcValidator::new(oidc_config(&server));
    let keypair = TestKeyPair::load();

    let claims = TestOidcClaims::valid(&server.issuer(), TEST_CLIENT_ID)
        .not_before(Utc::now().timestamp() + 600);
    let err = validator.validate(&keypair.sign(&claims)).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidToken), "{err:?}");
}

#[tokio::test]
async fn test_unknown_kid_returns_invalid_token() {
    let server = JwksMockServer::start().await;
    let validator = OidcValidator::new(oidc_config(&server));
    let keypair = TestKeyPair::load();

    let claims = TestOidcClaims::valid(&server.issuer(), TEST_CLIENT_ID);
    let token = keypair.sign_with_kid(&claims, "unknown-kid-12345");
    let err = validator.validate(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidToken), "{err:?}");
}

#[tokio::test]
async fn test_wrong_issuer_returns_invalid_token() {
    let server = JwksMockServer::start().await;
    let validator = OidcValidator::new(oidc_config(&server));
    let keypair = TestKeyPair::load();

    let claims = TestOidcClaims::valid("https://wrong-issuer.example.com", TEST_CLIENT_ID);
    let err = validator.validate(&keypair.sign(&claims)).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidToken), "{err:?}");
}

#[tokio::test]
async fn test_wrong_audience_returns_invalid_token() {
    let server = JwksMockServer::start().await;
    let validator = OidcValidator::new(oidc_config(&server));
    let keypair = TestKeyPair::load();

    let claims =
        TestOidcClaims::valid(&server.issuer(), TEST_CLIENT_ID).with_audience("another-client");
    let err = validator.validate(&keypair.sign(&claims)).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidToken), "{err:?}");
}

#[tokio::test]
async fn test_malformed_jwt_returns_invalid_token() {
    let server = JwksMockServer::start().await;
    let validator = OidcValidator::new(oidc_config(&server));

    for token in [
        "",
        "not-a-jwt",
        "one.two",
        "one.two.three.four",
        "eyJhbGciOiJSUzI1NiJ9.invalid-payload.signature",
    ] {
        assert!(validator.validate(token).await.is_err(), "{token:?}");
    }
}

#[tokio::test]
async fn test_jwks_caching_prevents_refetch() {
    let server = JwksMockServer::start_bare().await;
    let _guard = server.expect_jwks_calls(1).await;
    let validator = OidcValidator::new(oidc_config(&server));
    let keypair = TestKeyPair::load();

    let token = keypair.sign(&TestOidcClaims::valid(&server.issuer(), TEST_CLIENT_ID));
    for _ in 0..5 {
        validator.validate(&token).await.expect("valid token");
    }
}

#[tokio::test]
async fn test_failed_refresh_keeps_cached_keys() {
    let server = JwksMockServer::start().await;
    let validator = OidcValidator::new(oidc_config(&server));
    let keypair = TestKeyPair::load();
    let token = keypair.sign(&TestOidcClaims::valid(&server.issuer(), TEST_CLIENT_ID));
    validator.validate(&token).await.expect("valid token");

    server.reset().await;
    server.with_error_response(503).await;
    assert!(matches!(validator.refresh().await, Err(AuthError::Upstream(_))));

    validator
        .validate(&token)
        .await
        .expect("cached key still verifies");
}

// ============================================================================
// Resolver
// ============================================================================

async fn resolver(server: &JwksMockServer, auto_create: bool) -> (PrincipalResolver, Store) {
    let store = Store::memory();
    let config = AuthConfig::new(SECRET)
        .with_oidc(oidc_config(server).with_auto_create(auto_create, auto_create));
    (PrincipalResolver::new(store.clone(), config).unwrap(), store)
}

#[tokio::test]
async fn test_first_bearer_login_creates_tenant_and_user() {
    let server = JwksMockServer::start().await;
    let (resolver, store) = resolver(&server, true).await;
    let keypair = TestKeyPair::load();

    let claims = TestOidcClaims::valid(&server.issuer(), TEST_CLIENT_ID)
        .with_sub("user-1")
        .with_role("billing");
    let token = keypair.sign(&claims);

    let principal = resolver
        .resolve(Credentials::Bearer(&token), Utc::now())
        .await
        .expect("bearer resolves");
    assert_eq!(principal.plane, AuthPlane::BearerJwt);
    assert!(principal.has_role("billing"));

    let tenant = store
        .tenants
        .find_by_external_org("281937461293847")
        .await
        .unwrap()
        .expect("tenant auto-created");
    assert_eq!(principal.tenant_id.as_ref(), Some(&tenant.id));
    assert_eq!(tenant.slug, "acme-example-com");

    // Second login maps to the same user
    let again = resolver
        .resolve(Credentials::Bearer(&token), Utc::now())
        .await
        .unwrap();
    assert_eq!(again.user_id, principal.user_id);
}

#[tokio::test]
async fn test_bearer_without_auto_create_is_rejected() {
    let server = JwksMockServer::start().await;
    let (resolver, _) = resolver(&server, false).await;
    let keypair = TestKeyPair::load();

    let token = keypair.sign(&TestOidcClaims::valid(&server.issuer(), TEST_CLIENT_ID));
    let err = resolver
        .resolve(Credentials::Bearer(&token), Utc::now())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 401);
}

#[tokio::test]
async fn test_bearer_for_disabled_tenant_is_forbidden() {
    let server = JwksMockServer::start().await;
    let (resolver, store) = resolver(&server, true).await;
    let keypair = TestKeyPair::load();

    let claims = TestOidcClaims::valid(&server.issuer(), TEST_CLIENT_ID).with_org("org-77", "closed.io");
    let token = keypair.sign(&claims);
    resolver
        .resolve(Credentials::Bearer(&token), Utc::now())
        .await
        .unwrap();

    let tenant = store.tenants.find_by_external_org("org-77").await.unwrap().unwrap();
    store
        .tenants
        .update_status(&tenant.id, TenantStatus::Disabled)
        .await
        .unwrap();

    let err = resolver
        .resolve(Credentials::Bearer(&token), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::TenantDisabled));
    assert_eq!(err.status_code(), 403);
}

#[tokio::test]
async fn test_bearer_without_oidc_configured_fails() {
    let store = Store::memory();
    let resolver = PrincipalResolver::new(store, AuthConfig::new(SECRET)).unwrap();
    let err = resolver
        .resolve(Credentials::Bearer("a.b.c"), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::AuthFailed));
}
