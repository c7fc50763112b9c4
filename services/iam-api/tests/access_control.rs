//! Access control across planes, scopes and tenants

mod common;

use axum::http::StatusCode;
use common::jwks_mock::{JwksMockServer, TestKeyPair, TestOidcClaims};
use common::{get, json, json_with, put, TestApp};
use lurus_db::{CreateTenant, CreateUser};
use lurus_types::{Role, TenantId, DEFAULT_GROUP};
use serde_json::json;

#[tokio::test]
async fn wildcard_keys_need_root() {
    let app = TestApp::new();
    let admin = app.default_user("admin", Role::Admin).await;
    let root = app.default_user("root", Role::Root).await;
    let body = json!({"name": "k", "scopes": ["*"]});

    let (status, _) = app
        .send(json_with(
            common::post("/api/admin/api-keys").header("cookie", app.cookie(&admin)),
            &body,
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, created) = app
        .send(json_with(
            common::post("/api/admin/api-keys").header("cookie", app.cookie(&root)),
            &body,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    let key = created["data"]["key"].as_str().unwrap().to_string();
    assert_eq!(key.len(), 41);
    assert!(key.starts_with("lurus_ik_"));

    // The wildcard satisfies any scope
    let customer = app.default_user("customer", Role::Common).await;
    let (status, adjusted) = app
        .send(json_with(
            common::post("/internal/quota/adjust").header("x-api-key", &key),
            &json!({"user_id": customer.id, "amount": 100, "reason": "welcome"}),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(adjusted["data"]["new_quota"], 100);
}

#[tokio::test]
async fn scopes_gate_each_internal_route() {
    let app = TestApp::new();
    let user = app.default_user("alice", Role::Common).await;
    let key = app.api_key(&["user:read"], None).await;

    let (status, body) = app
        .send(
            get(&format!("/internal/user/{}", user.id))
                .header("x-api-key", &key)
                .body(Default::default())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["username"], "alice");

    let (status, body) = app
        .send(json_with(
            common::post("/internal/quota/adjust").header("x-api-key", &key),
            &json!({"user_id": user.id, "amount": 5, "reason": "nope"}),
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn unknown_api_key_is_rejected() {
    let app = TestApp::new();
    let (status, body) = app
        .send(
            get("/internal/user/1")
                .header("x-api-key", "lurus_ik_00000000000000000000000000000000")
                .body(Default::default())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Invalid or expired API key");
}

#[tokio::test]
async fn tenant_bound_keys_do_not_see_other_tenants() {
    let app = TestApp::new();
    let acme = app.tenant("acme").await;
    let user = app.default_user("u1", Role::Common).await;

    let acme_key = app.api_key(&["user:read"], Some(&acme.id)).await;
    let (status, body) = app
        .send(
            get(&format!("/internal/user/{}", user.id))
                .header("x-api-key", &acme_key)
                .body(Default::default())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "USER_NOT_FOUND");
    assert!(body.get("data").is_none());

    let platform_key = app.api_key(&["user:read"], None).await;
    let (status, _) = app
        .send(
            get(&format!("/internal/user/{}", user.id))
                .header("x-api-key", &platform_key)
                .body(Default::default())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn users_cannot_reach_admin_routes() {
    let app = TestApp::new();
    let user = app.default_user("bob", Role::Common).await;
    let (status, _) = app
        .send(
            get("/api/admin/invitations")
                .header("cookie", app.cookie(&user))
                .body(Default::default())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .send(
            get("/api/user/self")
                .header("cookie", app.cookie(&user))
                .body(Default::default())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["username"], "bob");
}

#[tokio::test]
async fn system_config_is_read_only_to_tenant_admins() {
    let app = TestApp::new();
    let acme = app.tenant("acme").await;
    let root = app.default_user("root", Role::Root).await;
    let tenant_admin = app.user(&acme.id, "acme-admin", Role::Admin).await;
    let uri = format!("/api/admin/tenants/{}/config", acme.id);

    let (status, body) = app
        .send(json_with(
            put(&uri).header("cookie", app.cookie(&root)),
            &json!({"key": "registration_mode", "value": "closed", "is_system": true}),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["is_system"], true);

    let (status, _) = app
        .send(json_with(
            put(&uri).header("cookie", app.cookie(&tenant_admin)),
            &json!({"key": "registration_mode", "value": "open"}),
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Their own non-system keys stay writable
    let (status, _) = app
        .send(json_with(
            put(&uri).header("cookie", app.cookie(&tenant_admin)),
            &json!({"key": "sms_auto_register", "value": "false", "value_type": "bool"}),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn tenant_admins_cannot_manage_tenants() {
    let app = TestApp::new();
    let acme = app.tenant("acme").await;
    let tenant_admin = app.user(&acme.id, "acme-admin", Role::Admin).await;
    let (status, _) = app
        .send(json(
            "POST",
            "/api/admin/tenants",
            &json!({"name": "Other Corp"}),
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .send(json_with(
            common::post("/api/admin/tenants").header("cookie", app.cookie(&tenant_admin)),
            &json!({"name": "Other Corp"}),
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let root = app.default_user("root", Role::Root).await;
    let (status, body) = app
        .send(json_with(
            common::post("/api/admin/tenants").header("cookie", app.cookie(&root)),
            &json!({"name": "Other Corp"}),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["slug"], "other-corp");

    let (status, _) = app
        .send(
            common::post(&format!("/api/admin/tenants/{}/disable", TenantId::default_tenant()))
                .header("cookie", app.cookie(&root))
                .body(Default::default())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn root_of_another_tenant_is_not_a_platform_admin() {
    let app = TestApp::new();
    let acme = app.tenant("acme").await;
    let acme_root = app.user(&acme.id, "acme-root", Role::Root).await;

    let (status, _) = app
        .send(json_with(
            common::post("/api/admin/tenants").header("cookie", app.cookie(&acme_root)),
            &json!({"name": "Other Corp"}),
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .send(
            get("/api/admin/tenants")
                .header("cookie", app.cookie(&acme_root))
                .body(Default::default())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

async fn bearer_status(app: &TestApp, token: &str, request: axum::http::request::Builder) -> StatusCode {
    let request = request
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .body(axum::body::Body::from(json!({"name": "Bearer Corp"}).to_string()))
        .unwrap();
    app.send(request).await.0
}

#[tokio::test]
async fn bearer_admin_routes_follow_role_claims() {
    let idp = JwksMockServer::start().await;
    let app = TestApp::with_oidc(&idp.issuer());
    let keys = TestKeyPair::load();
    let token = |claims: TestOidcClaims| keys.sign(&claims);
    let claims = || TestOidcClaims::valid(&idp.issuer(), common::OIDC_CLIENT_ID);

    // Signed in, but no role claim
    let plain = token(claims());
    assert_eq!(bearer_status(&app, &plain, get("/api/user/self")).await, StatusCode::OK);
    assert_eq!(
        bearer_status(&app, &plain, get("/api/admin/invitations")).await,
        StatusCode::FORBIDDEN
    );

    let admin = token(claims().with_role("admin"));
    assert_eq!(
        bearer_status(&app, &admin, get("/api/admin/invitations")).await,
        StatusCode::OK
    );
    assert_eq!(
        bearer_status(&app, &admin, common::post("/api/admin/tenants")).await,
        StatusCode::FORBIDDEN
    );

    // The platform role stands in for every other role claim
    let platform = token(claims().with_role("platform_admin"));
    assert_eq!(
        bearer_status(&app, &platform, get("/api/admin/invitations")).await,
        StatusCode::OK
    );
    assert_eq!(
        bearer_status(&app, &platform, common::post("/api/admin/tenants")).await,
        StatusCode::OK
    );
}

#[tokio::test]
async fn local_admin_role_does_not_admit_a_bearer_token() {
    let idp = JwksMockServer::start().await;
    let app = TestApp::with_oidc(&idp.issuer());
    let claims = TestOidcClaims::valid(&idp.issuer(), common::OIDC_CLIENT_ID).with_role("viewer");

    // The subject is already linked to a local admin
    let tenant = app
        .store
        .tenants
        .create(CreateTenant {
            external_org_id: claims.org_id.clone(),
            slug: "acme".into(),
            name: "Acme".into(),
            plan_type: "free".into(),
            max_users: 0,
            max_quota: 0,
        })
        .await
        .unwrap();
    let user = CreateUser {
        tenant_id: tenant.id.clone(),
        username: "acme_admin".into(),
        password_hash: None,
        display_name: "Acme Admin".into(),
        email: claims.email.clone(),
        phone: String::new(),
        phone_verified: false,
        role: Role::Admin,
        group: DEFAULT_GROUP.into(),
        quota: 0,
        aff_code: String::new(),
    };
    app.store
        .identities
        .create_with_user(user, &claims.sub)
        .await
        .unwrap();

    let token = TestKeyPair::load().sign(&claims);
    assert_eq!(bearer_status(&app, &token, get("/api/user/self")).await, StatusCode::OK);
    assert_eq!(
        bearer_status(&app, &token, get("/api/admin/invitations")).await,
        StatusCode::FORBIDDEN
    );
}
