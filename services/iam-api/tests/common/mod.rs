//! Shared harness for iam-api integration tests
#![allow(dead_code)]

#[path = "../../../../crates/lurus-auth-core/tests/common/jwks_mock.rs"]
pub mod jwks_mock;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use http_body_util::BodyExt;
use iam_api::{build_router, AppState, Config};
use lurus_auth_core::{AuthError, CodePurpose, SmsSender, SESSION_COOKIE_NAME};
use lurus_db::{CreateTenant, CreateUser, Store};
use lurus_types::{CreateApiKeyRequest, Role, Tenant, TenantId, User, UserId, DEFAULT_GROUP};
use serde_json::Value;
use tower::ServiceExt;

pub const SESSION_SECRET: &str = "0123456789abcdef0123456789abcdef";
pub const STRIPE_WEBHOOK_SECRET: &str = "whsec_integration";
pub const OIDC_CLIENT_ID: &str = "iam-integration";

/// Records every code instead of sending it
#[derive(Default)]
pub struct CapturingSms {
    sent: Mutex<Vec<(String, String)>>,
}

impl CapturingSms {
    pub fn last_code(&self, phone: &str) -> Option<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(p, _)| p == phone)
            .map(|(_, code)| code.clone())
    }
}

#[async_trait]
impl SmsSender for CapturingSms {
    async fn send_code(&self, phone: &str, _purpose: CodePurpose, code: &str) -> Result<(), AuthError> {
        self.sent
            .lock()
            .unwrap()
            .push((phone.to_string(), code.to_string()));
        Ok(())
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Store,
    pub sms: Arc<CapturingSms>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_vars(&[])
    }

    /// App accepting bearer tokens from `issuer`; unknown organisations get a tenant
    pub fn with_oidc(issuer: &str) -> Self {
        Self::with_vars(&[
            ("ZITADEL_ENABLED", "true"),
            ("ZITADEL_ISSUER", issuer),
            ("ZITADEL_CLIENT_ID", OIDC_CLIENT_ID),
            ("ZITADEL_AUTO_CREATE_TENANT", "true"),
        ])
    }

    fn with_vars(extra: &[(&str, &str)]) -> Self {
        let mut vars: HashMap<&str, &str> = HashMap::from([
            ("SESSION_SECRET", SESSION_SECRET),
            ("STRIPE_SECRET_KEY", "sk_test_integration"),
            ("STRIPE_WEBHOOK_SECRET", STRIPE_WEBHOOK_SECRET),
        ]);
        vars.extend(extra.iter().copied());
        let config = Config::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        let store = Store::memory();
        let sms = Arc::new(CapturingSms::default());
        let sender: Arc<dyn SmsSender> = sms.clone();
        let state = AppState::new(store.clone(), config, Some(sender)).unwrap();
        Self {
            router: build_router(state.clone(), None),
            state,
            store,
            sms,
        }
    }

    pub async fn tenant(&self, slug: &str) -> Tenant {
        self.store
            .tenants
            .create(CreateTenant {
                external_org_id: format!("local:{slug}"),
                slug: slug.to_string(),
                name: slug.to_string(),
                plan_type: "free".into(),
                max_users: 0,
                max_quota: 0,
            })
            .await
            .unwrap()
    }

    pub async fn user(&self, tenant: &TenantId, username: &str, role: Role) -> User {
        self.store
            .for_tenant(tenant.clone())
            .create_user(CreateUser {
                tenant_id: tenant.clone(),
                username: username.to_string(),
                password_hash: None,
                display_name: username.to_string(),
                email: format!("{username}@example.com"),
                phone: String::new(),
                phone_verified: false,
                role,
                group: DEFAULT_GROUP.to_string(),
                quota: 0,
                aff_code: String::new(),
            })
            .await
            .unwrap()
    }

    pub async fn default_user(&self, username: &str, role: Role) -> User {
        self.user(&TenantId::default_tenant(), username, role).await
    }

    /// `Cookie` header value carrying a session for `user`
    pub fn cookie(&self, user: &User) -> String {
        let (value, _) = self
            .state
            .resolver
            .sessions()
            .issue(user, Utc::now())
            .unwrap();
        format!("{SESSION_COOKIE_NAME}={value}")
    }

    /// Raw service key with `scopes`, created by a root user
    pub async fn api_key(&self, scopes: &[&str], tenant: Option<&TenantId>) -> String {
        let request = CreateApiKeyRequest {
            name: format!("svc-{}", scopes.join("-")),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            description: String::new(),
            expires_at: 0,
            tenant_id: tenant.map(|t| t.to_string()),
        };
        self.state
            .resolver
            .api_keys()
            .create(request, UserId(1), Role::Root)
            .await
            .unwrap()
            .key
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }
}

/// JSON request with `body`
pub fn json(method: &str, uri: &str, body: &Value) -> Request<Body> {
    json_with(Request::builder().method(method).uri(uri), body)
}

/// Finish a pre-configured builder with a JSON body
pub fn json_with(builder: axum::http::request::Builder, body: &Value) -> Request<Body> {
    builder
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> axum::http::request::Builder {
    Request::builder().uri(uri)
}

pub fn post(uri: &str) -> axum::http::request::Builder {
    Request::builder().method("POST").uri(uri)
}

pub fn put(uri: &str) -> axum::http::request::Builder {
    Request::builder().method("PUT").uri(uri)
}
