//! Tower middleware resolving principals and binding tenants.
//!
//! [`AuthLayer`] is applied with `Router::route_layer` so the matched path
//! parameters are visible: a `{tenant}` segment selects the tenant by slug.
//! Credentials are tried strongest plane first (`X-API-Key`, then
//! `Authorization: Bearer`, then the session cookie) among the planes the
//! layer accepts.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use axum::body::Body;
use axum::extract::{FromRequestParts, RawPathParams};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use lurus_auth_core::session::session_from_cookie_header;
use lurus_auth_core::{AuthError, BindRequest, Credentials, PrincipalResolver, TARGET_TENANT_HEADER};
use lurus_types::{ApiResponse, AuthPlane};
use pin_project_lite::pin_project;
use tower::{Layer, Service};

use crate::context::RequestContext;
use crate::error::ApiError;

/// Header carrying an internal service key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Path parameter naming the tenant slug
pub const TENANT_PATH_PARAM: &str = "tenant";

const INVALID_API_KEY_MESSAGE: &str = "Invalid or expired API key";

const ALL_PLANES: &[AuthPlane] = &[AuthPlane::ServiceKey, AuthPlane::BearerJwt, AuthPlane::Session];
const USER_PLANES: &[AuthPlane] = &[AuthPlane::BearerJwt, AuthPlane::Session];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Reject requests without a valid principal
    Required,
    /// Invalid or missing credentials leave the request anonymous
    Optional,
}

/// Every credential on the request, strongest plane first
fn presented(headers: &HeaderMap) -> impl Iterator<Item = Credentials<'_>> {
    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(Credentials::ServiceKey);
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(Credentials::Bearer);
    let session = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(session_from_cookie_header)
        .map(Credentials::Session);
    api_key.into_iter().chain(bearer).chain(session)
}

/// Strongest credential on the request
pub fn extract_credentials(headers: &HeaderMap) -> Credentials<'_> {
    presented(headers).next().unwrap_or(Credentials::None)
}

/// Tower layer attaching a [`RequestContext`] to every request
#[derive(Clone)]
pub struct AuthLayer {
    resolver: Arc<PrincipalResolver>,
    mode: Mode,
    planes: &'static [AuthPlane],
}

impl AuthLayer {
    /// Any authenticated principal
    pub fn required(resolver: Arc<PrincipalResolver>) -> Self {
        Self {
            resolver,
            mode: Mode::Required,
            planes: ALL_PLANES,
        }
    }

    /// Anonymous callers pass; credentials, when valid, are resolved
    pub fn optional(resolver: Arc<PrincipalResolver>) -> Self {
        Self {
            resolver,
            mode: Mode::Optional,
            planes: ALL_PLANES,
        }
    }

    /// Session or bearer principals of local users
    pub fn users(resolver: Arc<PrincipalResolver>) -> Self {
        Self {
            resolver,
            mode: Mode::Required,
            planes: USER_PLANES,
        }
    }

    /// Internal service keys only
    pub fn service_keys(resolver: Arc<PrincipalResolver>) -> Self {
        Self {
            resolver,
            mode: Mode::Required,
            planes: &[AuthPlane::ServiceKey],
        }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            layer: self.clone(),
        }
    }
}

/// Service produced by [`AuthLayer`]
#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    layer: AuthLayer,
}

impl<S> Service<Request<Body>> for AuthService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = AuthFuture<S, S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        // Keep the instance that was driven to readiness
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let auth = Box::pin(authenticate(self.layer.clone(), req));
        AuthFuture {
            state: State::Authenticating { auth, inner },
        }
    }
}

type AuthenticateFuture = Pin<Box<dyn Future<Output = Result<Request<Body>, Response>> + Send>>;

pin_project! {
    /// Future for [`AuthService`]
    pub struct AuthFuture<S, F> {
        #[pin]
        state: State<S, F>,
    }
}

pin_project! {
    #[project = StateProj]
    enum State<S, F> {
        Authenticating {
            auth: AuthenticateFuture,
            inner: S,
        },
        Calling {
            #[pin]
            future: F,
        },
        Done,
    }
}

impl<S, F> Future for AuthFuture<S, F>
where
    S: Service<Request<Body>, Response = Response, Future = F>,
    F: Future<Output = Result<Response, S::Error>>,
{
    type Output = Result<Response, S::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            let mut this = self.as_mut().project();
            match this.state.as_mut().project() {
                StateProj::Authenticating { auth, inner } => match ready!(auth.as_mut().poll(cx)) {
                    Ok(request) => {
                        let future = inner.call(request);
                        this.state.set(State::Calling { future });
                    }
                    Err(rejection) => {
                        this.state.set(State::Done);
                        return Poll::Ready(Ok(rejection));
                    }
                },
                StateProj::Calling { future } => return future.poll(cx),
                StateProj::Done => panic!("AuthFuture polled after completion"),
            }
        }
    }
}

async fn authenticate(layer: AuthLayer, request: Request<Body>) -> Result<Request<Body>, Response> {
    let (mut parts, body) = request.into_parts();
    let resolver = &layer.resolver;

    let principal = {
        let mut presented = presented(&parts.headers).peekable();
        let any_presented = presented.peek().is_some();
        match presented.find(|c| layer.planes.contains(&c.plane())) {
            Some(credentials) => match resolver.resolve(credentials, Utc::now()).await {
                Ok(principal) => Some(principal),
                Err(e) if layer.mode == Mode::Optional => {
                    tracing::debug!(plane = %credentials.plane(), error = %e, "Ignoring invalid credentials");
                    None
                }
                Err(e) => return Err(reject(credentials.plane(), e)),
            },
            None if layer.mode == Mode::Required => {
                let err = if any_presented {
                    AuthError::UnknownPlane
                } else {
                    AuthError::AuthFailed
                };
                return Err(reject(AuthPlane::Public, err));
            }
            None => None,
        }
    };

    let path_slug = RawPathParams::from_request_parts(&mut parts, &())
        .await
        .ok()
        .and_then(|params| {
            params
                .iter()
                .find(|(name, _)| *name == TENANT_PATH_PARAM)
                .map(|(_, value)| value.to_string())
        });
    let target_tenant = parts
        .headers
        .get(TARGET_TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let binder = resolver.binder();
    let tenant = binder
        .bind(BindRequest {
            principal: principal.as_ref(),
            path_slug: path_slug.as_deref(),
            target_tenant: target_tenant.as_deref(),
        })
        .await
        .map_err(|e| ApiError::from(e).into_response())?;

    if let Some(p) = &principal {
        tracing::debug!(plane = %p.plane, user_id = ?p.user_id, key_name = ?p.key_name, tenant_id = %tenant.id, "Request authenticated");
    }
    let platform_admin = principal.as_ref().is_some_and(|p| binder.is_platform_admin(p));
    let db = binder.handle(&tenant);
    parts.extensions.insert(
        RequestContext::new(principal, tenant, db).with_platform_admin(platform_admin),
    );
    Ok(Request::from_parts(parts, body))
}

fn reject(plane: AuthPlane, err: AuthError) -> Response {
    if plane == AuthPlane::ServiceKey && err.status_code() == 401 {
        let body = ApiResponse::<()>::error(Some(err.code()), INVALID_API_KEY_MESSAGE);
        return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
    }
    ApiError::from(err).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::{Extension, Router};
    use http_body_util::BodyExt;
    use lurus_auth_core::AuthConfig;
    use lurus_db::{CreateTenant, CreateUser, Store};
    use lurus_types::{CreateApiKeyRequest, Role, TenantId, UserId, DEFAULT_GROUP};
    use tower::ServiceExt;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn resolver(store: &Store) -> Arc<PrincipalResolver> {
        Arc::new(PrincipalResolver::new(store.clone(), AuthConfig::new(SECRET)).unwrap())
    }

    async fn whoami(Extension(ctx): Extension<RequestContext>) -> String {
        format!("{}:{}", ctx.plane(), ctx.tenant.slug)
    }

    fn app(layer: AuthLayer) -> Router {
        Router::new()
            .route("/who", get(whoami))
            .route("/t/{tenant}/who", get(whoami))
            .route_layer(layer)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, String) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn get_req(uri: &str) -> axum::http::request::Builder {
        Request::builder().uri(uri)
    }

    async fn session_cookie(store: &Store, resolver: &PrincipalResolver) -> String {
        let user = store
            .for_tenant(TenantId::default_tenant())
            .create_user(CreateUser {
                tenant_id: TenantId::default_tenant(),
                username: "alice".into(),
                password_hash: None,
                display_name: "Alice".into(),
                email: String::new(),
                phone: String::new(),
                phone_verified: false,
                role: Role::Common,
                group: DEFAULT_GROUP.into(),
                quota: 0,
                aff_code: String::new(),
            })
            .await
            .unwrap();
        let (cookie, _) = resolver.sessions().issue(&user, Utc::now()).unwrap();
        format!("session={cookie}")
    }

    #[tokio::test]
    async fn required_without_credentials_is_401() {
        let store = Store::memory();
        let (status, body) = send(
            app(AuthLayer::required(resolver(&store))),
            get_req("/who").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("AUTH_FAILED"));
    }

    #[tokio::test]
    async fn optional_binds_default_tenant_for_anonymous() {
        let store = Store::memory();
        let (status, body) = send(
            app(AuthLayer::optional(resolver(&store))),
            get_req("/who")
                .header(header::COOKIE, "session=garbage.value")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "public:default");
    }

    #[tokio::test]
    async fn bad_service_key_message() {
        let store = Store::memory();
        let (status, body) = send(
            app(AuthLayer::service_keys(resolver(&store))),
            get_req("/who")
                .header(API_KEY_HEADER, "lurus_ik_doesnotexistdoesnotexist0000")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["message"], "Invalid or expired API key");
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn valid_service_key_passes() {
        let store = Store::memory();
        let resolver = resolver(&store);
        let created = resolver
            .api_keys()
            .create(
                CreateApiKeyRequest {
                    name: "billing".into(),
                    scopes: vec!["quota:read".into()],
                    description: String::new(),
                    expires_at: 0,
                    tenant_id: None,
                },
                UserId(1),
                Role::Admin,
            )
            .await
            .unwrap();

        let (status, body) = send(
            app(AuthLayer::service_keys(resolver)),
            get_req("/who")
                .header(API_KEY_HEADER, created.key.as_str())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "service_key:default");
    }

    #[tokio::test]
    async fn session_on_service_route_is_unknown_plane() {
        let store = Store::memory();
        let resolver = resolver(&store);
        let cookie = session_cookie(&store, &resolver).await;
        let (status, body) = send(
            app(AuthLayer::service_keys(resolver)),
            get_req("/who")
                .header(header::COOKIE, cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("UNKNOWN_PLANE"));
    }

    #[tokio::test]
    async fn session_user_cannot_reach_foreign_slug() {
        let store = Store::memory();
        let other = store
            .tenants
            .create(CreateTenant {
                external_org_id: "local:other".into(),
                slug: "other".into(),
                name: "Other".into(),
                plan_type: "free".into(),
                max_users: 0,
                max_quota: 0,
            })
            .await
            .unwrap();
        let resolver = resolver(&store);
        let cookie = session_cookie(&store, &resolver).await;

        let (status, body) = send(
            app(AuthLayer::users(resolver.clone())),
            get_req("/who")
                .header(header::COOKIE, cookie.as_str())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "session:default");

        let (status, _) = send(
            app(AuthLayer::users(resolver.clone())),
            get_req(&format!("/t/{}/who", other.slug))
                .header(header::COOKIE, cookie.as_str())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // Anonymous callers may address any tenant by slug
        let (status, body) = send(
            app(AuthLayer::optional(resolver)),
            get_req("/t/other/who").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "public:other");
    }
}
