//! Axum extractors over the [`RequestContext`].
//!
//! These read the context [`AuthLayer`](crate::AuthLayer) attached; a route
//! without the layer rejects every one of them.
//!
//! # Usage
//!
//! ```ignore
//! use lurus_axum::{RequireAdmin, RequireUser, TenantCtx};
//!
//! // Any caller, anonymous included
//! async fn plans(TenantCtx(ctx): TenantCtx) -> String {
//!     ctx.tenant.slug
//! }
//!
//! // A logged-in local user (401 otherwise)
//! async fn me(user: RequireUser) -> String {
//!     user.user_id.to_string()
//! }
//!
//! // Tenant admin or platform admin (403 otherwise)
//! async fn keys(admin: RequireAdmin) -> String {
//!     admin.role.to_string()
//! }
//! ```

use std::ops::Deref;

use axum::extract::{FromRequest, FromRequestParts};
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use lurus_auth_core::{AuthError, Gate};
use lurus_types::{AuthPlane, Principal, Role, UserId};
use serde::Serialize;

use crate::context::RequestContext;
use crate::error::ApiError;

fn context(parts: &Parts) -> Result<RequestContext, ApiError> {
    parts
        .extensions
        .get::<RequestContext>()
        .cloned()
        .ok_or_else(|| ApiError::Internal("request context missing".into()))
}

/// The bound tenant and, when present, the principal
#[derive(Debug, Clone)]
pub struct TenantCtx(pub RequestContext);

impl Deref for TenantCtx {
    type Target = RequestContext;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<S> FromRequestParts<S> for TenantCtx
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        context(parts).map(Self)
    }
}

/// Any authenticated principal, service keys included
#[derive(Debug, Clone)]
pub struct RequireAuth {
    pub principal: Principal,
    pub ctx: RequestContext,
}

impl<S> FromRequestParts<S> for RequireAuth
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ctx = context(parts)?;
        let principal = ctx.require_principal()?.clone();
        Ok(Self { principal, ctx })
    }
}

/// A principal backed by a local user account
#[derive(Debug, Clone)]
pub struct RequireUser {
    pub user_id: UserId,
    pub role: Role,
    pub principal: Principal,
    pub ctx: RequestContext,
}

impl Deref for RequireUser {
    type Target = RequestContext;

    fn deref(&self) -> &Self::Target {
        &self.ctx
    }
}

impl<S> FromRequestParts<S> for RequireUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let RequireAuth { principal, ctx } = RequireAuth::from_request_parts(parts, _state).await?;
        let user_id = principal.user_id.ok_or(AuthError::AuthFailed)?;
        Ok(Self {
            user_id,
            role: principal.role,
            principal,
            ctx,
        })
    }
}

/// A user with the admin role in the bound tenant, or a platform admin.
///
/// Bearer principals need an admin role claim, checked by
/// [`RequireRoleLayer`](crate::RequireRoleLayer).
#[derive(Debug, Clone)]
pub struct RequireAdmin(pub RequireUser);

impl Deref for RequireAdmin {
    type Target = RequireUser;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<S> FromRequestParts<S> for RequireAdmin
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = RequireUser::from_request_parts(parts, state).await?;
        if user.ctx.platform_admin {
            return Ok(Self(user));
        }
        if user.principal.plane == AuthPlane::BearerJwt {
            // Bearer principals are admitted by their role claims alone
            if !user.ctx.role_granted {
                return Err(AuthError::Forbidden("Administrator role required".into()).into());
            }
        } else {
            Gate::default().require_user_role(&user.principal, Role::Admin)?;
        }
        Ok(Self(user))
    }
}

/// A platform administrator, acting across tenants
#[derive(Debug, Clone)]
pub struct RequirePlatformAdmin(pub RequireAuth);

impl Deref for RequirePlatformAdmin {
    type Target = RequireAuth;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<S> FromRequestParts<S> for RequirePlatformAdmin
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth = RequireAuth::from_request_parts(parts, state).await?;
        if !auth.ctx.platform_admin {
            return Err(AuthError::Forbidden("Platform administrator required".into()).into());
        }
        Ok(Self(auth))
    }
}

/// JSON body whose rejections use the error envelope
#[derive(Debug, Clone, Copy, Default, FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

impl<T: Serialize> IntoResponse for ApiJson<T> {
    fn into_response(self) -> Response {
        axum::Json(self.0).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::{get, post};
    use axum::{Extension, Router};
    use lurus_db::Store;
    use lurus_types::TenantId;
    use tower::ServiceExt;

    async fn context_for(principal: Option<Principal>, platform_admin: bool) -> RequestContext {
        let store = Store::memory();
        let tenant = store
            .tenants
            .find_by_id(&TenantId::default_tenant())
            .await
            .unwrap()
            .unwrap();
        let db = store.for_tenant(tenant.id.clone());
        RequestContext::new(principal, tenant, db).with_platform_admin(platform_admin)
    }

    fn session(role: Role) -> Principal {
        Principal::session(TenantId::default_tenant(), UserId(7), role)
    }

    async fn admin_status(principal: Option<Principal>, platform_admin: bool) -> StatusCode {
        let app = Router::new()
            .route("/", get(|_: RequireAdmin| async { "ok" }))
            .layer(Extension(context_for(principal, platform_admin).await));
        app.oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn admin_extractor_checks_role() {
        assert_eq!(admin_status(Some(session(Role::Admin)), false).await, StatusCode::OK);
        assert_eq!(admin_status(Some(session(Role::Root)), false).await, StatusCode::OK);
        assert_eq!(
            admin_status(Some(session(Role::Common)), false).await,
            StatusCode::FORBIDDEN
        );
        assert_eq!(admin_status(None, false).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn platform_admin_passes_admin_extractor() {
        let bearer = Principal::bearer(
            TenantId::default_tenant(),
            UserId(3),
            Role::Common,
            vec!["platform_admin".into()],
        );
        assert_eq!(admin_status(Some(bearer), true).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn bearer_needs_a_role_grant() {
        let local_admin = Principal::bearer(TenantId::default_tenant(), UserId(4), Role::Admin, vec![]);
        assert_eq!(admin_status(Some(local_admin), false).await, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn service_key_is_not_a_user() {
        let key = Principal::service(None, "ops".into(), vec!["*".into()]);
        assert_eq!(admin_status(Some(key), true).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn platform_flag_gates_platform_routes() {
        async fn status(principal: Principal, platform_admin: bool) -> StatusCode {
            let app = Router::new()
                .route("/", get(|_: RequirePlatformAdmin| async { "ok" }))
                .layer(Extension(context_for(Some(principal), platform_admin).await));
            app.oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
                .await
                .unwrap()
                .status()
        }

        assert_eq!(status(session(Role::Root), true).await, StatusCode::OK);
        assert_eq!(status(session(Role::Root), false).await, StatusCode::FORBIDDEN);
        assert_eq!(status(session(Role::Admin), false).await, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn missing_context_is_500() {
        let app = Router::new().route("/", get(|_: TenantCtx| async { "ok" }));
        let status = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn malformed_json_uses_envelope() {
        let app = Router::new().route(
            "/",
            post(|ApiJson(v): ApiJson<serde_json::Value>| async move { ApiJson(v) }),
        );
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = http_body_util::BodyExt::collect(response.into_body())
            .await
            .unwrap()
            .to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error_code"], "VALIDATION_FAILED");
    }
}
