//! Route layer gating bearer principals on an OIDC role claim.
//!
//! Session users and service keys pass through untouched; the extractors
//! check their local role. Must sit inside [`AuthLayer`](crate::AuthLayer):
//!
//! ```ignore
//! Router::new()
//!     .route("/api/admin/api-keys", get(list_api_keys))
//!     .route_layer(RequireRoleLayer::any(config.gate(), config.admin_roles.clone()))
//!     .route_layer(AuthLayer::users(resolver));
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use lurus_auth_core::{AuthError, Gate};
use lurus_types::AuthPlane;
use pin_project_lite::pin_project;
use tower::{Layer, Service};

use crate::context::RequestContext;
use crate::error::ApiError;

/// Layer requiring one of `roles` on bearer principals
#[derive(Debug, Clone)]
pub struct RequireRoleLayer {
    roles: Arc<[String]>,
    gate: Gate,
}

impl RequireRoleLayer {
    pub fn new(gate: Gate, role: impl Into<String>) -> Self {
        Self::any(gate, vec![role.into()])
    }

    pub fn any(gate: Gate, roles: Vec<String>) -> Self {
        Self {
            roles: roles.into(),
            gate,
        }
    }
}

impl<S> Layer<S> for RequireRoleLayer {
    type Service = RequireRole<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequireRole {
            inner,
            roles: self.roles.clone(),
            gate: self.gate.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequireRole<S> {
    inner: S,
    roles: Arc<[String]>,
    gate: Gate,
}

impl<S> RequireRole<S> {
    fn check(&self, req: &mut Request<Body>) -> Result<(), ApiError> {
        let ctx = req
            .extensions_mut()
            .get_mut::<RequestContext>()
            .ok_or(AuthError::AuthFailed)?;
        let principal = ctx.principal.as_ref().ok_or(AuthError::AuthFailed)?;
        if principal.plane != AuthPlane::BearerJwt {
            return Ok(());
        }
        let roles: Vec<&str> = self.roles.iter().map(String::as_str).collect();
        self.gate.require_any_role(principal, &roles).map_err(|e| {
            tracing::info!(user_id = ?principal.user_id, required = ?roles, "Role check failed");
            ApiError::from(e)
        })?;
        ctx.role_granted = true;
        Ok(())
    }
}

impl<S> Service<Request<Body>> for RequireRole<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = RequireRoleFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        match self.check(&mut req) {
            Ok(()) => RequireRoleFuture::Inner {
                fut: self.inner.call(req),
            },
            Err(e) => RequireRoleFuture::Rejected {
                resp: Some(e.into_response()),
            },
        }
    }
}

pin_project! {
    /// Future for [`RequireRole`]
    #[project = RequireRoleFutureProj]
    pub enum RequireRoleFuture<F> {
        Inner { #[pin] fut: F },
        Rejected { resp: Option<Response> },
    }
}

impl<F, E> Future for RequireRoleFuture<F>
where
    F: Future<Output = Result<Response, E>>,
{
    type Output = Result<Response, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            RequireRoleFutureProj::Inner { fut } => fut.poll(cx),
            RequireRoleFutureProj::Rejected { resp } => Poll::Ready(Ok(resp
                .take()
                .unwrap_or_else(|| StatusCode::INTERNAL_SERVER_ERROR.into_response()))),
        }
    }
}
