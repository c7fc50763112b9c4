//! Route layer gating service-key routes on a scope.
//!
//! Must sit inside [`AuthLayer`](crate::AuthLayer), which supplies the
//! principal:
//!
//! ```ignore
//! Router::new()
//!     .route("/internal/quota/adjust", post(adjust))
//!     .route_layer(RequireScopeLayer::new("quota:write"))
//!     .route_layer(AuthLayer::service_keys(resolver));
//! ```

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use lurus_auth_core::{AuthError, Gate};
use pin_project_lite::pin_project;
use tower::{Layer, Service};

use crate::context::RequestContext;
use crate::error::ApiError;

/// Layer requiring `scope` on the request's principal
#[derive(Debug, Clone)]
pub struct RequireScopeLayer {
    scope: &'static str,
    gate: Gate,
}

impl RequireScopeLayer {
    pub fn new(scope: &'static str) -> Self {
        Self {
            scope,
            gate: Gate::default(),
        }
    }
}

impl<S> Layer<S> for RequireScopeLayer {
    type Service = RequireScope<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequireScope {
            inner,
            scope: self.scope,
            gate: self.gate.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequireScope<S> {
    inner: S,
    scope: &'static str,
    gate: Gate,
}

impl<S> RequireScope<S> {
    fn check(&self, req: &Request<Body>) -> Result<(), ApiError> {
        let principal = req
            .extensions()
            .get::<RequestContext>()
            .and_then(|ctx| ctx.principal.as_ref())
            .ok_or(AuthError::AuthFailed)?;
        self.gate.require_scope(principal, self.scope).map_err(|e| {
            tracing::info!(key_name = ?principal.key_name, scope = self.scope, "Scope check failed");
            ApiError::from(e)
        })
    }
}

impl<S> Service<Request<Body>> for RequireScope<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = RequireScopeFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        match self.check(&req) {
            Ok(()) => RequireScopeFuture::Inner {
                fut: self.inner.call(req),
            },
            Err(e) => RequireScopeFuture::Rejected {
                resp: Some(e.into_response()),
            },
        }
    }
}

pin_project! {
    /// Future for [`RequireScope`]
    #[project = RequireScopeFutureProj]
    pub enum RequireScopeFuture<F> {
        Inner { #[pin] fut: F },
        Rejected { resp: Option<Response> },
    }
}

impl<F, E> Future for RequireScopeFuture<F>
where
    F: Future<Output = Result<Response, E>>,
{
    type Output = Result<Response, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            RequireScopeFutureProj::Inner { fut } => fut.poll(cx),
            RequireScopeFutureProj::Rejected { resp } => Poll::Ready(Ok(resp
                .take()
                .unwrap_or_else(|| StatusCode::INTERNAL_SERVER_ERROR.into_response()))),
        }
    }
}
