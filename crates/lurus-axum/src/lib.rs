//! Lurus Axum Integration
//!
//! Axum middleware and extractors that put the identity core in front of
//! request handlers.
//!
//! # Overview
//!
//! - **Layers**: [`AuthLayer`] resolves the request's credentials and binds
//!   its tenant; [`RequireScopeLayer`] gates service-key routes on a scope
//!   and [`RequireRoleLayer`] gates bearer principals on an OIDC role
//! - **Extractors**: [`TenantCtx`], [`RequireAuth`], [`RequireUser`],
//!   [`RequireAdmin`], [`RequirePlatformAdmin`] and the envelope-aware [`ApiJson`]
//! - **Errors**: [`ApiError`] renders every failure as the uniform
//!   `{success, message, error_code}` envelope
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use axum::{routing::get, Router};
//! use lurus_axum::{AuthLayer, RequireScopeLayer, RequireUser};
//!
//! async fn me(user: RequireUser) -> String {
//!     format!("Hello, user {}!", user.user_id)
//! }
//!
//! let internal = Router::new()
//!     .route("/internal/user/{id}", get(get_user))
//!     .route_layer(RequireScopeLayer::new("user:read"))
//!     .route_layer(AuthLayer::service_keys(resolver.clone()));
//!
//! let app = Router::new()
//!     .route("/api/user/self", get(me))
//!     .route_layer(AuthLayer::required(resolver))
//!     .merge(internal);
//! ```

pub mod context;
pub mod error;
pub mod extractors;
pub mod layer;
pub mod role;
pub mod scope;

pub use context::RequestContext;
pub use error::{ApiError, ApiResult};
pub use extractors::{
    ApiJson, RequireAdmin, RequireAuth, RequirePlatformAdmin, RequireUser, TenantCtx,
};
pub use layer::{extract_credentials, AuthLayer, AuthService, API_KEY_HEADER};
pub use role::{RequireRole, RequireRoleLayer};
pub use scope::{RequireScope, RequireScopeLayer};
