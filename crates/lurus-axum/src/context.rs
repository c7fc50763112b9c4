//! Per-request context.
//!
//! [`AuthLayer`](crate::AuthLayer) stores a [`RequestContext`] in the
//! request extensions once credentials are resolved and the tenant is bound.

use lurus_auth_core::AuthError;
use lurus_db::TenantDb;
use lurus_types::{AuthPlane, Principal, Tenant, UserId};

/// Who is calling and which tenant the call is bound to
#[derive(Clone)]
pub struct RequestContext {
    /// `None` on public routes called without credentials
    pub principal: Option<Principal>,
    pub tenant: Tenant,
    /// Data handle scoped to `tenant`
    pub db: TenantDb,
    /// The principal may act across tenants
    pub platform_admin: bool,
    /// A bearer principal passed the route's OIDC role check
    pub role_granted: bool,
}

impl RequestContext {
    pub fn new(principal: Option<Principal>, tenant: Tenant, db: TenantDb) -> Self {
        Self {
            principal,
            tenant,
            db,
            platform_admin: false,
            role_granted: false,
        }
    }

    pub fn with_platform_admin(mut self, platform_admin: bool) -> Self {
        self.platform_admin = platform_admin;
        self
    }

    pub fn plane(&self) -> AuthPlane {
        self.principal
            .as_ref()
            .map(|p| p.plane)
            .unwrap_or(AuthPlane::Public)
    }

    pub fn require_principal(&self) -> Result<&Principal, AuthError> {
        self.principal.as_ref().ok_or(AuthError::AuthFailed)
    }

    /// Local user behind the request; service keys have none
    pub fn user_id(&self) -> Option<UserId> {
        self.principal.as_ref().and_then(|p| p.user_id)
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("principal", &self.principal)
            .field("tenant_id", &self.tenant.id)
            .field("platform_admin", &self.platform_admin)
            .field("role_granted", &self.role_granted)
            .finish_non_exhaustive()
    }
}
