//! Tenant binding
//!
//! A request's tenant comes from, in order: the organisation of an OIDC
//! principal, a tenant slug in the URL path, the target-tenant header of a
//! platform administrator, and finally the default tenant. The bound tenant
//! must be enabled.

use lurus_db::{CreateTenant, DbError, Store, TenantDb};
use lurus_types::{slugify, Principal, Role, Tenant, TenantId, AuthPlane};
use tracing::instrument;

use crate::token::OidcClaims;
use crate::AuthError;

/// Header a platform administrator uses to act on another tenant
pub const TARGET_TENANT_HEADER: &str = "x-target-tenant";

/// Request-derived inputs to tenant binding
#[derive(Debug, Default, Clone, Copy)]
pub struct BindRequest<'a> {
    pub principal: Option<&'a Principal>,
    /// Tenant slug from the URL path
    pub path_slug: Option<&'a str>,
    /// Value of [`TARGET_TENANT_HEADER`]
    pub target_tenant: Option<&'a str>,
}

/// Maps principals and requests onto tenants
#[derive(Clone)]
pub struct TenantBinder {
    store: Store,
    platform_admin_role: String,
    auto_create: bool,
}

impl TenantBinder {
    pub fn new(store: Store, platform_admin_role: impl Into<String>) -> Self {
        Self {
            store,
            platform_admin_role: platform_admin_role.into(),
            auto_create: false,
        }
    }

    /// Create tenants for unknown OIDC organisations
    pub fn with_auto_create(mut self, enabled: bool) -> Self {
        self.auto_create = enabled;
        self
    }

    pub fn platform_admin_role(&self) -> &str {
        &self.platform_admin_role
    }

    /// Whether `principal` may act across tenants.
    ///
    /// Holders of the platform-admin role claim qualify, as do service keys
    /// not bound to any tenant and root users of the default tenant.
    pub fn is_platform_admin(&self, principal: &Principal) -> bool {
        principal.has_role(&self.platform_admin_role)
            || (principal.plane == AuthPlane::ServiceKey && principal.tenant_id.is_none())
            || (principal.role == Role::Root
                && principal.user_id.is_some()
                && principal.tenant_id.as_ref() == Some(&TenantId::default_tenant()))
    }

    /// Tenant for the organisation named in a token, created on first sight
    /// when auto-creation is on
    #[instrument(skip(self, claims), fields(org = claims.organisation().unwrap_or_default()))]
    pub async fn resolve_org(&self, claims: &OidcClaims) -> Result<Tenant, AuthError> {
        let org_id = claims.organisation().ok_or(AuthError::InvalidToken)?;

        if let Some(tenant) = self.store.tenants.find_by_external_org(org_id).await? {
            return Ok(tenant);
        }
        if !self.auto_create {
            tracing::debug!(org_id, "No tenant for organisation");
            return Err(AuthError::TenantNotFound);
        }

        let base = [
            claims.org_domain.as_str(),
            claims.resource_owner_name.as_str(),
            org_id,
        ]
        .into_iter()
        .map(slugify)
        .find(|s| !s.is_empty())
        .unwrap_or_else(|| "tenant".to_string());

        let name = [claims.resource_owner_name.as_str(), claims.org_domain.as_str(), org_id]
            .into_iter()
            .find(|s| !s.is_empty())
            .unwrap_or(org_id)
            .to_string();

        let mut slug = base.clone();
        if self.store.tenants.find_by_slug(&slug).await?.is_some() {
            slug = collision_slug(&base, org_id);
        }

        let created = self
            .store
            .tenants
            .create(CreateTenant {
                external_org_id: org_id.to_string(),
                slug,
                name,
                plan_type: "free".to_string(),
                max_users: 0,
                max_quota: 0,
            })
            .await;

        match created {
            Ok(tenant) => {
                tracing::info!(tenant_id = %tenant.id, org_id, slug = %tenant.slug, "Auto-created tenant");
                Ok(tenant)
            }
            // Lost a race with a concurrent first login of the same org
            Err(DbError::Conflict(_)) => self
                .store
                .tenants
                .find_by_external_org(org_id)
                .await?
                .ok_or_else(|| AuthError::Conflict("Tenant slug already taken".into())),
            Err(e) => Err(e.into()),
        }
    }

    /// Bind a request to its tenant
    pub async fn bind(&self, request: BindRequest<'_>) -> Result<Tenant, AuthError> {
        let tenant = self.select(request).await?;
        ensure_enabled(&tenant)?;
        Ok(tenant)
    }

    async fn select(&self, request: BindRequest<'_>) -> Result<Tenant, AuthError> {
        let principal = request.principal;

        if let Some(p) = principal.filter(|p| p.plane == AuthPlane::BearerJwt) {
            if let Some(id) = &p.tenant_id {
                return self.find(id).await;
            }
        }

        if let Some(slug) = request.path_slug.filter(|s| !s.is_empty()) {
            let tenant = self
                .store
                .tenants
                .find_by_slug(slug)
                .await?
                .ok_or(AuthError::TenantNotFound)?;
            if let Some(p) = principal {
                let foreign = p.tenant_id.as_ref().is_some_and(|id| *id != tenant.id);
                if foreign && !self.is_platform_admin(p) {
                    return Err(AuthError::Forbidden("Cross-tenant access denied".into()));
                }
            }
            return Ok(tenant);
        }

        if let (Some(p), Some(target)) = (principal, request.target_tenant) {
            if self.is_platform_admin(p) {
                let id = TenantId::new(target.trim());
                tracing::info!(target_tenant = %id, "Platform admin acting on tenant");
                return self.find(&id).await;
            }
            tracing::debug!("Ignoring target tenant header from non platform admin");
        }

        if let Some(id) = principal.and_then(|p| p.tenant_id.as_ref()) {
            return self.find(id).await;
        }

        self.find(&TenantId::default_tenant()).await
    }

    async fn find(&self, id: &TenantId) -> Result<Tenant, AuthError> {
        self.store
            .tenants
            .find_by_id(id)
            .await?
            .ok_or(AuthError::TenantNotFound)
    }

    /// Data handle scoped to `tenant`
    pub fn handle(&self, tenant: &Tenant) -> TenantDb {
        self.store.for_tenant(tenant.id.clone())
    }
}

/// Reject tenants that are disabled or suspended
pub fn ensure_enabled(tenant: &Tenant) -> Result<(), AuthError> {
    if tenant.is_enabled() {
        Ok(())
    } else {
        tracing::debug!(tenant_id = %tenant.id, status = ?tenant.status, "Tenant not enabled");
        Err(AuthError::TenantDisabled)
    }
}

/// Slug used when `base` is taken: suffixed with part of the org ID
fn collision_slug(base: &str, org_id: &str) -> String {
    let suffix: String = slugify(org_id).chars().filter(|c| *c != '-').take(8).collect();
    let suffix = if suffix.is_empty() { "org".to_string() } else { suffix };
    let head: String = base.chars().take(64 - suffix.len() - 1).collect();
    format!("{}-{suffix}", head.trim_end_matches('-'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lurus_types::{TenantStatus, UserId};

    fn claims(org_id: &str, domain: &str) -> OidcClaims {
        serde_json::from_value(serde_json::json!({
            "sub": "u1",
            "iss": "https://auth.example.com",
            "exp": 4_000_000_000i64,
            "urn:zitadel:iam:org:id": org_id,
            "urn:zitadel:iam:org:domain:primary": domain,
        }))
        .unwrap()
    }

    fn admin_principal(tenant: TenantId) -> Principal {
        Principal::bearer(tenant, UserId(1), Role::Common, vec!["platform_admin".into()])
    }

    #[test]
    fn collision_slug_shape() {
        assert_eq!(collision_slug("acme-com", "2749-0012"), "acme-com-27490012");
        let long = "a".repeat(64);
        assert!(collision_slug(&long, "org123").len() <= 64);
    }

    #[tokio::test]
    async fn unknown_org_without_auto_create() {
        let binder = TenantBinder::new(Store::memory(), "platform_admin");
        assert!(matches!(
            binder.resolve_org(&claims("org-1", "acme.com")).await,
            Err(AuthError::TenantNotFound)
        ));
    }

    #[tokio::test]
    async fn auto_create_and_reuse() {
        let binder = TenantBinder::new(Store::memory(), "platform_admin").with_auto_create(true);
        let first = binder.resolve_org(&claims("org-1", "acme.com")).await.unwrap();
        assert_eq!(first.slug, "acme-com");
        let again = binder.resolve_org(&claims("org-1", "acme.com")).await.unwrap();
        assert_eq!(first.id, again.id);
    }

    #[tokio::test]
    async fn slug_collision_gets_suffix() {
        let binder = TenantBinder::new(Store::memory(), "platform_admin").with_auto_create(true);
        let a = binder.resolve_org(&claims("org-1", "acme.com")).await.unwrap();
        let b = binder.resolve_org(&claims("org-2", "acme.com")).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(b.slug, "acme-com-org2");
    }

    #[tokio::test]
    async fn falls_back_to_default_tenant() {
        let binder = TenantBinder::new(Store::memory(), "platform_admin");
        let tenant = binder.bind(BindRequest::default()).await.unwrap();
        assert_eq!(tenant.id, TenantId::default_tenant());
    }

    #[tokio::test]
    async fn target_header_needs_platform_admin() {
        let store = Store::memory();
        let binder = TenantBinder::new(store.clone(), "platform_admin").with_auto_create(true);
        let other = binder.resolve_org(&claims("org-9", "other.io")).await.unwrap();

        let session = Principal::session(TenantId::default_tenant(), UserId(2), Role::Admin);
        let bound = binder
            .bind(BindRequest {
                principal: Some(&session),
                target_tenant: Some(other.id.as_str()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(bound.id, TenantId::default_tenant());

        let platform = Principal::service(None, "ops".into(), vec!["*".into()]);
        let bound = binder
            .bind(BindRequest {
                principal: Some(&platform),
                target_tenant: Some(other.id.as_str()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(bound.id, other.id);
    }

    #[tokio::test]
    async fn foreign_slug_is_forbidden() {
        let store = Store::memory();
        let binder = TenantBinder::new(store.clone(), "platform_admin").with_auto_create(true);
        let other = binder.resolve_org(&claims("org-9", "other.io")).await.unwrap();

        let session = Principal::session(TenantId::default_tenant(), UserId(2), Role::Admin);
        let err = binder
            .bind(BindRequest {
                principal: Some(&session),
                path_slug: Some(&other.slug),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);

        let admin = admin_principal(TenantId::default_tenant());
        let session_admin = Principal { plane: AuthPlane::Session, ..admin };
        let bound = binder
            .bind(BindRequest {
                principal: Some(&session_admin),
                path_slug: Some(&other.slug),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(bound.id, other.id);
    }

    #[tokio::test]
    async fn disabled_tenant_is_rejected() {
        let store = Store::memory();
        let binder = TenantBinder::new(store.clone(), "platform_admin").with_auto_create(true);
        let tenant = binder.resolve_org(&claims("org-3", "closed.io")).await.unwrap();
        store
            .tenants
            .update_status(&tenant.id, TenantStatus::Suspended)
            .await
            .unwrap();

        let principal = Principal::bearer(tenant.id.clone(), UserId(1), Role::Common, vec![]);
        let err = binder
            .bind(BindRequest {
                principal: Some(&principal),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TenantDisabled));
    }

    #[test]
    fn default_tenant_root_is_platform_admin() {
        let binder = TenantBinder::new(Store::memory(), "platform_admin");
        let root = Principal::session(TenantId::default_tenant(), UserId(1), Role::Root);
        assert!(binder.is_platform_admin(&root));
        let tenant_root = Principal::session(TenantId::new("acme"), UserId(1), Role::Root);
        assert!(!binder.is_platform_admin(&tenant_root));
        let admin = Principal::session(TenantId::default_tenant(), UserId(2), Role::Admin);
        assert!(!binder.is_platform_admin(&admin));
    }
}
