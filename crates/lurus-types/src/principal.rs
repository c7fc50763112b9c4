//! Authenticated principals

use serde::{Deserialize, Serialize};

use crate::{has_scope, Role, TenantId, UserId};

/// How the credentials of a request were presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPlane {
    /// No credentials
    Public,
    /// Session cookie from a password or phone login
    Session,
    /// OIDC bearer JWT
    BearerJwt,
    /// Internal service API key
    ServiceKey,
}

impl AuthPlane {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Session => "session",
            Self::BearerJwt => "bearer_jwt",
            Self::ServiceKey => "service_key",
        }
    }
}

impl std::fmt::Display for AuthPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authenticated actor of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// `None` for platform-wide service keys
    pub tenant_id: Option<TenantId>,
    /// `None` for service keys
    pub user_id: Option<UserId>,
    pub role: Role,
    /// Capability set of a service key
    pub scopes: Vec<String>,
    /// Role claims of an OIDC token
    pub roles: Vec<String>,
    pub plane: AuthPlane,
    /// Name of the service key, for audit logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
}

impl Principal {
    /// Principal of a user logged in through the password or phone plane
    pub fn session(tenant_id: TenantId, user_id: UserId, role: Role) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            user_id: Some(user_id),
            role,
            scopes: Vec::new(),
            roles: Vec::new(),
            plane: AuthPlane::Session,
            key_name: None,
        }
    }

    /// Principal of an OIDC bearer token mapped to a local user
    pub fn bearer(tenant_id: TenantId, user_id: UserId, role: Role, roles: Vec<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            user_id: Some(user_id),
            role,
            scopes: Vec::new(),
            roles,
            plane: AuthPlane::BearerJwt,
            key_name: None,
        }
    }

    /// Principal of a service key
    pub fn service(tenant_id: Option<TenantId>, name: String, scopes: Vec<String>) -> Self {
        Self {
            tenant_id,
            user_id: None,
            role: Role::Common,
            scopes,
            roles: Vec::new(),
            plane: AuthPlane::ServiceKey,
            key_name: Some(name),
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        has_scope(&self.scopes, scope)
    }

    /// Whether the OIDC role claims contain `role`
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn has_any_role(&self, roles: &[&str]) -> bool {
        roles.iter().any(|r| self.has_role(r))
    }

    pub fn is_service(&self) -> bool {
        self.plane == AuthPlane::ServiceKey
    }
}
