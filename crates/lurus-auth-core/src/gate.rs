//! Scope and role checks on resolved principals

use lurus_types::{Principal, Role};

use crate::AuthError;

/// Capability checks applied after a principal is resolved.
///
/// A configured superset role passes every role check.
#[derive(Debug, Clone, Default)]
pub struct Gate {
    superset_role: Option<String>,
}

impl Gate {
    pub fn new(superset_role: Option<String>) -> Self {
        Self {
            superset_role: superset_role.filter(|r| !r.is_empty()),
        }
    }

    fn is_superset(&self, principal: &Principal) -> bool {
        self.superset_role
            .as_deref()
            .is_some_and(|role| principal.has_role(role))
    }

    /// Require `scope` on a service key principal
    pub fn require_scope(&self, principal: &Principal, scope: &str) -> Result<(), AuthError> {
        if principal.has_scope(scope) {
            Ok(())
        } else {
            tracing::debug!(key = ?principal.key_name, scope, "Missing scope");
            Err(AuthError::forbidden_scope(scope))
        }
    }

    /// Require the OIDC role claim `role`
    pub fn require_role(&self, principal: &Principal, role: &str) -> Result<(), AuthError> {
        if principal.has_role(role) || self.is_superset(principal) {
            Ok(())
        } else {
            Err(AuthError::forbidden_role(role))
        }
    }

    /// Require at least one of `roles`
    pub fn require_any_role(&self, principal: &Principal, roles: &[&str]) -> Result<(), AuthError> {
        if principal.has_any_role(roles) || self.is_superset(principal) {
            Ok(())
        } else {
            Err(AuthError::forbidden_role(&roles.join(",")))
        }
    }

    /// Require a local user of at least `min` privilege
    pub fn require_user_role(&self, principal: &Principal, min: Role) -> Result<(), AuthError> {
        if principal.user_id.is_some() && principal.role >= min {
            Ok(())
        } else {
            Err(AuthError::forbidden_role(min.as_str()))
        }
    }
}
