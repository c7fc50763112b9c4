//! Tenant scoping of data access

use lurus_types::TenantId;

/// Which tenant's rows a query may see.
///
/// Every scoped repository method filters on the bound tenant and stamps it
/// onto inserted rows. `System` lifts the filter and is reserved for
/// platform-level code paths: background jobs, payment webhooks, and
/// platform administrators.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TenantScope {
    Tenant(TenantId),
    System,
}

impl TenantScope {
    /// Value bound to the `($n::text IS NULL OR tenant_id = $n)` filter
    pub fn filter(&self) -> Option<&str> {
        match self {
            Self::Tenant(id) => Some(id.as_str()),
            Self::System => None,
        }
    }

    pub fn tenant(&self) -> Option<&TenantId> {
        match self {
            Self::Tenant(id) => Some(id),
            Self::System => None,
        }
    }

    /// Whether a row owned by `tenant` is visible in this scope
    pub fn allows(&self, tenant: &TenantId) -> bool {
        match self {
            Self::Tenant(id) => id == tenant,
            Self::System => true,
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System)
    }
}

impl From<TenantId> for TenantScope {
    fn from(id: TenantId) -> Self {
        Self::Tenant(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_scope_only_allows_its_tenant() {
        let scope = TenantScope::Tenant(TenantId::new("t1"));
        assert!(scope.allows(&TenantId::new("t1")));
        assert!(!scope.allows(&TenantId::new("t2")));
        assert_eq!(scope.filter(), Some("t1"));
    }

    #[test]
    fn system_scope_sees_everything() {
        assert!(TenantScope::System.allows(&TenantId::new("any")));
        assert_eq!(TenantScope::System.filter(), None);
    }
}
