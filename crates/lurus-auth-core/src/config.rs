//! Configuration types for the auth core

use std::time::Duration;

use crate::gate::Gate;

/// Who may create an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationMode {
    #[default]
    Open,
    /// New accounts must redeem an invitation code
    InviteOnly,
    Closed,
}

impl RegistrationMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Some(Self::Open),
            "invite_only" | "invite-only" => Some(Self::InviteOnly),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InviteOnly => "invite_only",
            Self::Closed => "closed",
        }
    }
}

/// OIDC provider settings for the bearer plane
#[derive(Debug, Clone)]
pub struct OidcConfig {
    /// Expected `iss` claim
    pub issuer: String,
    /// JWKS endpoint; defaults to `{issuer}/oauth/v2/keys`
    pub jwks_uri: Option<String>,
    pub client_id: String,
    /// Create a tenant for an unknown organisation
    pub auto_create_tenant: bool,
    /// Create a local user for an unknown subject
    pub auto_create_user: bool,
    /// Periodic JWKS refresh
    pub jwks_refresh_interval: Duration,
    /// Minimum spacing between refreshes triggered by unknown key IDs
    pub kid_miss_cooldown: Duration,
    /// Timeout of a JWKS fetch
    pub fetch_timeout: Duration,
}

impl OidcConfig {
    pub fn new(issuer: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            jwks_uri: None,
            client_id: client_id.into(),
            auto_create_tenant: false,
            auto_create_user: false,
            jwks_refresh_interval: Duration::from_secs(60 * 60),
            kid_miss_cooldown: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(15),
        }
    }

    /// Get the JWKS URL
    pub fn jwks_url(&self) -> String {
        match &self.jwks_uri {
            Some(uri) => uri.clone(),
            None => format!("{}/oauth/v2/keys", self.issuer.trim_end_matches('/')),
        }
    }

    pub fn with_jwks_uri(mut self, uri: impl Into<String>) -> Self {
        self.jwks_uri = Some(uri.into());
        self
    }

    pub fn with_auto_create(mut self, tenant: bool, user: bool) -> Self {
        self.auto_create_tenant = tenant;
        self.auto_create_user = user;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.jwks_refresh_interval = interval;
        self
    }

    pub fn with_kid_miss_cooldown(mut self, cooldown: Duration) -> Self {
        self.kid_miss_cooldown = cooldown;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }
}

/// Auth core configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// HMAC secret for session cookies; at least 32 bytes
    pub session_secret: String,
    pub session_duration: Duration,
    /// `None` disables the bearer plane
    pub oidc: Option<OidcConfig>,
    /// OIDC role that may act on any tenant
    pub platform_admin_role: String,
    /// Role that implies every other role claim; the platform admin role when unset
    pub superset_role: Option<String>,
    /// OIDC roles, any of which admits a bearer principal to admin routes
    pub admin_roles: Vec<String>,
    pub registration_mode: RegistrationMode,
    /// Create an account on the first phone login of an unknown number
    pub sms_auto_register: bool,
    pub verification_ttl: Duration,
    /// Minimum spacing between codes sent to one subject
    pub verification_resend_interval: Duration,
    /// Codes a single source IP may request per hour
    pub verification_per_ip_hourly: u32,
    /// Entry count above which expired codes are purged
    pub verification_soft_cap: usize,
}

impl AuthConfig {
    /// Create a new auth config
    pub fn new(session_secret: impl Into<String>) -> Self {
        Self {
            session_secret: session_secret.into(),
            session_duration: Duration::from_secs(90 * 24 * 60 * 60),
            oidc: None,
            platform_admin_role: "platform_admin".to_string(),
            superset_role: None,
            admin_roles: vec!["admin".to_string()],
            registration_mode: RegistrationMode::Open,
            sms_auto_register: true,
            verification_ttl: Duration::from_secs(10 * 60),
            verification_resend_interval: Duration::from_secs(60),
            verification_per_ip_hourly: 10,
            verification_soft_cap: 10_000,
        }
    }

    pub fn with_oidc(mut self, oidc: OidcConfig) -> Self {
        self.oidc = Some(oidc);
        self
    }

    /// Set session duration
    pub fn with_session_duration(mut self, duration: Duration) -> Self {
        self.session_duration = duration;
        self
    }

    pub fn with_platform_admin_role(mut self, role: impl Into<String>) -> Self {
        self.platform_admin_role = role.into();
        self
    }

    pub fn with_superset_role(mut self, role: impl Into<String>) -> Self {
        self.superset_role = Some(role.into());
        self
    }

    pub fn with_admin_roles(mut self, roles: Vec<String>) -> Self {
        self.admin_roles = roles;
        self
    }

    /// Role gate for bearer principals
    pub fn gate(&self) -> Gate {
        let superset = self
            .superset_role
            .clone()
            .unwrap_or_else(|| self.platform_admin_role.clone());
        Gate::new(Some(superset))
    }

    pub fn with_registration_mode(mut self, mode: RegistrationMode) -> Self {
        self.registration_mode = mode;
        self
    }

    pub fn with_sms_auto_register(mut self, enabled: bool) -> Self {
        self.sms_auto_register = enabled;
        self
    }

    pub fn with_verification_ttl(mut self, ttl: Duration) -> Self {
        self.verification_ttl = ttl;
        self
    }

    pub fn with_verification_limits(mut self, resend_interval: Duration, per_ip_hourly: u32) -> Self {
        self.verification_resend_interval = resend_interval;
        self.verification_per_ip_hourly = per_ip_hourly;
        self
    }

    pub fn with_verification_soft_cap(mut self, cap: usize) -> Self {
        self.verification_soft_cap = cap;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = AuthConfig::new("s".repeat(32));
        assert_eq!(config.session_duration, Duration::from_secs(7_776_000));
        assert_eq!(config.verification_ttl, Duration::from_secs(600));
        assert_eq!(config.registration_mode, RegistrationMode::Open);
        assert!(config.oidc.is_none());
        assert_eq!(config.admin_roles, vec!["admin".to_string()]);
    }

    #[test]
    fn gate_superset_follows_platform_admin_role() {
        use lurus_types::{Principal, Role, TenantId, UserId};

        let bearer = |role: &str| {
            Principal::bearer(TenantId::default_tenant(), UserId(1), Role::Common, vec![role.into()])
        };
        let config = AuthConfig::new("s".repeat(32)).with_platform_admin_role("ops");
        assert!(config.gate().require_role(&bearer("ops"), "admin").is_ok());
        assert!(config.gate().require_role(&bearer("platform_admin"), "admin").is_err());

        let config = config.with_superset_role("root_claim");
        assert!(config.gate().require_role(&bearer("root_claim"), "admin").is_ok());
        assert!(config.gate().require_role(&bearer("ops"), "admin").is_err());
    }

    #[test]
    fn jwks_url_derivation() {
        let oidc = OidcConfig::new("https://auth.example.com/", "client");
        assert_eq!(oidc.jwks_url(), "https://auth.example.com/oauth/v2/keys");
        let oidc = oidc.with_jwks_uri("http://127.0.0.1:9000/keys");
        assert_eq!(oidc.jwks_url(), "http://127.0.0.1:9000/keys");
        assert_eq!(oidc.fetch_timeout, Duration::from_secs(15));
    }

    #[test]
    fn registration_mode_parse() {
        assert_eq!(RegistrationMode::parse("invite_only"), Some(RegistrationMode::InviteOnly));
        assert_eq!(RegistrationMode::parse(" Closed "), Some(RegistrationMode::Closed));
        assert_eq!(RegistrationMode::parse("sometimes"), None);
    }
}
