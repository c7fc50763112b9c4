//! Configuration for the IAM API service.

use std::path::PathBuf;
use std::time::Duration;

use lurus_auth_core::{AuthConfig, OidcConfig, RegistrationMode, SmsConfig};
use lurus_entitlement::{CreemConfig, EntitlementConfig, EpayConfig, StripeConfig, WatchdogConfig};

const MIN_SESSION_SECRET_LEN: usize = 32;

/// IAM API configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port
    pub port: u16,

    /// `None` runs on the in-memory store
    pub database_url: Option<String>,

    /// Master nodes run the background loops
    pub is_master: bool,

    /// Auth core configuration
    pub auth: AuthConfig,

    /// `None` disables the phone plane
    pub sms: Option<SmsConfig>,

    /// Entitlement configuration (gateways, quota, jobs, watchdog)
    pub entitlement: EntitlementConfig,

    /// Period of the plan catalog sync
    pub sync_interval: Duration,

    pub batch_update_enabled: bool,

    pub request_timeout: Duration,

    /// Emit JSON log lines
    pub log_json: bool,

    pub metrics_enabled: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let port = env.parse("PORT", 3000)?;
        let database_url = env.string("DATABASE_URL");
        let is_master = env
            .string("NODE_TYPE")
            .map_or(true, |t| t.eq_ignore_ascii_case("master"));

        // Session secret (minimum 32 bytes)
        let session_secret = env
            .string("SESSION_SECRET")
            .ok_or(ConfigError::Missing("SESSION_SECRET"))?;
        if session_secret.len() < MIN_SESSION_SECRET_LEN {
            return Err(ConfigError::Invalid(
                "SESSION_SECRET must be at least 32 characters",
            ));
        }

        let registration_mode = match env.string("REGISTRATION_MODE") {
            Some(raw) => RegistrationMode::parse(&raw)
                .ok_or(ConfigError::Invalid("REGISTRATION_MODE"))?,
            None => RegistrationMode::Open,
        };

        let verification_ttl = Duration::from_secs(env.parse::<u64>("VERIFICATION_TTL_MINUTES", 10)? * 60);

        let mut auth = AuthConfig::new(session_secret)
            .with_registration_mode(registration_mode)
            .with_sms_auto_register(env.flag("SMS_AUTO_REGISTER", true)?)
            .with_verification_ttl(verification_ttl);
        if let Some(role) = env.string("PLATFORM_ADMIN_ROLE") {
            auth = auth.with_platform_admin_role(role);
        }
        if let Some(roles) = env.string("OIDC_ADMIN_ROLES") {
            let roles: Vec<String> = roles
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
            if roles.is_empty() {
                return Err(ConfigError::Invalid("OIDC_ADMIN_ROLES"));
            }
            auth = auth.with_admin_roles(roles);
        }

        // OIDC (Zitadel)
        if env.flag("ZITADEL_ENABLED", false)? {
            let issuer = env
                .string("ZITADEL_ISSUER")
                .ok_or(ConfigError::Missing("ZITADEL_ISSUER"))?;
            let client_id = env
                .string("ZITADEL_CLIENT_ID")
                .ok_or(ConfigError::Missing("ZITADEL_CLIENT_ID"))?;
            let mut oidc = OidcConfig::new(issuer, client_id).with_auto_create(
                env.flag("ZITADEL_AUTO_CREATE_TENANT", false)?,
                env.flag("ZITADEL_AUTO_CREATE_USER", true)?,
            );
            if let Some(jwks_uri) = env.string("ZITADEL_JWKS_URI") {
                oidc = oidc.with_jwks_uri(jwks_uri);
            }
            auth = auth.with_oidc(oidc);
        }

        let sms = if env.flag("SMS_ENABLED", false)? {
            Some(SmsConfig {
                gateway_url: env.string("SMS_GATEWAY_URL").unwrap_or_default(),
                access_key_id: env.string("SMS_ACCESS_KEY_ID").unwrap_or_default(),
                access_key_secret: env.string("SMS_ACCESS_KEY_SECRET").unwrap_or_default(),
                sign_name: env.string("SMS_SIGN_NAME").unwrap_or_default(),
                template_login: env.string("SMS_TEMPLATE_LOGIN").unwrap_or_default(),
                template_register: env.string("SMS_TEMPLATE_REGISTER").unwrap_or_default(),
                template_reset: env.string("SMS_TEMPLATE_RESET").unwrap_or_default(),
                template_bind: env.string("SMS_TEMPLATE_BIND").unwrap_or_default(),
            })
        } else {
            None
        };

        // Payment gateways and entitlement settings
        let server_address = env
            .string("SERVER_ADDRESS")
            .unwrap_or_else(|| format!("http://localhost:{port}"));
        let mut entitlement = EntitlementConfig::new(server_address)
            .with_quota_per_unit(env.parse("QUOTA_PER_UNIT", lurus_types::QUOTA_PER_UNIT)?)
            .with_daily_quota(env.flag("DAILY_QUOTA_ENABLED", true)?);

        if let Some(secret_key) = env.string("STRIPE_SECRET_KEY") {
            let webhook_secret = env.string("STRIPE_WEBHOOK_SECRET").unwrap_or_default();
            entitlement = entitlement.with_stripe(StripeConfig::new(secret_key, webhook_secret));
        }
        if let Some(api_key) = env.string("CREEM_API_KEY") {
            let webhook_secret = env.string("CREEM_WEBHOOK_SECRET").unwrap_or_default();
            entitlement = entitlement.with_creem(CreemConfig::new(api_key, webhook_secret));
        }
        if let (Some(address), Some(pid)) = (env.string("EPAY_ADDRESS"), env.string("EPAY_PID")) {
            entitlement = entitlement.with_epay(EpayConfig::new(address, pid));
        }
        if env.flag("CPU_WATCHDOG_ENABLED", false)? {
            let mut watchdog = WatchdogConfig::default();
            if let Some(dir) = env.string("PROFILE_DIR") {
                watchdog.profile_dir = PathBuf::from(dir);
            }
            entitlement = entitlement.with_watchdog(watchdog);
        }

        // Plan catalog sync (seconds)
        let sync_interval = Duration::from_secs(env.parse("CHANNEL_UPDATE_FREQUENCY", 60)?);

        // Request timeout (default 30 seconds)
        let request_timeout = Duration::from_secs(env.parse("REQUEST_TIMEOUT_SECS", 30)?);

        let log_json = env
            .string("LOG_FORMAT")
            .is_some_and(|f| f.eq_ignore_ascii_case("json"));

        Ok(Self {
            port,
            database_url,
            is_master,
            auth,
            sms,
            entitlement,
            sync_interval,
            batch_update_enabled: env.flag("BATCH_UPDATE_ENABLED", false)?,
            request_timeout,
            log_json,
            metrics_enabled: env.flag("METRICS_ENABLED", true)?,
        })
    }

    /// Webhook secret for Stripe; empty when Stripe is not configured
    pub fn stripe_webhook_secret(&self) -> &str {
        self.entitlement
            .stripe
            .as_ref()
            .map_or("", |s| s.webhook_secret.as_str())
    }

    /// Webhook secret for Creem; empty accepts unsigned payloads
    pub fn creem_webhook_secret(&self) -> &str {
        self.entitlement
            .creem
            .as_ref()
            .map_or("", |c| c.webhook_secret.as_str())
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// Non-empty value of `key`
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.string(key) {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid(key)),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.string(key).as_deref() {
            None => Ok(default),
            Some("true" | "1" | "yes") => Ok(true),
            Some("false" | "0" | "no") => Ok(false),
            Some(_) => Err(ConfigError::Invalid(key)),
        }
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn defaults_with_only_a_secret() {
        let config = load(&[("SESSION_SECRET", SECRET)]).unwrap();
        assert_eq!(config.port, 3000);
        assert!(config.database_url.is_none());
        assert!(config.is_master);
        assert!(config.sms.is_none());
        assert!(config.auth.oidc.is_none());
        assert_eq!(config.auth.registration_mode, RegistrationMode::Open);
        assert_eq!(config.entitlement.quota_per_unit, 500_000);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(!config.log_json);
    }

    #[test]
    fn session_secret_is_required_and_long() {
        assert!(matches!(load(&[]), Err(ConfigError::Missing("SESSION_SECRET"))));
        assert!(matches!(
            load(&[("SESSION_SECRET", "short")]),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn zitadel_needs_issuer_and_client() {
        let err = load(&[("SESSION_SECRET", SECRET), ("ZITADEL_ENABLED", "true")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("ZITADEL_ISSUER")));

        let config = load(&[
            ("SESSION_SECRET", SECRET),
            ("ZITADEL_ENABLED", "true"),
            ("ZITADEL_ISSUER", "https://auth.example.com"),
            ("ZITADEL_CLIENT_ID", "client"),
            ("ZITADEL_AUTO_CREATE_TENANT", "true"),
        ])
        .unwrap();
        let oidc = config.auth.oidc.unwrap();
        assert!(oidc.auto_create_tenant);
    }

    #[test]
    fn admin_role_claims_from_env() {
        let config = load(&[
            ("SESSION_SECRET", SECRET),
            ("OIDC_ADMIN_ROLES", "tenant_admin, billing_admin"),
            ("PLATFORM_ADMIN_ROLE", "ops"),
        ])
        .unwrap();
        assert_eq!(config.auth.admin_roles, vec!["tenant_admin", "billing_admin"]);
        assert_eq!(config.auth.platform_admin_role, "ops");

        let err = load(&[("SESSION_SECRET", SECRET), ("OIDC_ADMIN_ROLES", " , ")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("OIDC_ADMIN_ROLES")));
    }

    #[test]
    fn worker_nodes_and_invalid_values() {
        let config = load(&[("SESSION_SECRET", SECRET), ("NODE_TYPE", "slave")]).unwrap();
        assert!(!config.is_master);

        let err = load(&[("SESSION_SECRET", SECRET), ("PORT", "http")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("PORT")));

        let err = load(&[("SESSION_SECRET", SECRET), ("REGISTRATION_MODE", "vip")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("REGISTRATION_MODE")));
    }

    #[test]
    fn gateways_are_configured_from_env() {
        let config = load(&[
            ("SESSION_SECRET", SECRET),
            ("STRIPE_SECRET_KEY", "sk_test"),
            ("STRIPE_WEBHOOK_SECRET", "whsec_test"),
            ("EPAY_ADDRESS", "https://pay.example.com"),
            ("EPAY_PID", "1001"),
            ("LOG_FORMAT", "json"),
        ])
        .unwrap();
        assert_eq!(config.stripe_webhook_secret(), "whsec_test");
        assert_eq!(config.creem_webhook_secret(), "");
        assert!(config.entitlement.epay.is_some());
        assert!(config.log_json);
    }
}
