//! Entitlement configuration

use std::path::PathBuf;
use std::time::Duration;

use lurus_types::QUOTA_PER_UNIT;

use crate::retry::RetryPolicy;

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";
const CREEM_API_BASE: &str = "https://api.creem.io/v1";
const CREEM_TEST_API_BASE: &str = "https://test-api.creem.io/v1";

/// Stripe checkout and webhook settings
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub api_base: String,
}

impl StripeConfig {
    pub fn new(secret_key: impl Into<String>, webhook_secret: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            webhook_secret: webhook_secret.into(),
            api_base: STRIPE_API_BASE.to_string(),
        }
    }

    /// Point API calls elsewhere (tests)
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

/// Creem checkout and webhook settings
#[derive(Debug, Clone)]
pub struct CreemConfig {
    pub api_key: String,
    /// Empty disables signature checks
    pub webhook_secret: String,
    pub api_base: String,
}

impl CreemConfig {
    pub fn new(api_key: impl Into<String>, webhook_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            webhook_secret: webhook_secret.into(),
            api_base: CREEM_API_BASE.to_string(),
        }
    }

    /// Use the Creem sandbox
    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.api_base = if test_mode { CREEM_TEST_API_BASE } else { CREEM_API_BASE }.to_string();
        self
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

/// Epay redirect settings
#[derive(Debug, Clone)]
pub struct EpayConfig {
    /// Gateway submit URL
    pub pay_address: String,
    /// Merchant id
    pub pid: String,
}

impl EpayConfig {
    pub fn new(pay_address: impl Into<String>, pid: impl Into<String>) -> Self {
        Self {
            pay_address: pay_address.into(),
            pid: pid.into(),
        }
    }
}

/// Periods and batch sizes of the background loops
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub expiry_interval: Duration,
    pub stale_pending_interval: Duration,
    pub stale_pending_delay: Duration,
    pub renewal_interval: Duration,
    pub renewal_delay: Duration,
    pub daily_reset_interval: Duration,
    pub batch_size: i64,
    /// Window of the auto-renewal scan
    pub renewal_window: chrono::Duration,
    /// Window of the expiry warning scan
    pub warning_window: chrono::Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            expiry_interval: Duration::from_secs(5 * 60),
            stale_pending_interval: Duration::from_secs(60 * 60),
            stale_pending_delay: Duration::from_secs(30),
            renewal_interval: Duration::from_secs(60 * 60),
            renewal_delay: Duration::from_secs(60),
            daily_reset_interval: Duration::from_secs(60),
            batch_size: 100,
            renewal_window: chrono::Duration::hours(24),
            warning_window: chrono::Duration::hours(72),
        }
    }
}

/// CPU watchdog settings
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub interval: Duration,
    /// Global CPU usage percentage that triggers a capture
    pub threshold_percent: f32,
    /// Length of the sampling window of one capture
    pub capture_window: Duration,
    pub profile_dir: PathBuf,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            threshold_percent: 80.0,
            capture_window: Duration::from_secs(10),
            profile_dir: PathBuf::from("./profiles"),
        }
    }
}

/// Entitlement service configuration
#[derive(Debug, Clone)]
pub struct EntitlementConfig {
    /// Tokens per RMB
    pub quota_per_unit: i64,
    pub daily_quota_enabled: bool,
    /// Public base URL used for gateway callbacks and return pages
    pub server_address: String,
    pub stripe: Option<StripeConfig>,
    pub creem: Option<CreemConfig>,
    pub epay: Option<EpayConfig>,
    pub retry: RetryPolicy,
    pub jobs: JobSettings,
    pub watchdog: Option<WatchdogConfig>,
    /// Timeout of checkout session creation
    pub gateway_timeout: Duration,
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self::new("http://localhost:3000")
    }
}

impl EntitlementConfig {
    pub fn new(server_address: impl Into<String>) -> Self {
        Self {
            quota_per_unit: QUOTA_PER_UNIT,
            daily_quota_enabled: true,
            server_address: server_address.into().trim_end_matches('/').to_string(),
            stripe: None,
            creem: None,
            epay: None,
            retry: RetryPolicy::default(),
            jobs: JobSettings::default(),
            watchdog: None,
            gateway_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_quota_per_unit(mut self, quota_per_unit: i64) -> Self {
        if quota_per_unit > 0 {
            self.quota_per_unit = quota_per_unit;
        }
        self
    }

    pub fn with_daily_quota(mut self, enabled: bool) -> Self {
        self.daily_quota_enabled = enabled;
        self
    }

    pub fn with_stripe(mut self, stripe: StripeConfig) -> Self {
        self.stripe = Some(stripe);
        self
    }

    pub fn with_creem(mut self, creem: CreemConfig) -> Self {
        self.creem = Some(creem);
        self
    }

    pub fn with_epay(mut self, epay: EpayConfig) -> Self {
        self.epay = Some(epay);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_jobs(mut self, jobs: JobSettings) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_watchdog(mut self, watchdog: WatchdogConfig) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    /// Convert an RMB amount to tokens
    pub fn rmb_to_quota(&self, rmb: f64) -> i64 {
        (rmb * self.quota_per_unit as f64).round() as i64
    }

    /// Convert tokens to RMB
    pub fn quota_to_rmb(&self, quota: i64) -> f64 {
        quota as f64 / self.quota_per_unit as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rmb_conversion_uses_quota_per_unit() {
        let config = EntitlementConfig::default();
        assert_eq!(config.rmb_to_quota(1.0), 500_000);
        assert_eq!(config.rmb_to_quota(0.5), 250_000);
        assert_eq!(config.quota_to_rmb(1_250_000), 2.5);

        let custom = EntitlementConfig::default().with_quota_per_unit(1000);
        assert_eq!(custom.rmb_to_quota(19.9), 19_900);
    }

    #[test]
    fn non_positive_rate_is_ignored() {
        let config = EntitlementConfig::default().with_quota_per_unit(0);
        assert_eq!(config.quota_per_unit, QUOTA_PER_UNIT);
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        assert_eq!(
            EntitlementConfig::new("https://api.lurus.cn/").server_address,
            "https://api.lurus.cn"
        );
    }

    #[test]
    fn creem_test_mode_switches_host() {
        let creem = CreemConfig::new("key", "").with_test_mode(true);
        assert!(creem.api_base.starts_with("https://test-api.creem.io"));
    }
}
