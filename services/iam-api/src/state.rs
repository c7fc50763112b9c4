//! Application state for the IAM API service.

use std::sync::Arc;

use lurus_auth_core::{
    AuthError, HttpSmsSender, LogSmsSender, PrincipalResolver, SmsConfig, SmsSender,
};
use lurus_db::Store;
use lurus_entitlement::{
    CreemWebhook, DailyQuotaEngine, EntitlementError, Ledger, PaymentProviders, PlanCatalog,
    StripeWebhook, SubscriptionService,
};

use crate::config::Config;

/// Failure assembling the state at startup
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Entitlement(#[from] EntitlementError),
}

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    /// Credential resolution, login flows, tenant binding and API keys
    pub resolver: Arc<PrincipalResolver>,
    pub ledger: Ledger,
    pub subscriptions: SubscriptionService,
    pub quota: DailyQuotaEngine,
    pub stripe: StripeWebhook,
    pub creem: CreemWebhook,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wire the services over `store`.
    ///
    /// `sms` enables the phone plane; pass `None` to leave it off.
    pub fn new(
        store: Store,
        config: Config,
        sms: Option<Arc<dyn SmsSender>>,
    ) -> Result<Self, StateError> {
        let mut resolver = PrincipalResolver::new(store.clone(), config.auth.clone())?;
        if let Some(sender) = sms {
            resolver = resolver.with_sms(sender);
        }

        let entitlement = Arc::new(config.entitlement.clone());
        let plans = Arc::new(PlanCatalog::new(store.options.clone()));
        let providers = PaymentProviders::from_config(&entitlement)?;
        let subscriptions =
            SubscriptionService::new(store.clone(), plans, providers, entitlement.clone());

        Ok(Self {
            resolver: Arc::new(resolver),
            ledger: Ledger::new(entitlement.clone()),
            subscriptions,
            quota: DailyQuotaEngine::new(entitlement.daily_quota_enabled),
            stripe: StripeWebhook::new(config.stripe_webhook_secret()),
            creem: CreemWebhook::new(config.creem_webhook_secret()),
            store,
            config: Arc::new(config),
        })
    }

    /// Get request timeout from config
    pub fn request_timeout(&self) -> std::time::Duration {
        self.config.request_timeout
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// SMS sender for `config`.
///
/// Without a gateway URL codes are only logged, which suits development
/// setups.
pub fn sms_sender(config: &SmsConfig) -> Result<Arc<dyn SmsSender>, AuthError> {
    if config.gateway_url.is_empty() {
        tracing::warn!("SMS_GATEWAY_URL not set, verification codes will only be logged");
        return Ok(Arc::new(LogSmsSender));
    }
    Ok(Arc::new(HttpSmsSender::new(config.clone())?))
}
