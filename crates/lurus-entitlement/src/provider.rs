//! Payment gateway abstraction

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lurus_types::{PaymentMethod, Subscription};
use serde::Serialize;

use crate::config::EntitlementConfig;
use crate::creem::CreemProvider;
use crate::epay::EpayProvider;
use crate::stripe::StripeProvider;
use crate::EntitlementError;

/// A hosted checkout the customer is redirected to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkout {
    pub payment_url: String,
    /// Gateway reference stored on the pending order
    pub payment_id: String,
}

/// Creates checkouts for pending subscription orders
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn method(&self) -> PaymentMethod;

    async fn create_checkout(
        &self,
        sub: &Subscription,
        customer_email: &str,
    ) -> Result<Checkout, EntitlementError>;
}

/// Money amount in major units with two decimals: `5990` -> `"59.90"`
pub(crate) fn format_amount(cents: i64) -> String {
    format!("{}.{:02}", cents / 100, (cents % 100).abs())
}

/// Configured gateways by payment method
#[derive(Clone, Default)]
pub struct PaymentProviders {
    providers: HashMap<PaymentMethod, Arc<dyn PaymentProvider>>,
}

impl PaymentProviders {
    /// Build every gateway that has credentials in `config`
    pub fn from_config(config: &EntitlementConfig) -> Result<Self, EntitlementError> {
        let mut providers = Self::default();
        if let Some(stripe) = &config.stripe {
            if !stripe.secret_key.is_empty() {
                providers.register(Arc::new(StripeProvider::new(
                    stripe.clone(),
                    &config.server_address,
                    config.gateway_timeout,
                )?));
            }
        }
        if let Some(creem) = &config.creem {
            if !creem.api_key.is_empty() {
                providers.register(Arc::new(CreemProvider::new(
                    creem.clone(),
                    &config.server_address,
                    config.gateway_timeout,
                )?));
            }
        }
        if let Some(epay) = &config.epay {
            if !epay.pay_address.is_empty() && !epay.pid.is_empty() {
                providers.register(Arc::new(EpayProvider::new(epay.clone(), &config.server_address)));
            }
        }
        Ok(providers)
    }

    pub fn register(&mut self, provider: Arc<dyn PaymentProvider>) {
        self.providers.insert(provider.method(), provider);
    }

    pub fn get(&self, method: PaymentMethod) -> Result<&Arc<dyn PaymentProvider>, EntitlementError> {
        self.providers
            .get(&method)
            .ok_or(EntitlementError::GatewayDisabled(method.as_str()))
    }

    pub fn is_enabled(&self, method: PaymentMethod) -> bool {
        self.providers.contains_key(&method)
    }
}
