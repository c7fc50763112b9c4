//! Stripe checkout sessions

use std::time::Duration;

use async_trait::async_trait;
use lurus_types::{PaymentMethod, Subscription};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, error, instrument};

use crate::config::StripeConfig;
use crate::error::EntitlementError;
use crate::provider::{Checkout, PaymentProvider};

/// Stripe payment provider
#[derive(Clone)]
pub struct StripeProvider {
    client: Client,
    config: StripeConfig,
    server_address: String,
}

impl StripeProvider {
    pub fn new(
        config: StripeConfig,
        server_address: &str,
        timeout: Duration,
    ) -> Result<Self, EntitlementError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EntitlementError::Internal(format!("Stripe client: {e}")))?;
        Ok(Self {
            client,
            config,
            server_address: server_address.to_string(),
        })
    }

    /// Make authenticated request to Stripe
    async fn stripe_request<T: for<'de> Deserialize<'de>>(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        form: &[(&str, String)],
    ) -> Result<T, EntitlementError> {
        let url = format!("{}{endpoint}", self.config.api_base);

        let response = self
            .client
            .request(method, &url)
            .basic_auth(&self.config.secret_key, Option::<&str>::None)
            .form(form)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Stripe API request failed");
                EntitlementError::Gateway(format!("Stripe unreachable: {e}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Stripe API error");
            return Err(EntitlementError::Gateway(format!("Stripe API error: {status}")));
        }

        response.json::<T>().await.map_err(|e| {
            error!(error = %e, "Failed to parse Stripe response");
            EntitlementError::Gateway(format!("Stripe response: {e}"))
        })
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Stripe
    }

    #[instrument(skip(self, sub, customer_email), fields(subscription_id = %sub.id))]
    async fn create_checkout(
        &self,
        sub: &Subscription,
        customer_email: &str,
    ) -> Result<Checkout, EntitlementError> {
        debug!(plan = %sub.plan_code, amount = sub.amount_cents, "Creating Stripe checkout session");

        let reference = format!(
            "sub_{}_{}_{}",
            sub.id,
            sub.user_id,
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        let mut form: Vec<(&str, String)> = vec![
            ("mode", "payment".into()),
            ("payment_method_types[0]", "card".into()),
            ("line_items[0][quantity]", "1".into()),
            ("line_items[0][price_data][currency]", sub.currency.to_lowercase()),
            ("line_items[0][price_data][unit_amount]", sub.amount_cents.to_string()),
            (
                "line_items[0][price_data][product_data][name]",
                format!("{} Subscription", sub.plan_name),
            ),
            (
                "line_items[0][price_data][product_data][description]",
                format!("Subscription for {} days", sub.period().num_days()),
            ),
            (
                "success_url",
                format!(
                    "{}/subscription/success?session_id={{CHECKOUT_SESSION_ID}}",
                    self.server_address
                ),
            ),
            ("cancel_url", format!("{}/subscription/cancel", self.server_address)),
            ("client_reference_id", reference),
            ("metadata[subscription_id]", sub.id.to_string()),
            ("metadata[user_id]", sub.user_id.to_string()),
            ("metadata[plan_code]", sub.plan_code.clone()),
            ("metadata[type]", "subscription".into()),
        ];
        if !customer_email.is_empty() {
            form.push(("customer_email", customer_email.to_string()));
        }

        let session: StripeCheckoutSession = self
            .stripe_request(reqwest::Method::POST, "/checkout/sessions", &form)
            .await?;

        let payment_url = session
            .url
            .ok_or_else(|| EntitlementError::Gateway("Stripe session has no URL".into()))?;
        Ok(Checkout {
            payment_url,
            payment_id: session.id,
        })
    }
}

/// Stripe checkout session
#[derive(Debug, Clone, Deserialize)]
pub struct StripeCheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use lurus_types::{SubscriptionId, SubscriptionStatus, TenantId, UserId};
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pending() -> Subscription {
        let now = Utc::now();
        Subscription {
            id: SubscriptionId(42),
            tenant_id: TenantId::default_tenant(),
            user_id: UserId(7),
            plan_code: "monthly".into(),
            plan_name: "Monthly".into(),
            status: SubscriptionStatus::Pending,
            daily_quota: 1_000_000,
            total_quota: 50_000_000,
            base_group: "monthly".into(),
            fallback_group: "weekly".into(),
            started_at: now,
            expires_at: now + ChronoDuration::days(30),
            payment_method: "stripe".into(),
            payment_id: None,
            amount_cents: 5990,
            currency: "CNY".into(),
            auto_renew: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn creates_checkout_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkout/sessions"))
            .and(header_exists("authorization"))
            .and(body_string_contains("metadata%5Bsubscription_id%5D=42"))
            .and(body_string_contains("unit_amount%5D=5990"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "cs_test_1",
                "url": "https://checkout.stripe.com/c/pay/cs_test_1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = StripeProvider::new(
            StripeConfig::new("sk_test", "whsec").with_api_base(server.uri()),
            "https://api.lurus.cn",
            Duration::from_secs(5),
        )
        .unwrap();

        let checkout = provider.create_checkout(&pending(), "a@b.co").await.unwrap();
        assert_eq!(checkout.payment_id, "cs_test_1");
        assert!(checkout.payment_url.contains("cs_test_1"));
    }

    #[tokio::test]
    async fn api_error_is_gateway_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(402).set_body_string("{\"error\":{}}"))
            .mount(&server)
            .await;

        let provider = StripeProvider::new(
            StripeConfig::new("sk_test", "whsec").with_api_base(server.uri()),
            "https://api.lurus.cn",
            Duration::from_secs(5),
        )
        .unwrap();

        let err = provider.create_checkout(&pending(), "").await.unwrap_err();
        assert!(matches!(err, EntitlementError::Gateway(_)));
        assert!(err.is_transient());
    }
}
