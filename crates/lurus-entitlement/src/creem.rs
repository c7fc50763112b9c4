//! Creem hosted checkouts

use std::time::Duration;

use async_trait::async_trait;
use lurus_types::{PaymentMethod, Subscription};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

use crate::config::CreemConfig;
use crate::error::EntitlementError;
use crate::provider::{Checkout, PaymentProvider};

#[derive(Debug, Serialize)]
struct CheckoutMetadata<'a> {
    subscription_id: String,
    user_id: String,
    plan_code: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct CreateCheckout<'a> {
    success_url: String,
    request_id: &'a str,
    metadata: CheckoutMetadata<'a>,
    amount: i64,
    currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    customer_email: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CheckoutResponse {
    id: String,
    checkout_url: Option<String>,
}

/// Creem payment provider
#[derive(Clone)]
pub struct CreemProvider {
    client: Client,
    config: CreemConfig,
    server_address: String,
}

impl CreemProvider {
    pub fn new(
        config: CreemConfig,
        server_address: &str,
        timeout: Duration,
    ) -> Result<Self, EntitlementError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EntitlementError::Internal(format!("Creem client: {e}")))?;
        Ok(Self {
            client,
            config,
            server_address: server_address.to_string(),
        })
    }
}

#[async_trait]
impl PaymentProvider for CreemProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Creem
    }

    #[instrument(skip(self, sub, customer_email), fields(subscription_id = %sub.id))]
    async fn create_checkout(
        &self,
        sub: &Subscription,
        customer_email: &str,
    ) -> Result<Checkout, EntitlementError> {
        let request_id = format!(
            "sub_{}_{}_{}",
            sub.id,
            sub.user_id,
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        debug!(request_id = %request_id, "Creating Creem checkout");

        let body = CreateCheckout {
            success_url: format!(
                "{}/subscription/success?provider=creem&ref={request_id}",
                self.server_address
            ),
            request_id: &request_id,
            metadata: CheckoutMetadata {
                subscription_id: sub.id.to_string(),
                user_id: sub.user_id.to_string(),
                plan_code: &sub.plan_code,
                kind: "subscription",
            },
            amount: sub.amount_cents,
            currency: sub.currency.to_lowercase(),
            customer_email: Some(customer_email).filter(|e| !e.is_empty()),
        };

        let response = self
            .client
            .post(format!("{}/checkouts", self.config.api_base))
            .header("x-api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Creem API request failed");
                EntitlementError::Gateway(format!("Creem unreachable: {e}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            error!(status = %status, body = %text, "Creem API error");
            return Err(EntitlementError::Gateway(format!("Creem API error: {status}")));
        }

        let checkout: CheckoutResponse = response
            .json()
            .await
            .map_err(|e| EntitlementError::Gateway(format!("Creem response: {e}")))?;
        let payment_url = checkout
            .checkout_url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| EntitlementError::Gateway("Creem checkout has no URL".into()))?;

        Ok(Checkout {
            payment_url,
            payment_id: checkout.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use lurus_types::{SubscriptionId, SubscriptionStatus, TenantId, UserId};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pending() -> Subscription {
        let now = Utc::now();
        Subscription {
            id: SubscriptionId(5),
            tenant_id: TenantId::default_tenant(),
            user_id: UserId(3),
            plan_code: "weekly".into(),
            plan_name: "Weekly".into(),
            status: SubscriptionStatus::Pending,
            daily_quota: 500_000,
            total_quota: 5_000_000,
            base_group: "weekly".into(),
            fallback_group: "free".into(),
            started_at: now,
            expires_at: now + ChronoDuration::days(7),
            payment_method: "creem".into(),
            payment_id: None,
            amount_cents: 1990,
            currency: "CNY".into(),
            auto_renew: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn posts_checkout_with_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkouts"))
            .and(header("x-api-key", "creem_key"))
            .and(body_partial_json(serde_json::json!({
                "amount": 1990,
                "currency": "cny",
                "metadata": {"subscription_id": "5", "type": "subscription"}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "id": "ch_123",
                "checkout_url": "https://creem.io/checkout/ch_123"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = CreemProvider::new(
            CreemConfig::new("creem_key", "").with_api_base(server.uri()),
            "https://api.lurus.cn",
            Duration::from_secs(5),
        )
        .unwrap();
        let checkout = provider.create_checkout(&pending(), "").await.unwrap();
        assert_eq!(checkout.payment_id, "ch_123");
    }

    #[tokio::test]
    async fn missing_url_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "ch_1"})))
            .mount(&server)
            .await;

        let provider = CreemProvider::new(
            CreemConfig::new("k", "").with_api_base(server.uri()),
            "https://api.lurus.cn",
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(provider.create_checkout(&pending(), "").await.is_err());
    }
}
