//! Epay redirect checkouts
//!
//! Epay has no session API; the checkout is a redirect URL and
//! the generated trade number is the payment reference.

use async_trait::async_trait;
use lurus_types::{PaymentMethod, Subscription};
use reqwest::Url;

use crate::config::EpayConfig;
use crate::error::EntitlementError;
use crate::provider::{format_amount, Checkout, PaymentProvider};

/// Epay payment provider
#[derive(Clone)]
pub struct EpayProvider {
    config: EpayConfig,
    server_address: String,
}

impl EpayProvider {
    pub fn new(config: EpayConfig, server_address: &str) -> Self {
        Self {
            config,
            server_address: server_address.to_string(),
        }
    }

    /// `SUB{user}NO{subscription}{unix}`
    pub fn trade_no(sub: &Subscription, now: chrono::DateTime<chrono::Utc>) -> String {
        format!("SUB{}NO{}{}", sub.user_id, sub.id, now.timestamp())
    }
}

#[async_trait]
impl PaymentProvider for EpayProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Epay
    }

    async fn create_checkout(
        &self,
        sub: &Subscription,
        _customer_email: &str,
    ) -> Result<Checkout, EntitlementError> {
        let trade_no = Self::trade_no(sub, chrono::Utc::now());
        let notify_url = format!("{}/api/subscription/epay/notify", self.server_address);
        let return_url = format!(
            "{}/subscription/success?provider=epay&trade_no={trade_no}",
            self.server_address
        );

        let url = Url::parse_with_params(
            &self.config.pay_address,
            &[
                ("pid", self.config.pid.as_str()),
                ("type", "alipay"),
                ("out_trade_no", trade_no.as_str()),
                ("notify_url", notify_url.as_str()),
                ("return_url", return_url.as_str()),
                ("name", sub.plan_name.as_str()),
                ("money", format_amount(sub.amount_cents).as_str()),
            ],
        )
        .map_err(|e| EntitlementError::Internal(format!("invalid Epay address: {e}")))?;

        Ok(Checkout {
            payment_url: url.into(),
            payment_id: trade_no,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use lurus_types::{SubscriptionId, SubscriptionStatus, TenantId, UserId};

    fn pending() -> Subscription {
        let now = Utc::now();
        Subscription {
            id: SubscriptionId(12),
            tenant_id: TenantId::default_tenant(),
            user_id: UserId(34),
            plan_code: "monthly".into(),
            plan_name: "Monthly Plan".into(),
            status: SubscriptionStatus::Pending,
            daily_quota: 0,
            total_quota: 0,
            base_group: String::new(),
            fallback_group: String::new(),
            started_at: now,
            expires_at: now + Duration::days(30),
            payment_method: "epay".into(),
            payment_id: None,
            amount_cents: 5990,
            currency: "CNY".into(),
            auto_renew: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn trade_number_layout() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(EpayProvider::trade_no(&pending(), at), "SUB34NO121735689600");
    }

    #[tokio::test]
    async fn builds_redirect_url() {
        let provider = EpayProvider::new(
            EpayConfig::new("https://pay.example.com/submit.php", "1001"),
            "https://api.lurus.cn",
        );
        let checkout = provider.create_checkout(&pending(), "").await.unwrap();

        let url = Url::parse(&checkout.payment_url).unwrap();
        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["pid"], "1001");
        assert_eq!(params["money"], "59.90");
        assert_eq!(params["name"], "Monthly Plan");
        assert_eq!(params["out_trade_no"], checkout.payment_id);
        assert_eq!(params["notify_url"], "https://api.lurus.cn/api/subscription/epay/notify");
        assert!(checkout.payment_id.starts_with("SUB34NO12"));
    }
}
