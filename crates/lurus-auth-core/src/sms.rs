//! SMS delivery of verification codes

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::crypto::hmac_sha256_hex;
use crate::verification::CodePurpose;
use crate::AuthError;

/// Delivers a verification code to a phone
#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send_code(&self, phone: &str, purpose: CodePurpose, code: &str) -> Result<(), AuthError>;
}

/// SMS gateway settings
#[derive(Debug, Clone, Default)]
pub struct SmsConfig {
    pub gateway_url: String,
    pub access_key_id: String,
    pub access_key_secret: String,
    pub sign_name: String,
    pub template_login: String,
    pub template_register: String,
    pub template_reset: String,
    pub template_bind: String,
}

impl SmsConfig {
    /// Template code for `purpose`; `None` when not configured
    pub fn template(&self, purpose: CodePurpose) -> Option<&str> {
        let code = match purpose {
            CodePurpose::Login => &self.template_login,
            CodePurpose::Register => &self.template_register,
            CodePurpose::Reset => &self.template_reset,
            CodePurpose::Bind => &self.template_bind,
            CodePurpose::EmailVerify | CodePurpose::PasswordReset => return None,
        };
        Some(code.as_str()).filter(|c| !c.is_empty())
    }
}

/// `13800138000` -> `138****8000`
pub fn mask_phone(phone: &str) -> String {
    if phone.len() != 11 || !phone.is_ascii() {
        return "***".to_string();
    }
    format!("{}****{}", &phone[..3], &phone[7..])
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SendSmsRequest<'a> {
    phone_numbers: &'a str,
    sign_name: &'a str,
    template_code: &'a str,
    template_param: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendSmsResponse {
    code: Option<String>,
    #[serde(default)]
    message: String,
}

/// Sender posting to an HTTP SMS gateway.
///
/// The request body is signed with HMAC-SHA256 over the access key secret.
pub struct HttpSmsSender {
    config: SmsConfig,
    client: reqwest::Client,
}

impl HttpSmsSender {
    pub fn new(config: SmsConfig) -> Result<Self, AuthError> {
        if config.access_key_id.is_empty() || config.access_key_secret.is_empty() {
            return Err(AuthError::Configuration(
                "SMS access key id or secret is not configured".into(),
            ));
        }
        if config.gateway_url.is_empty() {
            return Err(AuthError::Configuration("SMS gateway URL is not configured".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AuthError::Configuration(format!("SMS client: {e}")))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl SmsSender for HttpSmsSender {
    async fn send_code(&self, phone: &str, purpose: CodePurpose, code: &str) -> Result<(), AuthError> {
        let template = self.config.template(purpose).ok_or_else(|| {
            AuthError::Configuration(format!("SMS template not configured for {}", purpose.as_str()))
        })?;

        let body = serde_json::to_vec(&SendSmsRequest {
            phone_numbers: phone,
            sign_name: &self.config.sign_name,
            template_code: template,
            template_param: serde_json::json!({ "code": code }).to_string(),
        })
        .map_err(|e| AuthError::Internal(e.to_string()))?;

        let signature = hmac_sha256_hex(self.config.access_key_secret.as_bytes(), &body)
            .ok_or_else(|| AuthError::Configuration("invalid SMS secret".into()))?;

        let response = self
            .client
            .post(&self.config.gateway_url)
            .header("content-type", "application/json")
            .header("x-access-key-id", &self.config.access_key_id)
            .header("x-signature", signature)
            .body(body)
            .send()
            .await
            .map_err(|e| AuthError::Upstream(format!("SMS gateway unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(AuthError::Upstream(format!(
                "SMS gateway returned {}",
                response.status()
            )));
        }

        let reply: SendSmsResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Upstream(format!("SMS gateway reply: {e}")))?;
        if reply.code.as_deref() != Some("OK") {
            return Err(AuthError::Upstream(format!("SMS send failed: {}", reply.message)));
        }

        tracing::info!(phone = %mask_phone(phone), purpose = purpose.as_str(), "SMS sent");
        Ok(())
    }
}

/// Sender that only logs; for development setups without a gateway
#[derive(Debug, Default, Clone)]
pub struct LogSmsSender;

#[async_trait]
impl SmsSender for LogSmsSender {
    async fn send_code(&self, phone: &str, purpose: CodePurpose, _code: &str) -> Result<(), AuthError> {
        tracing::info!(phone = %mask_phone(phone), purpose = purpose.as_str(), "SMS delivery skipped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: String) -> SmsConfig {
        SmsConfig {
            gateway_url: url,
            access_key_id: "ak".into(),
            access_key_secret: "secret".into(),
            sign_name: "Lurus".into(),
            template_login: "SMS_1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn masks_phone_numbers() {
        assert_eq!(mask_phone("13800138000"), "138****8000");
        assert_eq!(mask_phone("123"), "***");
    }

    #[test]
    fn missing_credentials_rejected() {
        assert!(HttpSmsSender::new(SmsConfig::default()).is_err());
    }

    #[tokio::test]
    async fn sends_through_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sms"))
            .and(header_exists("x-signature"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"Code": "OK"})))
            .expect(1)
            .mount(&server)
            .await;

        let sender = HttpSmsSender::new(config(format!("{}/sms", server.uri()))).unwrap();
        sender
            .send_code("13800138000", CodePurpose::Login, "123456")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn gateway_rejection_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"Code": "isv.BUSINESS_LIMIT_CONTROL", "Message": "throttled"}),
            ))
            .mount(&server)
            .await;

        let sender = HttpSmsSender::new(config(server.uri())).unwrap();
        let err = sender
            .send_code("13800138000", CodePurpose::Login, "123456")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Upstream(_)));
    }

    #[tokio::test]
    async fn unconfigured_template_is_rejected() {
        let sender = HttpSmsSender::new(config("http://127.0.0.1:9".into())).unwrap();
        let err = sender
            .send_code("13800138000", CodePurpose::Bind, "123456")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Configuration(_)));
    }
}
