//! Payment webhook verification and parsing
//!
//! Every gateway notification is reduced to a [`PaymentEvent`]; the
//! subscription service applies it. Signature checks happen here, before any
//! payload field is trusted.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use lurus_auth_core::constant_time_eq;
use lurus_types::{ErrorCode, PaymentMethod, SubscriptionId};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";
pub const CREEM_SIGNATURE_HEADER: &str = "creem-signature";

/// Accepted clock skew of a Stripe signature timestamp
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// `trade_status` of a settled Epay order
pub const EPAY_TRADE_SUCCESS: &str = "TRADE_SUCCESS";

/// Metadata `type` marking our own checkouts
const SUBSCRIPTION_METADATA_TYPE: &str = "subscription";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WebhookError {
    #[error("missing signature header")]
    MissingSignature,

    #[error("webhook signature verification failed")]
    InvalidSignature,

    #[error("webhook timestamp outside tolerance")]
    StaleTimestamp,

    #[error("malformed webhook payload: {0}")]
    Malformed(String),

    #[error("webhook secret is not configured")]
    NotConfigured,
}

impl WebhookError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MissingSignature | Self::InvalidSignature | Self::StaleTimestamp => {
                ErrorCode::InvalidSignature
            }
            Self::Malformed(_) => ErrorCode::ValidationFailed,
            Self::NotConfigured => ErrorCode::Internal,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.code().http_status()
    }
}

/// A confirmed payment for a known subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentNotice {
    pub subscription_id: SubscriptionId,
    pub payment_id: String,
    pub method: PaymentMethod,
    /// Amount the gateway reports, in cents; 0 when it reports none
    pub amount_cents: i64,
}

/// A gateway notification reduced to what the state machine needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEvent {
    Paid(PaymentNotice),
    /// Settled order identified only by its checkout reference
    PaidByReference {
        method: PaymentMethod,
        payment_id: String,
    },
    Refunded {
        method: PaymentMethod,
        payment_id: String,
    },
    /// The customer abandoned the checkout; the order stays pending so it
    /// can be retried
    CheckoutExpired {
        subscription_id: Option<SubscriptionId>,
    },
    Ignored {
        reason: String,
    },
}

impl PaymentEvent {
    fn ignored(reason: impl Into<String>) -> Self {
        Self::Ignored {
            reason: reason.into(),
        }
    }

    /// Label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Paid(_) | Self::PaidByReference { .. } => "paid",
            Self::Refunded { .. } => "refunded",
            Self::CheckoutExpired { .. } => "checkout_expired",
            Self::Ignored { .. } => "ignored",
        }
    }
}

fn hmac_hex(secret: &[u8], message: &[u8]) -> Result<String, WebhookError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|_| WebhookError::NotConfigured)?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Subscription id from checkout metadata, if the checkout is ours
fn subscription_from_metadata(metadata: &CheckoutMetadata) -> Result<Option<SubscriptionId>, WebhookError> {
    if metadata.kind.as_deref() != Some(SUBSCRIPTION_METADATA_TYPE) {
        return Ok(None);
    }
    let raw = metadata
        .subscription_id
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| WebhookError::Malformed("missing subscription_id in metadata".into()))?;
    SubscriptionId::parse(raw)
        .map(Some)
        .ok_or_else(|| WebhookError::Malformed(format!("invalid subscription_id: {raw}")))
}

// ============================================================================
// Stripe
// ============================================================================

/// Verifies `Stripe-Signature` headers and parses checkout and refund events
#[derive(Clone)]
pub struct StripeWebhook {
    secret: String,
}

impl StripeWebhook {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    #[instrument(skip_all)]
    pub fn verify_and_parse(
        &self,
        payload: &[u8],
        signature: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<PaymentEvent, WebhookError> {
        let signature = signature.ok_or(WebhookError::MissingSignature)?;
        self.verify_signature(payload, signature, now)?;

        let event: RawStripeEvent =
            serde_json::from_slice(payload).map_err(|e| WebhookError::Malformed(e.to_string()))?;
        debug!(event_id = %event.id, event_type = %event.event_type, "Stripe event verified");

        match event.event_type.as_str() {
            "checkout.session.completed" => {
                let session: RawCheckoutSession = serde_json::from_value(event.data.object)
                    .map_err(|e| WebhookError::Malformed(e.to_string()))?;
                let Some(subscription_id) = subscription_from_metadata(&session.metadata)? else {
                    return Ok(PaymentEvent::ignored("not a subscription checkout"));
                };
                // Refunds reference the payment intent, so record that when present
                let payment_id = session.payment_intent.unwrap_or(session.id);
                Ok(PaymentEvent::Paid(PaymentNotice {
                    subscription_id,
                    payment_id,
                    method: PaymentMethod::Stripe,
                    amount_cents: session.amount_total.unwrap_or(0),
                }))
            }
            "checkout.session.expired" => {
                let session: RawCheckoutSession = serde_json::from_value(event.data.object)
                    .map_err(|e| WebhookError::Malformed(e.to_string()))?;
                Ok(PaymentEvent::CheckoutExpired {
                    subscription_id: subscription_from_metadata(&session.metadata).ok().flatten(),
                })
            }
            "charge.refunded" => {
                let charge: RawCharge = serde_json::from_value(event.data.object)
                    .map_err(|e| WebhookError::Malformed(e.to_string()))?;
                match charge.payment_intent {
                    Some(payment_id) if !payment_id.is_empty() => Ok(PaymentEvent::Refunded {
                        method: PaymentMethod::Stripe,
                        payment_id,
                    }),
                    _ => Ok(PaymentEvent::ignored("refund without payment intent")),
                }
            }
            other => Ok(PaymentEvent::ignored(format!("unhandled event type {other}"))),
        }
    }

    /// Check a `t=<unix>,v1=<hex>` header against the raw payload
    fn verify_signature(
        &self,
        payload: &[u8],
        header: &str,
        now: DateTime<Utc>,
    ) -> Result<(), WebhookError> {
        if self.secret.is_empty() {
            return Err(WebhookError::NotConfigured);
        }

        let mut timestamp: Option<&str> = None;
        let mut candidates: Vec<&str> = Vec::new();
        for part in header.split(',') {
            if let Some((key, value)) = part.trim().split_once('=') {
                match key {
                    "t" => timestamp = Some(value),
                    "v1" => candidates.push(value),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            warn!("Missing timestamp in Stripe signature");
            WebhookError::InvalidSignature
        })?;
        if candidates.is_empty() {
            warn!("Missing v1 entry in Stripe signature");
            return Err(WebhookError::InvalidSignature);
        }

        let mut signed = Vec::with_capacity(timestamp.len() + 1 + payload.len());
        signed.extend_from_slice(timestamp.as_bytes());
        signed.push(b'.');
        signed.extend_from_slice(payload);
        let expected = hmac_hex(self.secret.as_bytes(), &signed)?;

        if !candidates
            .iter()
            .any(|sig| constant_time_eq(sig.as_bytes(), expected.as_bytes()))
        {
            warn!("Stripe signature mismatch");
            return Err(WebhookError::InvalidSignature);
        }

        let ts: i64 = timestamp.parse().map_err(|_| WebhookError::InvalidSignature)?;
        if (now.timestamp() - ts).abs() > SIGNATURE_TOLERANCE_SECS {
            warn!(timestamp = ts, now = now.timestamp(), "Stripe signature timestamp outside tolerance");
            return Err(WebhookError::StaleTimestamp);
        }

        Ok(())
    }

    /// Header value for `payload` signed at `timestamp`
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> Result<String, WebhookError> {
        let mut signed = timestamp.to_string().into_bytes();
        signed.push(b'.');
        signed.extend_from_slice(payload);
        Ok(format!("t={timestamp},v1={}", hmac_hex(self.secret.as_bytes(), &signed)?))
    }
}

// ============================================================================
// Creem
// ============================================================================

/// Verifies `creem-signature` (hex HMAC-SHA256 of the raw body) and parses
/// completed checkouts
#[derive(Clone)]
pub struct CreemWebhook {
    secret: String,
}

impl CreemWebhook {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    #[instrument(skip_all)]
    pub fn verify_and_parse(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<PaymentEvent, WebhookError> {
        if self.secret.is_empty() {
            warn!("Creem webhook secret not set, rejecting notification");
            return Err(WebhookError::NotConfigured);
        }
        let signature = signature.ok_or(WebhookError::MissingSignature)?;
        let expected = hmac_hex(self.secret.as_bytes(), payload)?;
        if !constant_time_eq(signature.trim().as_bytes(), expected.as_bytes()) {
            warn!("Creem signature mismatch");
            return Err(WebhookError::InvalidSignature);
        }

        let event: RawCreemEvent =
            serde_json::from_slice(payload).map_err(|e| WebhookError::Malformed(e.to_string()))?;
        debug!(event_type = %event.event_type, "Creem event verified");

        if event.event_type != "checkout.completed" {
            return Ok(PaymentEvent::ignored(format!(
                "unhandled event type {}",
                event.event_type
            )));
        }
        let object = event
            .object
            .ok_or_else(|| WebhookError::Malformed("missing object".into()))?;
        let Some(subscription_id) = subscription_from_metadata(&object.metadata)? else {
            return Ok(PaymentEvent::ignored("not a subscription checkout"));
        };

        Ok(PaymentEvent::Paid(PaymentNotice {
            subscription_id,
            payment_id: object.id,
            method: PaymentMethod::Creem,
            amount_cents: object.amount.unwrap_or(0.0).round() as i64,
        }))
    }

    pub fn sign(&self, payload: &[u8]) -> Result<String, WebhookError> {
        hmac_hex(self.secret.as_bytes(), payload)
    }
}

// ============================================================================
// Epay
// ============================================================================

/// Query parameters of an Epay notify callback
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EpayNotify {
    #[serde(default)]
    pub out_trade_no: String,
    #[serde(default)]
    pub trade_status: String,
    #[serde(default)]
    pub trade_no: String,
}

impl EpayNotify {
    /// Only settled orders carry meaning; the order is located by its
    /// checkout reference
    pub fn into_event(self) -> PaymentEvent {
        if self.trade_status != EPAY_TRADE_SUCCESS {
            return PaymentEvent::ignored(format!("trade status {}", self.trade_status));
        }
        if self.out_trade_no.is_empty() {
            return PaymentEvent::ignored("missing out_trade_no");
        }
        PaymentEvent::PaidByReference {
            method: PaymentMethod::Epay,
            payment_id: self.out_trade_no,
        }
    }
}

// ============================================================================
// Raw payloads
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawStripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct CheckoutMetadata {
    #[serde(rename = "type")]
    kind: Option<String>,
    subscription_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCheckoutSession {
    id: String,
    #[serde(default)]
    metadata: CheckoutMetadata,
    amount_total: Option<i64>,
    payment_intent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCharge {
    payment_intent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCreemEvent {
    #[serde(rename = "eventType")]
    event_type: String,
    object: Option<RawCreemCheckout>,
}

#[derive(Debug, Deserialize)]
struct RawCreemCheckout {
    id: String,
    #[serde(default)]
    metadata: CheckoutMetadata,
    amount: Option<f64>,
}
