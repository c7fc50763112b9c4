//! Payment gateway notifications
//!
//! No session or key applies here: Stripe and Creem are authenticated by
//! their body signature, Epay only by the order it names.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use lurus_axum::{ApiError, ApiResult};
use lurus_entitlement::{
    EpayNotify, PaymentEvent, WebhookError, WebhookOutcome, CREEM_SIGNATURE_HEADER,
    STRIPE_SIGNATURE_HEADER,
};
use lurus_types::PaymentMethod;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct Received {
    pub received: bool,
}

fn signature(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn rejected(gateway: PaymentMethod, err: WebhookError) -> ApiError {
    metrics::counter!(
        "iam_webhook_events_total",
        "gateway" => gateway.as_str(),
        "outcome" => "rejected"
    )
    .increment(1);
    tracing::warn!(gateway = %gateway, error = %err, "Webhook rejected");
    err.into()
}

async fn apply(
    state: &AppState,
    gateway: PaymentMethod,
    event: PaymentEvent,
) -> ApiResult<WebhookOutcome> {
    let outcome = state
        .subscriptions
        .handle_event(gateway, event, Utc::now())
        .await?;
    if let WebhookOutcome::Duplicate(id) = &outcome {
        tracing::info!(gateway = %gateway, subscription_id = %id, "Duplicate payment notification");
    }
    Ok(outcome)
}

/// POST /api/webhook/stripe
pub async fn stripe(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Received>> {
    let sig = signature(&headers, STRIPE_SIGNATURE_HEADER);
    let event = state
        .stripe
        .verify_and_parse(&body, sig.as_deref(), Utc::now())
        .map_err(|e| rejected(PaymentMethod::Stripe, e))?;
    apply(&state, PaymentMethod::Stripe, event).await?;
    Ok(Json(Received { received: true }))
}

/// POST /api/webhook/creem
pub async fn creem(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Received>> {
    let sig = signature(&headers, CREEM_SIGNATURE_HEADER);
    let event = state
        .creem
        .verify_and_parse(&body, sig.as_deref())
        .map_err(|e| rejected(PaymentMethod::Creem, e))?;
    apply(&state, PaymentMethod::Creem, event).await?;
    Ok(Json(Received { received: true }))
}

/// GET|POST /api/subscription/epay/notify
///
/// Epay expects a bare `success`; anything else makes it redeliver.
pub async fn epay(State(state): State<AppState>, Query(notify): Query<EpayNotify>) -> &'static str {
    let trade_no = notify.trade_no.clone();
    match apply(&state, PaymentMethod::Epay, notify.into_event()).await {
        Ok(_) => "success",
        Err(err) => {
            tracing::error!(trade_no = %trade_no, error = %err, "Epay notification failed");
            "fail"
        }
    }
}
