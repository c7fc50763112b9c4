//! Subscription handlers

use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use lurus_axum::{ApiJson, ApiResult, RequireUser};
use lurus_entitlement::{Checkout, CurrentSubscription, PaymentStatus};
use lurus_types::{ApiResponse, Subscription, SubscriptionPlan};
use serde::Deserialize;

use super::shared::{parse_subscription_id, record_op_duration};
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub plan_code: String,
    pub payment_method: String,
    #[serde(default)]
    pub auto_renew: bool,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/subscription/plans
pub async fn plans(State(state): State<AppState>) -> Json<ApiResponse<Vec<SubscriptionPlan>>> {
    Json(ApiResponse::success(state.subscriptions.plans().await))
}

/// GET /api/subscription/current
pub async fn current(
    State(state): State<AppState>,
    user: RequireUser,
) -> ApiResult<Json<ApiResponse<CurrentSubscription>>> {
    let current = state
        .subscriptions
        .current(&user.db, user.user_id, Utc::now())
        .await?;
    Ok(Json(ApiResponse::success(current)))
}

/// GET /api/subscription/history?limit=
pub async fn history(
    State(state): State<AppState>,
    user: RequireUser,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<ApiResponse<Vec<Subscription>>>> {
    let subs = state
        .subscriptions
        .history(&user.db, user.user_id, query.limit)
        .await?;
    Ok(Json(ApiResponse::success(subs)))
}

/// POST /api/subscription/create
pub async fn create(
    State(state): State<AppState>,
    user: RequireUser,
    ApiJson(req): ApiJson<CreateSubscriptionRequest>,
) -> ApiResult<Json<ApiResponse<Subscription>>> {
    let start = Instant::now();
    let result = state
        .subscriptions
        .create(
            &user.db,
            user.user_id,
            req.plan_code.trim(),
            req.payment_method.trim(),
            req.auto_renew,
            Utc::now(),
        )
        .await;
    record_op_duration("create_subscription", start, result.is_ok());

    let sub = result?;
    metrics::counter!("iam_subscriptions_created_total", "method" => sub.payment_method.clone())
        .increment(1);
    Ok(Json(
        ApiResponse::success(sub).with_message("Subscription created, proceed to payment"),
    ))
}

/// POST /api/subscription/{id}/pay
pub async fn pay(
    State(state): State<AppState>,
    user: RequireUser,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<Checkout>>> {
    let id = parse_subscription_id(&id)?;
    let start = Instant::now();
    let result = state
        .subscriptions
        .initiate_payment(&user.db, user.user_id, id, Utc::now())
        .await;
    record_op_duration("initiate_payment", start, result.is_ok());
    Ok(Json(ApiResponse::success(result?)))
}

/// POST /api/subscription/{id}/retry
///
/// Only orders younger than a day can be retried; older ones are expired.
pub async fn retry(
    State(state): State<AppState>,
    user: RequireUser,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<Checkout>>> {
    let id = parse_subscription_id(&id)?;
    let checkout = state
        .subscriptions
        .retry_payment(&user.db, user.user_id, id, Utc::now())
        .await?;
    Ok(Json(ApiResponse::success(checkout)))
}

/// POST /api/subscription/{id}/cancel
pub async fn cancel(
    State(state): State<AppState>,
    user: RequireUser,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<Subscription>>> {
    let id = parse_subscription_id(&id)?;
    let sub = state
        .subscriptions
        .cancel(&user.db, user.user_id, id, Utc::now())
        .await?;
    Ok(Json(
        ApiResponse::success(sub).with_message("Subscription cancelled"),
    ))
}

/// GET /api/subscription/{id}/payment-status
pub async fn payment_status(
    State(state): State<AppState>,
    user: RequireUser,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<PaymentStatus>>> {
    let id = parse_subscription_id(&id)?;
    let status = state
        .subscriptions
        .payment_status(&user.db, id, user.user_id, user.role)
        .await?;
    Ok(Json(ApiResponse::success(status)))
}
