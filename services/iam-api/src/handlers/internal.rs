//! Internal service API
//!
//! Reached with an `X-API-Key` only; each route additionally requires the
//! scope named in its doc line. Every lookup runs through the tenant-bound
//! handle of the request, so a user of another tenant is `USER_NOT_FOUND`.

use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Utc;
use lurus_auth_core::crypto::random_alphanumeric;
use lurus_auth_core::{hash_token, AuthError};
use lurus_axum::{ApiJson, ApiResult, RequireAuth};
use lurus_db::CreateRelayToken;
use lurus_entitlement::{Balance, CurrentSubscription, NewAccount, QuotaChange, QuotaCheck, QuotaInfo, TopUp};
use lurus_types::{
    ApiResponse, CreateRelayTokenRequest, PaginatedResponse, Pagination, PostConsume, RelayToken,
    Subscription, User, UserId, UserUpdate, RELAY_TOKEN_PREFIX, RELAY_TOKEN_RANDOM_LEN,
};
use serde::{Deserialize, Serialize};

use super::shared::{idempotency_key, parse_user_id, record_op_duration, required, UserView};
use crate::state::AppState;

/// Characters of a relay token kept for display
const RELAY_TOKEN_DISPLAY_LEN: usize = 7;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct InternalLoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct InternalLoginResponse {
    pub user_id: UserId,
    pub username: String,
    pub display_name: String,
    pub email: String,
    pub role: i32,
    pub status: i32,
}

#[derive(Debug, Serialize)]
pub struct CreatedUser {
    pub id: UserId,
    pub username: String,
    pub display_name: String,
    pub email: String,
    pub group: String,
    pub quota: i64,
    pub is_duplicate: bool,
}

#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub user_id: UserId,
    pub plan_code: String,
    pub days: i64,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct AdjustQuotaRequest {
    pub user_id: UserId,
    pub amount: i64,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct ConsumeRequest {
    pub user_id: UserId,
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
pub struct TopUpRequest {
    pub user_id: UserId,
    pub amount_rmb: f64,
    #[serde(default)]
    pub order_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct TokenListQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct TokenList {
    pub tokens: Vec<RelayToken>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Serialize)]
pub struct CreatedToken {
    pub id: i64,
    pub name: String,
    /// Raw key; present only on first creation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<&'static str>,
    pub is_duplicate: bool,
}

// ============================================================================
// Users
// ============================================================================

async fn find_user(auth: &RequireAuth, user_id: UserId) -> ApiResult<User> {
    Ok(auth
        .ctx
        .db
        .find_user(user_id)
        .await?
        .ok_or(AuthError::UserNotFound)?)
}

/// GET /internal/user/{id} (user:read)
pub async fn get_user(auth: RequireAuth, Path(id): Path<String>) -> ApiResult<Json<ApiResponse<UserView>>> {
    let user = find_user(&auth, parse_user_id(&id)?).await?;
    Ok(Json(ApiResponse::success(UserView::from(&user))))
}

/// GET /internal/user/by-email/{email} (user:read)
pub async fn get_user_by_email(
    auth: RequireAuth,
    Path(email): Path<String>,
) -> ApiResult<Json<ApiResponse<UserView>>> {
    let email = required(&email, "Email is required")?;
    let user = auth
        .ctx
        .db
        .find_user_by_email(email)
        .await?
        .ok_or(AuthError::UserNotFound)?;
    Ok(Json(ApiResponse::success(UserView::from(&user))))
}

/// GET /internal/user/by-phone/{phone} (user:read)
pub async fn get_user_by_phone(
    auth: RequireAuth,
    Path(phone): Path<String>,
) -> ApiResult<Json<ApiResponse<UserView>>> {
    let phone = required(&phone, "Phone is required")?;
    let user = auth
        .ctx
        .db
        .find_user_by_phone(phone)
        .await?
        .ok_or(AuthError::UserNotFound)?;
    Ok(Json(ApiResponse::success(UserView::from(&user))))
}

/// POST /internal/user (user:write)
///
/// With `X-Idempotency-Key`, replaying a create returns the existing
/// account flagged `is_duplicate`.
pub async fn create_user(
    State(state): State<AppState>,
    auth: RequireAuth,
    headers: HeaderMap,
    ApiJson(account): ApiJson<NewAccount>,
) -> ApiResult<(StatusCode, Json<ApiResponse<CreatedUser>>)> {
    let outcome = state
        .ledger
        .create_user(&auth.ctx.db, account, idempotency_key(&headers))
        .await?;
    let status = if outcome.is_duplicate {
        StatusCode::OK
    } else {
        tracing::info!(
            user_id = %outcome.user.id,
            key_name = ?auth.principal.key_name,
            "User created via internal API"
        );
        StatusCode::CREATED
    };
    let user = outcome.user;
    Ok((
        status,
        Json(ApiResponse::success(CreatedUser {
            id: user.id,
            username: user.username,
            display_name: user.display_name,
            email: user.email,
            group: user.group,
            quota: user.quota,
            is_duplicate: outcome.is_duplicate,
        })),
    ))
}

/// PUT /internal/user/{id} (user:write)
pub async fn update_user(
    State(state): State<AppState>,
    auth: RequireAuth,
    Path(id): Path<String>,
    ApiJson(update): ApiJson<UserUpdate>,
) -> ApiResult<Json<ApiResponse<UserView>>> {
    let user_id = parse_user_id(&id)?;
    let user = state.ledger.update_user(&auth.ctx.db, user_id, &update).await?;
    Ok(Json(
        ApiResponse::success(UserView::from(&user)).with_message("User updated successfully"),
    ))
}

/// DELETE /internal/user/{id} (user:delete)
///
/// Admin and root accounts cannot be deleted here.
pub async fn delete_user(
    State(state): State<AppState>,
    auth: RequireAuth,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<()>>> {
    let user_id = parse_user_id(&id)?;
    state.ledger.delete_user(&auth.ctx.db, user_id).await?;
    tracing::warn!(%user_id, key_name = ?auth.principal.key_name, "User deleted via internal API");
    Ok(Json(ApiResponse::ok("User deleted successfully")))
}

/// POST /internal/auth/login (auth:login)
///
/// Verifies a password for a trusted front end; no session is issued.
pub async fn login(
    State(state): State<AppState>,
    auth: RequireAuth,
    ApiJson(req): ApiJson<InternalLoginRequest>,
) -> ApiResult<Json<ApiResponse<InternalLoginResponse>>> {
    let username = required(&req.username, "Username is required")?;
    let outcome = state
        .resolver
        .password_login(&auth.ctx.tenant, username, &req.password, Utc::now())
        .await?;
    let user = outcome.user;
    Ok(Json(ApiResponse::success(InternalLoginResponse {
        user_id: user.id,
        username: user.username,
        display_name: user.display_name,
        email: user.email,
        role: user.role.code(),
        status: user.status.code(),
    })))
}

// ============================================================================
// Subscriptions
// ============================================================================

/// GET /internal/subscription/user/{id} (subscription:read)
pub async fn get_user_subscription(
    State(state): State<AppState>,
    auth: RequireAuth,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<CurrentSubscription>>> {
    let user_id = parse_user_id(&id)?;
    let current = state
        .subscriptions
        .current(&auth.ctx.db, user_id, Utc::now())
        .await?;
    Ok(Json(ApiResponse::success(current)))
}

/// POST /internal/subscription/grant (subscription:write)
pub async fn grant_subscription(
    State(state): State<AppState>,
    auth: RequireAuth,
    ApiJson(req): ApiJson<GrantRequest>,
) -> ApiResult<Json<ApiResponse<Subscription>>> {
    let reason = if req.reason.trim().is_empty() {
        "internal grant"
    } else {
        req.reason.trim()
    };
    let sub = state
        .subscriptions
        .grant(&auth.ctx.db, req.user_id, req.plan_code.trim(), req.days, reason, Utc::now())
        .await?;
    tracing::info!(
        subscription_id = %sub.id,
        user_id = %req.user_id,
        key_name = ?auth.principal.key_name,
        "Subscription granted via internal API"
    );
    Ok(Json(
        ApiResponse::success(sub).with_message("Subscription granted successfully"),
    ))
}

// ============================================================================
// Quota
// ============================================================================

/// GET /internal/quota/user/{id} (quota:read)
pub async fn get_user_quota(
    State(state): State<AppState>,
    auth: RequireAuth,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<QuotaInfo>>> {
    let info = state
        .ledger
        .quota_info(&auth.ctx.db, parse_user_id(&id)?)
        .await?;
    Ok(Json(ApiResponse::success(info)))
}

/// POST /internal/quota/adjust (quota:write)
///
/// The balance never goes below zero.
pub async fn adjust_quota(
    State(state): State<AppState>,
    auth: RequireAuth,
    ApiJson(req): ApiJson<AdjustQuotaRequest>,
) -> ApiResult<Json<ApiResponse<QuotaChange>>> {
    let reason = required(&req.reason, "Reason is required")?;
    let change = state
        .ledger
        .adjust_quota(&auth.ctx.db, req.user_id, req.amount, reason, false)
        .await?;
    tracing::info!(
        user_id = %req.user_id,
        adjustment = req.amount,
        new_quota = change.new_quota,
        key_name = ?auth.principal.key_name,
        reason,
        "Quota adjusted via internal API"
    );
    Ok(Json(
        ApiResponse::success(change).with_message("Quota adjusted successfully"),
    ))
}

/// POST /internal/quota/pre-consume (quota:write)
///
/// Checks `amount` against today's cap; a limited user moves to their
/// fallback group.
pub async fn pre_consume(
    State(state): State<AppState>,
    auth: RequireAuth,
    ApiJson(req): ApiJson<ConsumeRequest>,
) -> ApiResult<Json<ApiResponse<QuotaCheck>>> {
    let start = Instant::now();
    let result = state
        .quota
        .pre_consume(&auth.ctx.db, req.user_id, req.amount, Utc::now())
        .await;
    record_op_duration("pre_consume", start, result.is_ok());
    Ok(Json(ApiResponse::success(result?)))
}

/// POST /internal/quota/post-consume (quota:write)
pub async fn post_consume(
    State(state): State<AppState>,
    auth: RequireAuth,
    ApiJson(req): ApiJson<ConsumeRequest>,
) -> ApiResult<Json<ApiResponse<PostConsume>>> {
    let start = Instant::now();
    let result = state
        .quota
        .post_consume(&auth.ctx.db, req.user_id, req.amount, Utc::now())
        .await;
    record_op_duration("post_consume", start, result.is_ok());
    Ok(Json(ApiResponse::success(result?)))
}

// ============================================================================
// Balance
// ============================================================================

/// GET /internal/balance/user/{id} (balance:read)
pub async fn get_user_balance(
    State(state): State<AppState>,
    auth: RequireAuth,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<Balance>>> {
    let balance = state
        .ledger
        .balance(&auth.ctx.db, parse_user_id(&id)?)
        .await?;
    Ok(Json(ApiResponse::success(balance)))
}

/// POST /internal/balance/topup (balance:write)
pub async fn top_up(
    State(state): State<AppState>,
    auth: RequireAuth,
    ApiJson(req): ApiJson<TopUpRequest>,
) -> ApiResult<Json<ApiResponse<TopUp>>> {
    let reason = required(&req.reason, "Reason is required")?;
    let top_up = state
        .ledger
        .top_up(&auth.ctx.db, req.user_id, req.amount_rmb, req.order_id.as_deref(), reason)
        .await?;
    tracing::info!(
        user_id = %req.user_id,
        amount = top_up.amount,
        key_name = ?auth.principal.key_name,
        "Balance topped up via internal API"
    );
    Ok(Json(
        ApiResponse::success(top_up).with_message("Balance topped up successfully"),
    ))
}

// ============================================================================
// Relay Tokens
// ============================================================================

/// GET /internal/token/user/{id} (token:read)
///
/// Keys are listed by display prefix only.
pub async fn list_user_tokens(
    auth: RequireAuth,
    Path(id): Path<String>,
    Query(query): Query<TokenListQuery>,
) -> ApiResult<Json<ApiResponse<TokenList>>> {
    let user = find_user(&auth, parse_user_id(&id)?).await?;
    let defaults = Pagination::default();
    let page = Pagination {
        page: query.page.unwrap_or(defaults.page),
        page_size: query.page_size.unwrap_or(defaults.page_size),
    }
    .normalized();
    let (tokens, total) = auth.ctx.db.list_relay_tokens(user.id, &page).await?;
    let listed = PaginatedResponse::new(tokens, total, &page);
    Ok(Json(ApiResponse::success(TokenList {
        tokens: listed.items,
        total: listed.total,
        page: listed.page,
        page_size: listed.page_size,
    })))
}

/// POST /internal/token (token:write)
///
/// With `X-Idempotency-Key`, a token of the same name for the same user is
/// returned instead of minting a second one.
pub async fn create_token(
    auth: RequireAuth,
    headers: HeaderMap,
    ApiJson(req): ApiJson<CreateRelayTokenRequest>,
) -> ApiResult<(StatusCode, Json<ApiResponse<CreatedToken>>)> {
    req.validate()?;
    let user = find_user(&auth, req.user_id).await?;
    if !user.is_enabled() {
        return Err(AuthError::UserDisabled.into());
    }
    let name = req.name.trim().to_string();

    if idempotency_key(&headers).is_some() {
        if let Some(existing) = auth.ctx.db.find_relay_token(user.id, &name).await? {
            return Ok((
                StatusCode::OK,
                Json(ApiResponse::success(CreatedToken {
                    id: existing.id,
                    name: existing.name,
                    key: None,
                    warning: None,
                    is_duplicate: true,
                })),
            ));
        }
    }

    let raw = format!(
        "{RELAY_TOKEN_PREFIX}{}",
        random_alphanumeric(RELAY_TOKEN_RANDOM_LEN)
    );
    let token = auth
        .ctx
        .db
        .create_relay_token(CreateRelayToken {
            tenant_id: user.tenant_id.clone(),
            user_id: user.id,
            name,
            key_hash: hash_token(&raw),
            key_prefix: raw.chars().take(RELAY_TOKEN_DISPLAY_LEN).collect(),
            remain_quota: req.remain_quota,
            unlimited_quota: req.unlimited_quota,
            group: user.group.clone(),
        })
        .await?;

    tracing::info!(
        user_id = %user.id,
        token_id = token.id,
        key_name = ?auth.principal.key_name,
        "Relay token created via internal API"
    );
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(CreatedToken {
            id: token.id,
            name: token.name,
            key: Some(raw),
            warning: Some("Please save this key - it will not be shown again."),
            is_duplicate: false,
        })),
    ))
}
