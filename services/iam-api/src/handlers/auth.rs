//! Public login, registration and phone-code handlers
//!
//! These routes are reachable without credentials and are mounted both at
//! `/api` and under `/api/t/{tenant}`.

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{AppendHeaders, IntoResponse};
use axum::Json;
use chrono::Utc;
use lurus_auth_core::{invitation, CodePurpose, LoginOutcome, RegisterRequest};
use lurus_axum::{ApiError, ApiJson, ApiResult, TenantCtx};
use lurus_types::ApiResponse;
use serde::{Deserialize, Serialize};

use super::shared::{required, ClientIp, UserView};
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct SendCodeRequest {
    pub phone: String,
    pub purpose: String,
}

#[derive(Debug, Deserialize)]
pub struct SmsLoginRequest {
    pub phone: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub phone: String,
    pub code: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct InvitationPath {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct InvitationCheck {
    pub valid: bool,
    pub expires_at: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct SmsStatus {
    pub enabled: bool,
}

/// Session cookie plus the user's profile
fn logged_in(state: &AppState, outcome: &LoginOutcome, message: &str) -> impl IntoResponse {
    let cookie = state.resolver.sessions().set_cookie(&outcome.cookie);
    (
        AppendHeaders([(header::SET_COOKIE, cookie)]),
        Json(ApiResponse::success(UserView::from(&outcome.user)).with_message(message)),
    )
}

// ============================================================================
// Password Plane
// ============================================================================

/// POST /api/user/login
pub async fn login(
    State(state): State<AppState>,
    ctx: TenantCtx,
    ApiJson(req): ApiJson<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    let username = required(&req.username, "Username is required")?;
    let outcome = state
        .resolver
        .password_login(&ctx.tenant, username, &req.password, Utc::now())
        .await?;
    tracing::info!(user_id = %outcome.user.id, tenant_id = %ctx.tenant.id, "User logged in");
    Ok(logged_in(&state, &outcome, "Login successful"))
}

/// POST /api/user/register
pub async fn register(
    State(state): State<AppState>,
    ctx: TenantCtx,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.resolver.register(&ctx.tenant, req, Utc::now()).await?;
    Ok(logged_in(&state, &outcome, "Registration successful"))
}

/// POST /api/user/logout
pub async fn logout(State(state): State<AppState>) -> impl IntoResponse {
    (
        AppendHeaders([(header::SET_COOKIE, state.resolver.sessions().clear_cookie())]),
        Json(ApiResponse::<()>::ok("Logged out")),
    )
}

/// GET /api/user/invitation/{code}
///
/// Validates a code without consuming it.
pub async fn check_invitation(
    ctx: TenantCtx,
    Path(path): Path<InvitationPath>,
) -> ApiResult<Json<ApiResponse<InvitationCheck>>> {
    let code = invitation::check_invitation(&ctx.db, path.code.trim(), Utc::now()).await?;
    Ok(Json(ApiResponse::success(InvitationCheck {
        valid: true,
        expires_at: code.expires_at,
    })))
}

// ============================================================================
// Phone Plane
// ============================================================================

/// GET /api/user/sms/status
pub async fn sms_status(State(state): State<AppState>) -> Json<ApiResponse<SmsStatus>> {
    Json(ApiResponse::success(SmsStatus {
        enabled: state.resolver.sms_enabled(),
    }))
}

/// POST /api/user/sms/send
pub async fn send_code(
    State(state): State<AppState>,
    ctx: TenantCtx,
    ClientIp(ip): ClientIp,
    ApiJson(req): ApiJson<SendCodeRequest>,
) -> ApiResult<Json<ApiResponse<()>>> {
    let purpose =
        CodePurpose::parse(req.purpose.trim()).ok_or_else(|| ApiError::bad_request("Invalid purpose"))?;
    state
        .resolver
        .send_code(&ctx.tenant, req.phone.trim(), purpose, ip, Utc::now())
        .await?;
    Ok(Json(ApiResponse::ok("Verification code sent successfully")))
}

/// POST /api/user/sms/login
///
/// Unknown phones are registered when the tenant allows it.
pub async fn sms_login(
    State(state): State<AppState>,
    ctx: TenantCtx,
    ApiJson(req): ApiJson<SmsLoginRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state
        .resolver
        .phone_login(&ctx.tenant, req.phone.trim(), req.code.trim(), Utc::now())
        .await?;
    if outcome.created {
        tracing::info!(user_id = %outcome.user.id, tenant_id = %ctx.tenant.id, "User created by phone login");
    }
    Ok(logged_in(&state, &outcome, "Login successful"))
}

/// POST /api/user/password/reset
pub async fn reset_password(
    State(state): State<AppState>,
    ctx: TenantCtx,
    ApiJson(req): ApiJson<ResetPasswordRequest>,
) -> ApiResult<Json<ApiResponse<()>>> {
    state
        .resolver
        .reset_password(&ctx.tenant, req.phone.trim(), req.code.trim(), &req.password, Utc::now())
        .await?;
    Ok(Json(ApiResponse::ok("Password reset successfully")))
}
