//! Shared handler utilities
//!
//! Path parsing, header helpers and metrics used across handlers.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use lurus_axum::ApiError;
use lurus_types::{ApiKeyId, SubscriptionId, User, UserId};
use serde::Serialize;

/// Header making internal creates safe to retry
pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";

// ============================================================================
// Input Validation
// ============================================================================

pub fn parse_user_id(raw: &str) -> Result<UserId, ApiError> {
    UserId::parse(raw).ok_or_else(|| ApiError::bad_request("Invalid user ID"))
}

pub fn parse_subscription_id(raw: &str) -> Result<SubscriptionId, ApiError> {
    SubscriptionId::parse(raw).ok_or_else(|| ApiError::bad_request("Invalid subscription ID"))
}

pub fn parse_key_id(raw: &str) -> Result<ApiKeyId, ApiError> {
    ApiKeyId::parse(raw).ok_or_else(|| ApiError::bad_request("Invalid key ID"))
}

/// Trimmed `value`, rejecting blanks with `message`
pub fn required<'a>(value: &'a str, message: &str) -> Result<&'a str, ApiError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ApiError::bad_request(message));
    }
    Ok(value)
}

/// Non-empty `X-Idempotency-Key`
pub fn idempotency_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Caller address: the first `X-Forwarded-For` hop, else the socket peer
#[derive(Debug, Clone, Copy)]
pub struct ClientIp(pub Option<IpAddr>);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok());
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip());
        Ok(Self(forwarded.or(peer)))
    }
}

// ============================================================================
// Response Views
// ============================================================================

/// Public profile of a user
#[derive(Debug, Serialize)]
pub struct UserView {
    pub id: UserId,
    pub username: String,
    pub display_name: String,
    pub email: String,
    pub phone: String,
    pub phone_verified: bool,
    pub role: i32,
    pub status: i32,
    pub group: String,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            email: user.email.clone(),
            phone: user.phone.clone(),
            phone_verified: user.phone_verified,
            role: user.role.code(),
            status: user.status.code(),
            group: user.group.clone(),
        }
    }
}

// ============================================================================
// Metrics Helpers
// ============================================================================

/// Record handler latency with a result label
#[inline]
pub fn record_op_duration(operation: &'static str, start: Instant, success: bool) {
    let result = if success { "ok" } else { "err" };
    metrics::histogram!(
        "iam_operation_duration_seconds",
        "operation" => operation,
        "result" => result
    )
    .record(start.elapsed().as_secs_f64());
}
