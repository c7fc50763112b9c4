//! Envelope error responses.
//!
//! Every handler and layer failure is rendered as
//! `{success: false, message, error_code}` with the status implied by the
//! code. Server-side failures get a generic message; the cause goes to the
//! log.

use axum::extract::rejection::JsonRejection;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use lurus_auth_core::AuthError;
use lurus_db::DbError;
use lurus_entitlement::{EntitlementError, WebhookError};
use lurus_types::{ApiResponse, ErrorCode, ValidationError};

/// Handler result type
pub type ApiResult<T> = Result<T, ApiError>;

/// Errors surfaced by the HTTP layer
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Entitlement(#[from] EntitlementError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    /// Malformed body, query or path
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Auth(e) => e.code(),
            // Disabled accounts keep their own code on the entitlement side
            Self::Entitlement(EntitlementError::UserDisabled) => ErrorCode::UserDisabled,
            Self::Entitlement(e) => e.code(),
            Self::Webhook(e) => e.code(),
            Self::BadRequest(_) => ErrorCode::ValidationFailed,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Entitlement(e) => e.status_code(),
            _ => self.code().http_status(),
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Auth(AuthError::RateLimited { retry_after_secs }) => Some(*retry_after_secs),
            _ => None,
        }
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        Self::Auth(err.into())
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::BadRequest(err.0)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = ApiResponse::<()>::error(Some(self.code()), message);
        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = self.retry_after() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn render(err: ApiError) -> (StatusCode, axum::http::HeaderMap, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn auth_failure_is_401_envelope() {
        let (status, _, body) = render(AuthError::AuthFailed.into()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert_eq!(body["error_code"], "AUTH_FAILED");
        assert!(body.get("data").is_none());
    }

    #[tokio::test]
    async fn disabled_account_keeps_its_code() {
        let (status, _, body) = render(EntitlementError::UserDisabled.into()).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error_code"], "USER_DISABLED");
    }

    #[tokio::test]
    async fn server_errors_hide_the_cause() {
        let (status, _, body) =
            render(EntitlementError::Gateway("stripe said: secret sk_live_x".into()).into()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["message"], "Internal server error");
        assert_eq!(body["error_code"], "INTERNAL_ERROR");
    }

    #[tokio::test]
    async fn rate_limit_sets_retry_after() {
        let (status, headers, body) =
            render(AuthError::RateLimited { retry_after_secs: 42 }.into()).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(headers[header::RETRY_AFTER], "42");
        assert_eq!(body["error_code"], "RATE_LIMITED");
    }

    #[tokio::test]
    async fn invalid_code_is_a_validation_failure() {
        let (status, _, body) = render(AuthError::InvalidCode.into()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Invalid or expired verification code");
    }
}
