//! Handlers for the logged-in user

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use lurus_auth_core::AuthError;
use lurus_axum::{ApiJson, ApiResult, RequireUser};
use lurus_types::ApiResponse;
use serde::Deserialize;

use super::shared::UserView;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct BindPhoneRequest {
    pub phone: String,
    pub code: String,
}

/// GET /api/user/self
pub async fn get_self(user: RequireUser) -> ApiResult<Json<ApiResponse<UserView>>> {
    let found = user
        .db
        .find_user(user.user_id)
        .await?
        .ok_or(AuthError::UserNotFound)?;
    Ok(Json(ApiResponse::success(UserView::from(&found))))
}

/// POST /api/user/phone/bind
pub async fn bind_phone(
    State(state): State<AppState>,
    user: RequireUser,
    ApiJson(req): ApiJson<BindPhoneRequest>,
) -> ApiResult<Json<ApiResponse<UserView>>> {
    let updated = state
        .resolver
        .bind_phone(&user.db, user.user_id, req.phone.trim(), req.code.trim(), Utc::now())
        .await?;
    tracing::info!(user_id = %user.user_id, "Phone bound");
    Ok(Json(
        ApiResponse::success(UserView::from(&updated)).with_message("Phone bound successfully"),
    ))
}
