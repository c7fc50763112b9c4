//! Admin handlers: API keys, invitation codes, the plan catalog and
//! subscription renewal

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use lurus_auth_core::{invitation, scope_descriptions, AuthError};
use lurus_axum::{ApiError, ApiJson, ApiResult, RequireAdmin};
use lurus_types::{
    ApiKey, ApiResponse, CreateApiKeyRequest, CreateApiKeyResponse, CreateInvitationRequest,
    InvitationCode, PaginatedResponse, Pagination, Subscription, SubscriptionPlan, TenantId,
    UpdateApiKeyRequest,
};
use serde::{Deserialize, Serialize};

use super::shared::{parse_key_id, parse_subscription_id};
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    /// Code prefix filter (invitations only)
    pub prefix: Option<String>,
}

impl PageQuery {
    fn pagination(&self) -> Pagination {
        let defaults = Pagination::default();
        Pagination {
            page: self.page.unwrap_or(defaults.page),
            page_size: self.page_size.unwrap_or(defaults.page_size),
        }
        .normalized()
    }
}

#[derive(Debug, Serialize)]
pub struct ScopeView {
    pub scope: &'static str,
    pub name: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct RenewRequest {
    pub days: i64,
}

/// API keys and the plan catalog span all tenants; only platform admins and
/// admins of the default tenant may change them.
fn require_platform_tenant(admin: &RequireAdmin) -> Result<(), ApiError> {
    if admin.ctx.platform_admin || admin.ctx.tenant.id == TenantId::default_tenant() {
        return Ok(());
    }
    Err(AuthError::Forbidden("Managed by the platform tenant".into()).into())
}

// ============================================================================
// API Keys
// ============================================================================

/// GET /api/admin/api-keys
pub async fn list_api_keys(
    State(state): State<AppState>,
    admin: RequireAdmin,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<ApiResponse<PaginatedResponse<ApiKey>>>> {
    require_platform_tenant(&admin)?;
    let page = query.pagination();
    let (keys, total) = state.resolver.api_keys().list(&page).await?;
    Ok(Json(ApiResponse::success(PaginatedResponse::new(keys, total, &page))))
}

/// GET /api/admin/api-keys/scopes
pub async fn list_scopes(_admin: RequireAdmin) -> Json<ApiResponse<Vec<ScopeView>>> {
    let scopes = scope_descriptions()
        .into_iter()
        .map(|(scope, name)| ScopeView { scope, name })
        .collect();
    Json(ApiResponse::success(scopes))
}

/// POST /api/admin/api-keys
///
/// The raw key is returned only in this response.
pub async fn create_api_key(
    State(state): State<AppState>,
    admin: RequireAdmin,
    ApiJson(req): ApiJson<CreateApiKeyRequest>,
) -> ApiResult<Json<ApiResponse<CreateApiKeyResponse>>> {
    require_platform_tenant(&admin)?;
    let created = state
        .resolver
        .api_keys()
        .create(req, admin.user_id, admin.role)
        .await?;
    Ok(Json(ApiResponse::success(created).with_message(
        "API key created successfully. Please save the key now - it won't be shown again!",
    )))
}

/// GET /api/admin/api-keys/{id}
pub async fn get_api_key(
    State(state): State<AppState>,
    admin: RequireAdmin,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<ApiKey>>> {
    require_platform_tenant(&admin)?;
    let key = state.resolver.api_keys().get(parse_key_id(&id)?).await?;
    Ok(Json(ApiResponse::success(key)))
}

/// PUT /api/admin/api-keys/{id}
pub async fn update_api_key(
    State(state): State<AppState>,
    admin: RequireAdmin,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<UpdateApiKeyRequest>,
) -> ApiResult<Json<ApiResponse<ApiKey>>> {
    require_platform_tenant(&admin)?;
    let key = state
        .resolver
        .api_keys()
        .update(parse_key_id(&id)?, req, admin.user_id, admin.role)
        .await?;
    Ok(Json(
        ApiResponse::success(key).with_message("API key updated successfully"),
    ))
}

/// POST /api/admin/api-keys/{id}/toggle
pub async fn toggle_api_key(
    State(state): State<AppState>,
    admin: RequireAdmin,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<ApiKey>>> {
    require_platform_tenant(&admin)?;
    let key = state
        .resolver
        .api_keys()
        .toggle(parse_key_id(&id)?, admin.user_id, admin.role)
        .await?;
    Ok(Json(
        ApiResponse::success(key).with_message("API key toggled successfully"),
    ))
}

/// DELETE /api/admin/api-keys/{id}
pub async fn delete_api_key(
    State(state): State<AppState>,
    admin: RequireAdmin,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<()>>> {
    require_platform_tenant(&admin)?;
    state
        .resolver
        .api_keys()
        .delete(parse_key_id(&id)?, admin.user_id)
        .await?;
    Ok(Json(ApiResponse::ok("API key deleted successfully")))
}

// ============================================================================
// Invitation Codes
// ============================================================================

/// GET /api/admin/invitations?page=&page_size=&prefix=
pub async fn list_invitations(
    admin: RequireAdmin,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<ApiResponse<PaginatedResponse<InvitationCode>>>> {
    let page = query.pagination();
    let (codes, total) =
        invitation::list_invitations(&admin.db, query.prefix.as_deref(), &page).await?;
    Ok(Json(ApiResponse::success(PaginatedResponse::new(codes, total, &page))))
}

/// POST /api/admin/invitations
pub async fn create_invitations(
    admin: RequireAdmin,
    ApiJson(req): ApiJson<CreateInvitationRequest>,
) -> ApiResult<Json<ApiResponse<Vec<InvitationCode>>>> {
    let codes = invitation::create_invitations(&admin.db, admin.user_id, &req, Utc::now()).await?;
    Ok(Json(ApiResponse::success(codes)))
}

/// DELETE /api/admin/invitations/{id}
///
/// Only unused codes can be deleted.
pub async fn delete_invitation(
    admin: RequireAdmin,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<()>>> {
    let id: i64 = id
        .parse()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| ApiError::bad_request("Invalid invitation ID"))?;
    invitation::delete_invitation(&admin.db, id).await?;
    Ok(Json(ApiResponse::ok("Invitation code deleted")))
}

// ============================================================================
// Plan Catalog
// ============================================================================

/// GET /api/admin/plans
///
/// Disabled plans included.
pub async fn list_plans(
    State(state): State<AppState>,
    _admin: RequireAdmin,
) -> Json<ApiResponse<Vec<SubscriptionPlan>>> {
    let plans = state.subscriptions.plan_catalog().all().await;
    Json(ApiResponse::success(plans.as_ref().clone()))
}

/// PUT /api/admin/plans
pub async fn replace_plans(
    State(state): State<AppState>,
    admin: RequireAdmin,
    ApiJson(plans): ApiJson<Vec<SubscriptionPlan>>,
) -> ApiResult<Json<ApiResponse<Vec<SubscriptionPlan>>>> {
    require_platform_tenant(&admin)?;
    let plans = state.subscriptions.plan_catalog().replace(plans).await?;
    tracing::info!(actor = %admin.user_id, count = plans.len(), "Plan catalog updated");
    Ok(Json(
        ApiResponse::success(plans.as_ref().clone()).with_message("Plans updated"),
    ))
}

// ============================================================================
// Subscriptions
// ============================================================================

/// POST /api/admin/subscriptions/{id}/renew
///
/// Extends from the current expiry, or from now when already lapsed.
pub async fn renew_subscription(
    State(state): State<AppState>,
    admin: RequireAdmin,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<RenewRequest>,
) -> ApiResult<Json<ApiResponse<Subscription>>> {
    let id = parse_subscription_id(&id)?;
    let sub = state
        .subscriptions
        .renew(&admin.db, id, req.days, Utc::now())
        .await?;
    tracing::info!(actor = %admin.user_id, subscription_id = %id, days = req.days, "Subscription renewed by admin");
    Ok(Json(
        ApiResponse::success(sub).with_message("Subscription renewed"),
    ))
}
