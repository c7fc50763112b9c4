//! Tenant administration and per-tenant configuration

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use lurus_auth_core::AuthError;
use lurus_axum::{ApiError, ApiJson, ApiResult, RequireAdmin, RequirePlatformAdmin};
use lurus_db::{CreateTenant, DbError};
use lurus_types::{
    slugify, ApiResponse, ConfigType, PaginatedResponse, Pagination, Tenant, TenantConfig,
    TenantId, TenantStatus,
};
use serde::Deserialize;

use crate::state::AppState;

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TenantListQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTenantRequest {
    pub name: String,
    /// Derived from `name` when absent
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub plan_type: Option<String>,
    #[serde(default)]
    pub max_users: i32,
    #[serde(default)]
    pub max_quota: i64,
}

#[derive(Debug, Deserialize)]
pub struct UpsertConfigRequest {
    pub key: String,
    pub value: String,
    /// Defaults to the existing row's type, else `string`
    #[serde(default)]
    pub value_type: Option<String>,
    /// Honoured for platform admins only
    #[serde(default)]
    pub is_system: Option<bool>,
}

async fn find_tenant(state: &AppState, id: &str) -> ApiResult<Tenant> {
    state
        .store
        .tenants
        .find_by_id(&TenantId::new(id))
        .await?
        .ok_or_else(|| ApiError::NotFound("Tenant not found".into()))
}

// ============================================================================
// Tenants (platform admin)
// ============================================================================

/// GET /api/admin/tenants
pub async fn list_tenants(
    State(state): State<AppState>,
    _admin: RequirePlatformAdmin,
    Query(query): Query<TenantListQuery>,
) -> ApiResult<Json<ApiResponse<PaginatedResponse<Tenant>>>> {
    let defaults = Pagination::default();
    let page = Pagination {
        page: query.page.unwrap_or(defaults.page),
        page_size: query.page_size.unwrap_or(defaults.page_size),
    }
    .normalized();
    let (tenants, total) = state.store.tenants.list(&page).await?;
    Ok(Json(ApiResponse::success(PaginatedResponse::new(tenants, total, &page))))
}

/// POST /api/admin/tenants
pub async fn create_tenant(
    State(state): State<AppState>,
    admin: RequirePlatformAdmin,
    ApiJson(req): ApiJson<CreateTenantRequest>,
) -> ApiResult<Json<ApiResponse<Tenant>>> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("Tenant name is required"));
    }
    let slug = slugify(req.slug.as_deref().unwrap_or(name));
    if slug.is_empty() {
        return Err(ApiError::bad_request("Tenant slug must contain letters or digits"));
    }

    let tenant = state
        .store
        .tenants
        .create(CreateTenant {
            external_org_id: format!("local:{slug}"),
            slug,
            name: name.to_string(),
            plan_type: req.plan_type.unwrap_or_else(|| "free".into()),
            max_users: req.max_users,
            max_quota: req.max_quota,
        })
        .await
        .map_err(|e| match e {
            DbError::Conflict(_) => AuthError::Conflict("Tenant slug already exists".into()),
            other => other.into(),
        })?;

    tracing::info!(
        tenant_id = %tenant.id,
        slug = %tenant.slug,
        actor = ?admin.principal.user_id,
        "Tenant created"
    );
    Ok(Json(
        ApiResponse::success(tenant).with_message("Tenant created"),
    ))
}

/// GET /api/admin/tenants/{id}
pub async fn get_tenant(
    State(state): State<AppState>,
    _admin: RequirePlatformAdmin,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<Tenant>>> {
    Ok(Json(ApiResponse::success(find_tenant(&state, &id).await?)))
}

async fn set_status(
    state: &AppState,
    admin: &RequirePlatformAdmin,
    id: &str,
    status: TenantStatus,
) -> ApiResult<Json<ApiResponse<Tenant>>> {
    let tenant_id = TenantId::new(id);
    if status != TenantStatus::Enabled && tenant_id == TenantId::default_tenant() {
        return Err(AuthError::Forbidden("The default tenant cannot be disabled".into()).into());
    }
    if !state.store.tenants.update_status(&tenant_id, status).await? {
        return Err(ApiError::NotFound("Tenant not found".into()));
    }
    tracing::warn!(
        tenant_id = %tenant_id,
        status = ?status,
        actor = ?admin.principal.user_id,
        "Tenant status changed"
    );
    Ok(Json(ApiResponse::success(find_tenant(state, id).await?)))
}

/// POST /api/admin/tenants/{id}/enable
pub async fn enable_tenant(
    State(state): State<AppState>,
    admin: RequirePlatformAdmin,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<Tenant>>> {
    set_status(&state, &admin, &id, TenantStatus::Enabled).await
}

/// POST /api/admin/tenants/{id}/disable
pub async fn disable_tenant(
    State(state): State<AppState>,
    admin: RequirePlatformAdmin,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<Tenant>>> {
    set_status(&state, &admin, &id, TenantStatus::Disabled).await
}

/// POST /api/admin/tenants/{id}/suspend
pub async fn suspend_tenant(
    State(state): State<AppState>,
    admin: RequirePlatformAdmin,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<Tenant>>> {
    set_status(&state, &admin, &id, TenantStatus::Suspended).await
}

// ============================================================================
// Tenant Config (platform admin, or admin of that tenant)
// ============================================================================

/// Tenant admins only reach their own tenant
fn check_config_access(admin: &RequireAdmin, tenant_id: &TenantId) -> Result<(), ApiError> {
    if admin.ctx.platform_admin || &admin.ctx.tenant.id == tenant_id {
        return Ok(());
    }
    Err(AuthError::Forbidden("Cannot access another tenant's configuration".into()).into())
}

/// GET /api/admin/tenants/{id}/config
pub async fn list_config(
    State(state): State<AppState>,
    admin: RequireAdmin,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<Vec<TenantConfig>>>> {
    let tenant = find_tenant(&state, &id).await?;
    check_config_access(&admin, &tenant.id)?;
    let rows = state.store.tenant_configs.list(&tenant.id).await?;
    Ok(Json(ApiResponse::success(rows)))
}

/// PUT /api/admin/tenants/{id}/config
///
/// System rows are read-only to tenant admins.
pub async fn upsert_config(
    State(state): State<AppState>,
    admin: RequireAdmin,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<UpsertConfigRequest>,
) -> ApiResult<Json<ApiResponse<TenantConfig>>> {
    let tenant = find_tenant(&state, &id).await?;
    check_config_access(&admin, &tenant.id)?;

    let key = req.key.trim();
    if key.is_empty() || key.len() > 128 {
        return Err(ApiError::bad_request("Config key must be 1-128 characters"));
    }
    let existing = state.store.tenant_configs.get(&tenant.id, key).await?;
    let platform = admin.ctx.platform_admin;
    if !platform && existing.as_ref().is_some_and(|row| row.is_system) {
        return Err(AuthError::Forbidden("System configuration is read-only".into()).into());
    }

    let value_type = match req.value_type.as_deref() {
        Some(raw) => ConfigType::parse(raw).ok_or_else(|| ApiError::bad_request("Invalid value_type"))?,
        None => existing.as_ref().map_or(ConfigType::String, |row| row.value_type),
    };
    if !value_type.accepts(&req.value) {
        return Err(ApiError::bad_request(format!(
            "Value is not a valid {}",
            value_type.as_str()
        )));
    }

    let is_system = if platform {
        req.is_system
            .unwrap_or_else(|| existing.as_ref().is_some_and(|row| row.is_system))
    } else {
        false
    };
    let row = state
        .store
        .tenant_configs
        .upsert(TenantConfig {
            tenant_id: tenant.id.clone(),
            key: key.to_string(),
            value: req.value,
            value_type,
            is_system,
            is_encrypted: existing.as_ref().is_some_and(|row| row.is_encrypted),
            updated_at: Utc::now(),
        })
        .await?;
    tracing::info!(tenant_id = %tenant.id, key = %row.key, actor = %admin.user_id, "Tenant config updated");
    Ok(Json(ApiResponse::success(row)))
}
