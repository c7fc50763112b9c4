//! Health check handlers

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use lurus_types::{ComponentHealth, HealthResponse, HealthStatus};

use crate::state::AppState;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Liveness probe - always returns OK if the service is running
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: HealthStatus::Healthy,
        version: VERSION.to_string(),
        components: None,
    })
}

/// Readiness probe - checks the store
pub async fn ready(
    State(state): State<AppState>,
) -> Result<Json<HealthResponse>, (StatusCode, Json<HealthResponse>)> {
    match state.store.health.ping().await {
        Ok(()) => Ok(Json(HealthResponse {
            status: HealthStatus::Healthy,
            version: VERSION.to_string(),
            components: Some(vec![ComponentHealth {
                name: "database".into(),
                status: HealthStatus::Healthy,
                message: None,
            }]),
        })),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: HealthStatus::Unhealthy,
                    version: VERSION.to_string(),
                    components: Some(vec![ComponentHealth {
                        name: "database".into(),
                        status: HealthStatus::Unhealthy,
                        message: Some("unreachable".into()),
                    }]),
                }),
            ))
        }
    }
}
