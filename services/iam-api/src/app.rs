//! Router assembly

use axum::handler::Handler;
use axum::routing::{delete, get, post, MethodRouter};
use axum::Router;
use lurus_axum::{AuthLayer, RequireRoleLayer, RequireScopeLayer};
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::handlers::{self, admin, auth, internal, subscription, tenants, user, webhook};
use crate::state::AppState;

/// Build the HTTP router.
///
/// Health and metrics sit outside the middleware stack so probes never hit
/// the request timeout.
pub fn build_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let request_timeout = state.request_timeout();
    let resolver = state.resolver.clone();

    // Anonymous or logged-in; served for the default tenant and per slug
    let public = Router::new()
        .route("/user/login", post(auth::login))
        .route("/user/register", post(auth::register))
        .route("/user/logout", post(auth::logout))
        .route("/user/sms/status", get(auth::sms_status))
        .route("/user/sms/send", post(auth::send_code))
        .route("/user/sms/login", post(auth::sms_login))
        .route("/user/password/reset", post(auth::reset_password))
        .route("/invitation/{code}", get(auth::check_invitation))
        .route("/subscription/plans", get(subscription::plans))
        .route_layer(AuthLayer::optional(resolver.clone()));

    // Session or bearer users
    let users = Router::new()
        .route("/api/user/self", get(user::get_self))
        .route("/api/user/phone/bind", post(user::bind_phone))
        .route("/api/subscription/current", get(subscription::current))
        .route("/api/subscription/history", get(subscription::history))
        .route("/api/subscription/create", post(subscription::create))
        .route("/api/subscription/{id}/pay", post(subscription::pay))
        .route("/api/subscription/{id}/retry", post(subscription::retry))
        .route("/api/subscription/{id}/cancel", post(subscription::cancel))
        .route("/api/subscription/{id}/payment-status", get(subscription::payment_status))
        .route_layer(AuthLayer::users(resolver.clone()));

    // Bearer principals also need an admin role claim
    let auth_config = resolver.config();
    let admin_roles = RequireRoleLayer::any(auth_config.gate(), auth_config.admin_roles.clone());
    let admin = Router::new()
        .route("/api-keys", get(admin::list_api_keys).post(admin::create_api_key))
        .route("/api-keys/scopes", get(admin::list_scopes))
        .route(
            "/api-keys/{id}",
            get(admin::get_api_key)
                .put(admin::update_api_key)
                .delete(admin::delete_api_key),
        )
        .route("/api-keys/{id}/toggle", post(admin::toggle_api_key))
        .route(
            "/invitations",
            get(admin::list_invitations).post(admin::create_invitations),
        )
        .route("/invitations/{id}", delete(admin::delete_invitation))
        .route("/plans", get(admin::list_plans).put(admin::replace_plans))
        .route("/subscriptions/{id}/renew", post(admin::renew_subscription))
        .route("/tenants", get(tenants::list_tenants).post(tenants::create_tenant))
        .route("/tenants/{id}", get(tenants::get_tenant))
        .route("/tenants/{id}/enable", post(tenants::enable_tenant))
        .route("/tenants/{id}/disable", post(tenants::disable_tenant))
        .route("/tenants/{id}/suspend", post(tenants::suspend_tenant))
        .route(
            "/tenants/{id}/config",
            get(tenants::list_config).put(tenants::upsert_config),
        )
        .route_layer(admin_roles)
        .route_layer(AuthLayer::users(resolver.clone()));

    // Service keys; each route checks its own scope after authentication
    let internal = Router::new()
        .route(
            "/user/{id}",
            scoped_get(internal::get_user, "user:read")
                .put(internal::update_user.layer(RequireScopeLayer::new("user:write")))
                .delete(internal::delete_user.layer(RequireScopeLayer::new("user:delete"))),
        )
        .route("/user/by-email/{email}", scoped_get(internal::get_user_by_email, "user:read"))
        .route("/user/by-phone/{phone}", scoped_get(internal::get_user_by_phone, "user:read"))
        .route("/user", scoped_post(internal::create_user, "user:write"))
        .route("/auth/login", scoped_post(internal::login, "auth:login"))
        .route(
            "/subscription/user/{id}",
            scoped_get(internal::get_user_subscription, "subscription:read"),
        )
        .route(
            "/subscription/grant",
            scoped_post(internal::grant_subscription, "subscription:write"),
        )
        .route("/quota/user/{id}", scoped_get(internal::get_user_quota, "quota:read"))
        .route("/quota/adjust", scoped_post(internal::adjust_quota, "quota:write"))
        .route("/quota/pre-consume", scoped_post(internal::pre_consume, "quota:write"))
        .route("/quota/post-consume", scoped_post(internal::post_consume, "quota:write"))
        .route("/balance/user/{id}", scoped_get(internal::get_user_balance, "balance:read"))
        .route("/balance/topup", scoped_post(internal::top_up, "balance:write"))
        .route("/token/user/{id}", scoped_get(internal::list_user_tokens, "token:read"))
        .route("/token", scoped_post(internal::create_token, "token:write"))
        .route_layer(AuthLayer::service_keys(resolver));

    // Gateway callbacks authenticate themselves
    let webhooks = Router::new()
        .route("/api/webhook/stripe", post(webhook::stripe))
        .route("/api/webhook/creem", post(webhook::creem))
        .route("/api/subscription/epay/notify", get(webhook::epay).post(webhook::epay));

    // Health routes (no timeout)
    let health_routes = Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready));

    let metrics_route = if let Some(handle) = metrics_handle {
        Router::new().route("/metrics", get(move || async move { handle.render() }))
    } else {
        Router::new()
    };

    // Outermost first
    let middleware = ServiceBuilder::new()
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TimeoutLayer::new(request_timeout));

    Router::new()
        .nest("/api", public.clone())
        .nest("/api/t/{tenant}", public)
        .merge(users)
        .nest("/api/admin", admin)
        .nest("/internal", internal)
        .merge(webhooks)
        .layer(middleware)
        .merge(health_routes)
        .merge(metrics_route)
        .with_state(state)
}

fn scoped_get<H, T>(handler: H, scope: &'static str) -> MethodRouter<AppState>
where
    H: Handler<T, AppState>,
    T: 'static,
{
    get(handler.layer(RequireScopeLayer::new(scope)))
}

fn scoped_post<H, T>(handler: H, scope: &'static str) -> MethodRouter<AppState>
where
    H: Handler<T, AppState>,
    T: 'static,
{
    post(handler.layer(RequireScopeLayer::new(scope)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use lurus_db::Store;
    use tower::ServiceExt;

    use crate::config::Config;

    fn app() -> Router {
        let config = Config::from_lookup(|key| {
            (key == "SESSION_SECRET").then(|| "0123456789abcdef0123456789abcdef".to_string())
        })
        .unwrap();
        let state = AppState::new(Store::memory(), config, None).unwrap();
        build_router(state, None)
    }

    async fn status(uri: &str) -> StatusCode {
        app()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn probes_are_open() {
        assert_eq!(status("/health").await, StatusCode::OK);
        assert_eq!(status("/ready").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn guarded_planes_reject_anonymous_callers() {
        assert_eq!(status("/api/user/self").await, StatusCode::UNAUTHORIZED);
        assert_eq!(status("/api/admin/api-keys").await, StatusCode::UNAUTHORIZED);
        assert_eq!(status("/internal/user/1").await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn plans_are_public_for_any_tenant_path() {
        assert_eq!(status("/api/subscription/plans").await, StatusCode::OK);
        assert_eq!(status("/api/t/default/subscription/plans").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn request_ids_are_echoed() {
        let response = app()
            .oneshot(Request::builder().uri("/api/subscription/plans").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.headers().contains_key("x-request-id"));
    }
}
