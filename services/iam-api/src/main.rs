//! Lurus IAM API
//!
//! Identity, access and entitlement service.
//!
//! ## Route planes
//!
//! - `/api/user/*`, `/api/t/{tenant}/user/*` - Login, registration, phone codes
//! - `/api/subscription/*` - Plans, checkout and subscription history
//! - `/api/admin/*` - API keys, invitations, plans, tenants
//! - `/internal/*` - Service-key API for trusted backends
//! - `/api/webhook/*` - Payment gateway callbacks
//!
//! ## Health Endpoints
//!
//! - `GET /health` - Liveness probe
//! - `GET /ready` - Readiness probe
//! - `GET /metrics` - Prometheus metrics

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::connect_info::IntoMakeServiceWithConnectInfo;
use axum::Router;
use iam_api::state::sms_sender;
use iam_api::{build_router, AppState, Config};
use lurus_db::Store;
use lurus_entitlement::{spawn_catalog_sync, spawn_code_purge, CpuWatchdog, JobRunner};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Time background tasks get to finish after the server stops
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(config.log_json)?;

    tracing::info!("Starting Lurus IAM API");
    tracing::info!(
        port = config.port,
        master = config.is_master,
        oidc = config.auth.oidc.is_some(),
        sms = config.sms.is_some(),
        "Configuration loaded"
    );

    let metrics_handle = if config.metrics_enabled {
        Some(setup_metrics()?)
    } else {
        None
    };

    let store = match &config.database_url {
        Some(url) => {
            let pool = lurus_db::create_pool(url).await?;
            lurus_db::run_migrations(&pool).await?;
            tracing::info!("Using PostgreSQL store");
            Store::postgres(pool)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store; data is lost on restart");
            Store::memory()
        }
    };

    let sms = config.sms.as_ref().map(sms_sender).transpose()?;
    let state = AppState::new(store.clone(), config.clone(), sms)?;

    let plans = state.subscriptions.plan_catalog().clone();
    if let Err(e) = plans.refresh().await {
        tracing::warn!(error = %e, "Plan catalog load failed, serving defaults");
    }
    match state.resolver.api_keys().audit_wildcard_keys().await {
        Ok(0) => {}
        Ok(count) => tracing::warn!(count, "Wildcard API keys present"),
        Err(e) => tracing::warn!(error = %e, "Wildcard key audit failed"),
    }
    if config.batch_update_enabled {
        tracing::warn!("BATCH_UPDATE_ENABLED is set; quota writes are applied directly");
    }

    // Background tasks
    let token = CancellationToken::new();
    let tracker = TaskTracker::new();

    if config.is_master {
        JobRunner::new(store, state.quota.clone(), config.entitlement.jobs.clone())
            .spawn_all(&token, &tracker);
    } else {
        tracing::info!("Worker node, background jobs run on the master");
    }
    spawn_catalog_sync(plans, config.sync_interval, &token, &tracker);
    spawn_code_purge(
        state.resolver.verification().clone(),
        config.auth.verification_ttl,
        &token,
        &tracker,
    );
    if let Some(watchdog) = config.entitlement.watchdog.clone() {
        tracker.spawn(CpuWatchdog::new(watchdog).run(token.clone()));
    }
    let jwks_refresh = state
        .resolver
        .oidc()
        .map(|oidc| oidc.spawn_refresh(token.clone()));

    let app = build_router(state, metrics_handle);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let result = run_http_server(app, addr).await;

    // Stop background tasks
    token.cancel();
    tracker.close();
    if tokio::time::timeout(DRAIN_TIMEOUT, tracker.wait()).await.is_err() {
        tracing::warn!("Background tasks did not stop in time");
    }
    if let Some(handle) = jwks_refresh {
        handle.abort();
    }

    tracing::info!("Shutdown complete");
    result
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,iam_api=debug"))?;
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
    Ok(())
}

async fn run_http_server(app: Router, addr: SocketAddr) -> anyhow::Result<()> {
    tracing::info!("HTTP server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let service: IntoMakeServiceWithConnectInfo<Router, SocketAddr> =
        app.into_make_service_with_connect_info();

    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn setup_metrics() -> anyhow::Result<PrometheusHandle> {
    // Most operations finish within a database round trip
    let latency_buckets = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.2, 0.5, 1.0, 2.5];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("iam_operation_duration_seconds".to_string()),
            latency_buckets,
        )?
        .install_recorder()?;

    metrics::describe_counter!(
        "iam_auth_attempts_total",
        "Authentication attempts by plane and outcome"
    );
    metrics::describe_counter!(
        "iam_webhook_events_total",
        "Payment notifications by gateway and outcome"
    );
    metrics::describe_counter!(
        "iam_quota_limited_total",
        "Requests refused by the daily quota"
    );
    metrics::describe_counter!(
        "iam_job_runs_total",
        "Background job ticks by job and outcome"
    );
    metrics::describe_counter!(
        "iam_payment_amount_mismatch_total",
        "Payments whose amount differs from the order"
    );
    metrics::describe_counter!(
        "iam_subscriptions_created_total",
        "Pending subscriptions created by payment method"
    );
    metrics::describe_histogram!(
        "iam_operation_duration_seconds",
        "Operation latency in seconds by operation type"
    );

    Ok(handle)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
