//! Account lease admin service
//!
//! Single-binary Rust service that:
//! 1. Connects to the shared key-value store holding the account pools
//! 2. Runs periodic maintenance on its configured pool (expired lease
//!    reclamation, index repair, cooldown reaping)
//! 3. Serves the admin API, `/health` and `/metrics`

mod admin;
mod config;
mod error;
mod metrics;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{MatchedPath, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lease_pool::{LeaseCoordinator, RedisStore, Store, spawn_maintenance_task};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;

/// Time allowed for in-flight requests to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state for the health and metrics handlers
struct AppState<S> {
    coordinator: Arc<LeaseCoordinator<S>>,
    pool: String,
    started_at: Instant,
    prometheus: PrometheusHandle,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            coordinator: Arc::clone(&self.coordinator),
            pool: self.pool.clone(),
            started_at: self.started_at,
            prometheus: self.prometheus.clone(),
        }
    }
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router<S: Store>(state: AppState<S>, admin: AdminState<S>, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler::<S>))
        .route("/metrics", get(metrics_handler::<S>))
        .with_state(state)
        .merge(build_admin_router(admin))
        .layer(middleware::from_fn(track_metrics))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting account-lease-admin");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.admin.listen_addr,
        store_host = %config.store.host,
        store_port = config.store.port,
        store_database = config.store.database,
        pool = %config.pool.name,
        "configuration loaded"
    );

    let store = RedisStore::new(config.store.settings());
    let coordinator = Arc::new(
        LeaseCoordinator::new(store).with_abandoned_cooldown(config.pool.abandoned_cooldown_secs),
    );

    // The store client reconnects on demand, so an unreachable store is not fatal here
    if !coordinator.test_connection().await {
        warn!(
            host = %config.store.host,
            port = config.store.port,
            "store not reachable at startup, serving degraded until it is"
        );
    }

    let maintenance = spawn_maintenance_task(
        Arc::clone(&coordinator),
        config.pool.name.clone(),
        config.pool.maintenance_interval(),
        config.pool.lease_timeout(),
    );
    info!(
        interval_secs = config.pool.maintenance_interval_secs,
        lease_timeout_secs = config.pool.lease_timeout_secs,
        "maintenance task started"
    );

    let app_state = AppState {
        coordinator: Arc::clone(&coordinator),
        pool: config.pool.name.clone(),
        started_at: Instant::now(),
        prometheus: prometheus_handle,
    };
    let admin_state = AdminState::new(Arc::clone(&coordinator), config.pool.lease_timeout());
    let app = build_router(app_state, admin_state, config.admin.max_connections);

    let listen_addr = config.admin.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // Graceful shutdown: stop accepting on SIGTERM/SIGINT, drain in-flight
    // requests, and give up after DRAIN_TIMEOUT counted from the signal.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    maintenance.abort();
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: returns JSON with status, store reachability and uptime.
/// Returns 200 when the store answers PING, 503 otherwise.
async fn health_handler<S: Store>(State(state): State<AppState<S>>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();

    let (status_code, body) = if state.coordinator.test_connection().await {
        (
            axum::http::StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "store": "connected",
                "pool": state.pool,
                "uptime_seconds": uptime,
            }),
        )
    } else {
        (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "degraded",
                "store": "unreachable",
                "pool": state.pool,
                "uptime_seconds": uptime,
            }),
        )
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint: returns metrics in text exposition format.
async fn metrics_handler<S: Store>(State(state): State<AppState<S>>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Record request count and latency, labelled by route template rather than
/// raw path so pool names do not explode label cardinality.
async fn track_metrics(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let started = Instant::now();
    let response = next.run(request).await;
    metrics::record_request(
        &route,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use lease_pool::{AccountSeed, MemoryStore, RedisSettings};
    use tower::ServiceExt;

    /// Create a PrometheusHandle for tests without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    fn test_router<S: Store>(store: S) -> (Router, Arc<LeaseCoordinator<S>>) {
        let coordinator = Arc::new(LeaseCoordinator::new(store));
        let state = AppState {
            coordinator: Arc::clone(&coordinator),
            pool: "account_pool_v3".into(),
            started_at: Instant::now(),
            prometheus: test_prometheus_handle(),
        };
        let admin = AdminState::new(Arc::clone(&coordinator), Duration::from_secs(3600));
        (build_router(state, admin, 16), coordinator)
    }

    #[tokio::test]
    async fn health_endpoint_reports_connected_store() {
        let (app, _) = test_router(MemoryStore::new());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["store"], "connected");
        assert_eq!(json["pool"], "account_pool_v3");
        assert!(json["uptime_seconds"].as_u64().is_some());
    }

    #[tokio::test]
    async fn health_endpoint_degrades_without_store() {
        let (app, _) = test_router(RedisStore::new(RedisSettings {
            host: "127.0.0.1".into(),
            port: 1,
            timeout: Duration::from_millis(500),
            ..RedisSettings::default()
        }));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["store"], "unreachable");
    }

    #[tokio::test]
    async fn admin_errors_without_store_are_503() {
        let (app, _) = test_router(RedisStore::new(RedisSettings {
            host: "127.0.0.1".into(),
            port: 1,
            timeout: Duration::from_millis(500),
            ..RedisSettings::default()
        }));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/pools/account_pool_v3/acquire")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let (app, _) = test_router(MemoryStore::new());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn admin_routes_are_merged() {
        let (app, coordinator) = test_router(MemoryStore::new());
        coordinator
            .save("account_pool_v3", &[AccountSeed::new("a", "pw")])
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/admin/pools/account_pool_v3")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["available"], 1);
        assert_eq!(json["total"], 1);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let (app, _) = test_router(MemoryStore::new());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/messages")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
