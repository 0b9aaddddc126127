//! Flow media gateway
//!
//! Single-binary service that:
//! 1. Loads the credential store and rebuilds the concurrency budget
//! 2. Sweeps rate-limit bans on a fixed interval
//! 3. Wires the generation orchestrator to the backend client and media cache
//! 4. Serves `/health` and `/metrics`

mod config;
mod metrics;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use generation::{FileMediaCache, Orchestrator, OrchestratorSettings};
use metrics_exporter_prometheus::PrometheusHandle;
use pool::{CredentialPool, PoolSettings, SlotManager, SystemClock};
use store::Store;
use upstream::HttpUpstreamClient;

use crate::config::Config;

/// How long in-flight requests may drain after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Models probed for the per-kind availability shown on `/health`.
const IMAGE_PROBE_MODEL: &str = "gemini-2.5-flash-image-landscape";
const VIDEO_PROBE_MODEL: &str = "veo_3_1_t2v_fast_landscape";

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    started_at: Instant,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Outbound client shared by the backend calls and the media cache.
fn build_http_client(config: &Config) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(config.upstream_timeout());
    if let Some(proxy) = &config.upstream.proxy {
        let proxy = reqwest::Proxy::all(proxy)
            .with_context(|| format!("invalid upstream proxy {proxy}"))?;
        builder = builder.proxy(proxy);
    }
    builder.build().context("failed to build HTTP client")
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

    info!("starting flow-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

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
        listen_addr = %config.server.listen_addr,
        store = %config.store.path.display(),
        labs_base_url = %config.upstream.labs_base_url,
        api_base_url = %config.upstream.api_base_url,
        proxy = config.upstream.proxy.is_some(),
        cache = config.cache.enabled,
        "configuration loaded"
    );

    let store = Arc::new(
        Store::open(config.store.path.clone())
            .await
            .with_context(|| format!("failed to open store {}", config.store.path.display()))?,
    );

    let client = build_http_client(&config)?;
    let upstream = Arc::new(HttpUpstreamClient::new(
        client.clone(),
        config.upstream.labs_base_url.clone(),
        config.upstream.api_base_url.clone(),
    ));

    let pool = Arc::new(CredentialPool::new(
        Arc::clone(&store),
        upstream,
        Arc::new(SlotManager::new()),
        Arc::new(SystemClock),
        PoolSettings {
            error_ban_threshold: config.pool.error_ban_threshold,
            ..PoolSettings::default()
        },
    ));
    pool.initialize_slots().await;

    let unban_handle = pool::spawn_unban_task(Arc::clone(&pool), config.unban_interval());

    let cache = Arc::new(FileMediaCache::new(
        client,
        config.cache.dir.clone(),
        &config.cache.base_url,
        config.cache.enabled,
    ));
    let orchestrator = Arc::new(
        Orchestrator::new(
            pool,
            OrchestratorSettings {
                poll_interval: config.poll_interval(),
                max_poll_attempts: config.generation.max_poll_attempts,
            },
        )
        .with_cache(cache),
    );

    let app_state = AppState {
        orchestrator,
        started_at: Instant::now(),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

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

    unban_handle.abort();

    if let Err(e) = store.close().await {
        error!(error = %e, "failed to flush store");
    }

    info!("shutdown complete");
    Ok(())
}

/// Pool health plus per-kind availability.
/// Returns 200 while at least one credential is available, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();
    let mut body = state.orchestrator.pool().health().await;

    let image = state.orchestrator.check_availability(IMAGE_PROBE_MODEL).await;
    let video = state.orchestrator.check_availability(VIDEO_PROBE_MODEL).await;

    let status_code = if body["status"] == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    body["uptime_seconds"] = serde_json::json!(uptime);
    body["image_available"] = serde_json::json!(image.available);
    body["video_available"] = serde_json::json!(video.available);

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.orchestrator.pool().health().await;
    metrics::record_pool_health(&health);
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
