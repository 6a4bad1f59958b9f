use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::push::{DisabledNotifier, FcmNotifier, PushNotifier, ServiceAccount};
use crate::registry::{ConnectionRegistry, RegistryStats};
use crate::router::{RoutingPolicy, SignalingRouter};
use crate::websocket::websocket_handler;

#[derive(Clone)]
pub struct AppState {
    pub router: SignalingRouter,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(router: SignalingRouter, metrics: Option<PrometheusHandle>) -> Self {
        Self { router, metrics }
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    routing_policy: RoutingPolicy,
    #[serde(flatten)]
    registry: RegistryStats,
}

/// HTTP routes plus the signaling socket (served on both `/ws` and `/`).
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(websocket_handler))
        .route("/", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub fn build_notifier(config: &Config) -> Result<Arc<dyn PushNotifier>> {
    let Some(path) = &config.fcm_service_account else {
        warn!("no FCM service account configured; push notifications disabled");
        return Ok(Arc::new(DisabledNotifier));
    };

    let account = ServiceAccount::from_file(path)
        .with_context(|| format!("failed to load service account {}", path.display()))?;
    let notifier = FcmNotifier::new(account, config.fcm.clone())
        .context("failed to initialise FCM notifier")?;
    Ok(Arc::new(notifier))
}

pub async fn run(config: Config, metrics: Option<PrometheusHandle>) -> Result<()> {
    let notifier = build_notifier(&config)?;
    let router = SignalingRouter::new(ConnectionRegistry::new(), config.routing_policy, notifier);
    let app = app(AppState::new(router, metrics));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        routing_policy = ?config.routing_policy,
        "beach-beacon listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatsResponse {
        routing_policy: state.router.policy(),
        registry: state.router.registry().stats(),
    })
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
