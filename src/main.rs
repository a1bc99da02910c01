use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use scan_batch::{
    app_state::AppState,
    config::AppConfig,
    routes,
    services::{inference::HttpPredictionClient, orchestrator::Orchestrator, registry::BatchRegistry},
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing scan-batch server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe();

    // Initialize inference client
    tracing::info!(inference_url = %config.inference_url, "Initializing prediction client");
    let client = HttpPredictionClient::new(
        &config.inference_url,
        config.inference_api_token.clone(),
        config.call_timeout(),
    )
    .expect("Failed to initialize prediction client");

    let orchestrator = Orchestrator::new(Arc::new(client), config.retry_policy(), config.call_timeout())
        .with_max_in_flight(config.max_in_flight);

    let state = AppState::new(BatchRegistry::new(Arc::new(orchestrator)));
    let batches = Arc::clone(&state.batches);

    // Settled batches are kept for `BATCH_RETENTION_SECS`, then evicted.
    let sweeper = Arc::clone(&batches);
    let retention = config.batch_retention();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(retention.clamp(Duration::from_secs(1), SWEEP_INTERVAL));
        loop {
            tick.tick().await;
            sweeper.evict_settled(retention);
        }
    });

    let app = routes::router(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(1024 * 1024)); // 1 MB limit

    tracing::info!("Starting scan-batch on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // In-memory batches do not survive the process; report them as canceled.
    let canceled = batches.cancel_all();
    tracing::info!(canceled, "Shutdown complete");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
