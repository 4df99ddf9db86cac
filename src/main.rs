//! camclip - Detection-Triggered Camera Clip Recorder
//!
//! Main entry point for the recorder service.

use camclip::{
    classifier::HttpClassifier,
    state::{AppConfig, AppState},
    video_encoder::FfmpegEncoder,
    web_api,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn shutdown_signal() {
    let terminate = async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camclip=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting camclip v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        recordings_dir = %config.recordings_dir.display(),
        classifier_url = %config.classifier_url,
        target_label = %config.target_label,
        detect_fps = config.detect_fps,
        padding_secs = config.record_padding_secs,
        retention_secs = config.retention_secs,
        idle_flush = config.idle_flush,
        "Configuration loaded"
    );

    tokio::fs::create_dir_all(&config.recordings_dir).await?;

    // Initialize components
    let classifier = Arc::new(HttpClassifier::new(
        config.classifier_url.clone(),
        Duration::from_secs(10),
    )?);
    match classifier.health_check().await {
        Ok(true) => tracing::info!("Classifier reachable"),
        Ok(false) => tracing::warn!("Classifier responded with an error status"),
        Err(e) => tracing::warn!(error = %e, "Classifier unreachable, detections will be skipped"),
    }

    let encoder = Arc::new(FfmpegEncoder::new(config.encoder_config()));
    match encoder.check().await {
        Ok(version) => tracing::info!(version = %version, "Encoder available"),
        Err(e) => tracing::warn!(error = %e, "Encoder unavailable, raw clips stay unencoded"),
    }

    let state = AppState::new(config.clone(), classifier, encoder);
    tracing::info!("Components initialized");

    // Register cameras from config
    for camera in config.cameras.clone() {
        let name = camera.name.clone();
        if let Err(e) = state.orchestrator.register(camera).await {
            tracing::error!(camera_id = %name, error = %e, "Failed to register camera");
            continue;
        }
        if let Err(e) = state.orchestrator.start(&name).await {
            tracing::error!(camera_id = %name, error = %e, "Failed to start camera");
        }
    }

    let app = web_api::create_router(state.clone())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.orchestrator.shutdown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}
