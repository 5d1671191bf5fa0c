mod cleanup;
mod config;
mod downloader;
mod error;
mod lister;
mod media;
mod provider;
mod routes;
mod transfer;

use std::time::Duration;

use tracing::{error, info};

use config::Settings;
use routes::AppState;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Setup logging
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env();

    if let Err(e) = std::fs::create_dir_all(&settings.temp_dir) {
        error!("Cannot create temp directory {:?}: {e}", settings.temp_dir);
        std::process::exit(1);
    }

    info!("Starting server on port {}", settings.port);
    info!("Backend: {:?}", settings.backend);
    info!("Piped API: {}", settings.piped_api);
    info!(
        "Work dirs: {:?} (prefix {})",
        settings.temp_dir, settings.temp_prefix
    );
    info!("Audio container rule: {:?}", settings.audio_rule);
    if settings.backend == config::BackendKind::Ytdlp {
        info!(
            "yt-dlp extraction timeout: {}s, cookies: {:?}",
            settings.ytdlp_timeout, settings.cookies_path
        );
    }

    // Shared HTTP client with connection pooling
    let mut client_builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(settings.connect_timeout))
        .pool_max_idle_per_host(20)
        .redirect(reqwest::redirect::Policy::limited(10));
    if settings.download_timeout > 0 {
        client_builder = client_builder.timeout(Duration::from_secs(settings.download_timeout));
    }
    let http_client = client_builder
        .build()
        .expect("Failed to create HTTP client");

    let provider = match provider::build_provider(&settings, http_client) {
        Ok(p) => p,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    if settings.cleanup_interval > 0 {
        cleanup::spawn_sweeper(
            settings.temp_dir.clone(),
            settings.temp_prefix.clone(),
            Duration::from_secs(settings.cleanup_interval),
            Duration::from_secs(settings.stale_max_age),
        );
    }

    let addr = format!("{}:{}", settings.bind_addr, settings.port);
    let backend = provider.name();
    let app = routes::create_router(AppState::new(settings, provider));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("udl-relay listening on {addr} (backend: {backend})");
    axum::serve(listener, app).await
}
