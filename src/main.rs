use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use guildcast::app::{build_router, AppState};
use guildcast::config::Config;

#[tokio::main]
async fn main() {
    // Load .env before anything else so GUILDCAST_LOG_LEVEL is available.
    let _ = dotenvy::dotenv();

    let log_level = std::env::var("GUILDCAST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    // Initialize tracing with configurable log level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .init();

    let config = Config::from_env();
    let bind_addr = config.bind_addr.clone();

    let state = Arc::new(AppState::new(config).expect("failed to initialize storage"));
    let app = build_router(state);

    info!("Guildcast signaling server listening on http://{bind_addr}");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
