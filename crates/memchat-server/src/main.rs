// ============================================================================
// memchat - Memory-augmented chat server
// ============================================================================
// Reads configuration from the environment (and .env), starts the dispatcher
// workers and serves the HTTP API until Ctrl-C.
// ============================================================================

use anyhow::{Context, Result};
use tracing::info;

use memchat_core::AppConfig;
use memchat_server::{bootstrap, router};

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("memchat_server=debug".parse()?)
                .add_directive("memchat_core=debug".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    info!("Starting memchat server");

    let config = AppConfig::from_env().context("Invalid configuration")?;
    let services = bootstrap(&config).await.context("Failed to start services")?;

    let app = router(services.state.clone(), &config.cors_origin);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down; waiting for pending memory writes");
    services.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
