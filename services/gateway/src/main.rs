mod error;
mod handlers;
mod models;
mod router;
mod state;

use market_data::MarketDataEngine;
use market_data::config::EngineConfig;
use market_data::registry::InMemoryRegistry;
use market_data::store::InMemoryStore;
use market_data::transport::WsConnector;
use router::create_router;
use state::AppState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = EngineConfig::from_env()?;
    tracing::info!(
        version = market_data::SERVICE_VERSION,
        exchanges = config.enabled_exchanges().count(),
        "Starting market data gateway"
    );

    let registry = Arc::new(InMemoryRegistry::new());
    let engine = Arc::new(MarketDataEngine::new(
        config.clone(),
        Arc::new(InMemoryStore::with_retention(&config.store)),
        registry.clone(),
        Arc::new(WsConnector),
    )?);
    engine.start().await?;

    let app = create_router(AppState::new(engine.clone(), registry));
    let listener = TcpListener::bind(config.listen_addr).await?;
    tracing::info!("Listening on {}", config.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Draining market data engine");
    engine.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
