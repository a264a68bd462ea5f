use std::sync::Arc;
use tracing::info;

use search_proxy::{config::ProxyConfig, router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ProxyConfig::from_env()?;

    info!("Starting search proxy");
    info!("Brave API base URL: {}", config.brave_api_base_url);
    info!("Aggregator window: {:?}", config.aggregator_window);
    if config.brave_api_key.is_none() {
        tracing::warn!("BRAVE_API_KEY is not set; search requests will fail");
    }

    let state = Arc::new(AppState::from_config(&config)?);

    if let Some(every) = config.aggregator_sweep_interval {
        state.aggregator.spawn_sweeper(every);
    }

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr()).await?;
    info!("Search proxy listening on http://{}", config.listen_addr());

    axum::serve(listener, app).await?;

    Ok(())
}
