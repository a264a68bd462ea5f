pub mod aggregator;
pub mod brave;
pub mod config;
pub mod error;
pub mod routes;
pub mod types;

use std::sync::Arc;

use aggregator::RequestAggregator;
use brave::BraveClient;
use config::ProxyConfig;
use error::SearchError;

pub use routes::router;
pub use types::*;

/// Coalesces identical searches; values are the raw upstream JSON bodies.
pub type SearchAggregator = RequestAggregator<Arc<serde_json::Value>, SearchError>;

#[derive(Clone, Debug)]
pub struct AppState {
    pub brave: BraveClient,
    pub aggregator: SearchAggregator,
}

impl AppState {
    pub fn new(brave: BraveClient, aggregator: SearchAggregator) -> Self {
        Self { brave, aggregator }
    }

    pub fn from_config(config: &ProxyConfig) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        let brave = BraveClient::new(
            http_client,
            config.brave_api_base_url.clone(),
            config.brave_api_key.clone(),
            Arc::new(tokio::sync::Semaphore::new(config.outbound_concurrency)),
        );
        Ok(Self::new(
            brave,
            RequestAggregator::new(config.aggregator_window),
        ))
    }
}
