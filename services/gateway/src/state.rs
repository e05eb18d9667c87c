use market_data::MarketDataEngine;
use market_data::registry::InMemoryRegistry;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MarketDataEngine>,
    /// Subscriptions recorded through the control API
    pub registry: Arc<InMemoryRegistry>,
}

impl AppState {
    pub fn new(engine: Arc<MarketDataEngine>, registry: Arc<InMemoryRegistry>) -> Self {
        Self { engine, registry }
    }
}
