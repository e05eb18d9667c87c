//! Instrument metadata sync
//!
//! Replaces the stored instrument list per (exchange, kind) with what the
//! exchange currently lists. Runs at startup and then on a fixed period.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};
use types::prelude::{Exchange, Instrument, InstrumentKind};

use crate::error::FetchError;
use crate::metrics::EngineMetrics;
use crate::store::MarketStore;

#[async_trait]
pub trait InstrumentSource: Send + Sync {
    fn exchange(&self) -> Exchange;

    /// Instrument kinds this source can list.
    fn kinds(&self) -> Vec<InstrumentKind>;

    async fn fetch_instruments(&self, kind: InstrumentKind) -> Result<Vec<Instrument>, FetchError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub exchange: String,
    pub synced: Vec<(InstrumentKind, usize)>,
    pub failed: Vec<InstrumentKind>,
}

impl SyncReport {
    pub fn total(&self) -> usize {
        self.synced.iter().map(|(_, n)| n).sum()
    }
}

pub struct InstrumentSync {
    source: Arc<dyn InstrumentSource>,
    store: Arc<dyn MarketStore>,
    metrics: Arc<EngineMetrics>,
}

impl InstrumentSync {
    pub fn new(
        source: Arc<dyn InstrumentSource>,
        store: Arc<dyn MarketStore>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            source,
            store,
            metrics,
        }
    }

    pub fn exchange(&self) -> Exchange {
        self.source.exchange()
    }

    /// Sync every kind the source lists. A failing kind is logged and the
    /// next one still runs.
    pub async fn sync_all(&self) -> SyncReport {
        let exchange = self.source.exchange();
        let mut report = SyncReport {
            exchange: exchange.to_string(),
            ..SyncReport::default()
        };

        for kind in self.source.kinds() {
            let result = match self.source.fetch_instruments(kind).await {
                Ok(list) => self
                    .store
                    .replace_instruments(&exchange, kind, list)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match result {
                Ok(count) => {
                    EngineMetrics::add(&self.metrics.instruments_synced, count as u64);
                    info!(exchange = %exchange, kind = %kind, count, "instruments synced");
                    report.synced.push((kind, count));
                }
                Err(error) => {
                    EngineMetrics::incr(&self.metrics.instrument_sync_failures);
                    warn!(exchange = %exchange, kind = %kind, error = %error, "instrument sync failed");
                    report.failed.push(kind);
                }
            }
        }
        report
    }

    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval_at(Instant::now(), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sync_all().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(exchange = %self.exchange(), "instrument scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use types::prelude::{InstrumentState, Symbol};

    struct StaticSource;

    fn instrument(id: &str, kind: InstrumentKind) -> Instrument {
        Instrument {
            exchange: Exchange::okx(),
            instrument_id: Symbol::new(id),
            kind,
            base_currency: "BTC".into(),
            quote_currency: "USDT".into(),
            settle_currency: None,
            contract_value: None,
            contract_multiplier: None,
            contract_value_currency: None,
            state: InstrumentState::Active,
        }
    }

    #[async_trait]
    impl InstrumentSource for StaticSource {
        fn exchange(&self) -> Exchange {
            Exchange::okx()
        }

        fn kinds(&self) -> Vec<InstrumentKind> {
            vec![InstrumentKind::Spot, InstrumentKind::Swap, InstrumentKind::Futures]
        }

        async fn fetch_instruments(&self, kind: InstrumentKind) -> Result<Vec<Instrument>, FetchError> {
            match kind {
                InstrumentKind::Spot => Ok(vec![
                    instrument("BTC-USDT", kind),
                    instrument("ETH-USDT", kind),
                ]),
                InstrumentKind::Swap => Err(FetchError::Status {
                    status: 503,
                    url: "static".into(),
                }),
                _ => Ok(vec![instrument("BTC-USD-250328", kind)]),
            }
        }
    }

    #[tokio::test]
    async fn test_failed_kind_does_not_stop_the_rest() {
        let store = Arc::new(InMemoryStore::new());
        let metrics = Arc::new(EngineMetrics::new());
        let sync = InstrumentSync::new(Arc::new(StaticSource), store.clone(), metrics.clone());

        let report = sync.sync_all().await;

        assert_eq!(report.failed, vec![InstrumentKind::Swap]);
        assert_eq!(report.total(), 3);
        assert_eq!(store.instruments(&Exchange::okx(), InstrumentKind::Spot).len(), 2);
        assert_eq!(store.instruments(&Exchange::okx(), InstrumentKind::Futures).len(), 1);
        assert_eq!(metrics.export()["instrument_sync_failures"], 1);
    }

    #[tokio::test]
    async fn test_sync_replaces_previous_listing() {
        let store = Arc::new(InMemoryStore::new());
        store
            .replace_instruments(
                &Exchange::okx(),
                InstrumentKind::Spot,
                vec![instrument("DELISTED-USDT", InstrumentKind::Spot)],
            )
            .await
            .unwrap();
        let sync = InstrumentSync::new(Arc::new(StaticSource), store.clone(), Arc::new(EngineMetrics::new()));

        sync.sync_all().await;

        let spot = store.instruments(&Exchange::okx(), InstrumentKind::Spot);
        assert!(spot.iter().all(|i| i.instrument_id.as_str() != "DELISTED-USDT"));
        assert_eq!(spot.len(), 2);
    }
}
