//! Engine context
//!
//! Owns every long-lived component and the tasks that drive them. Built
//! once at startup; the gateway holds it behind an `Arc` and calls the
//! control operations on it.
//!
//! ```text
//!   registry ──► reconciler ──► connection ──► dispatcher ──┬─► store (ticks)
//!                                                           ├─► cache ──► flusher ──► store
//!                                                           └─► broadcast
//!   registry ──► backfill scheduler ──► bar source ──► store (upsert)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use types::prelude::{DataKind, Exchange, Symbol, Timeframe};

use crate::adapters::{bundle_for, ExchangeBundle};
use crate::backfill::{
    BackfillReport, BackfillService, FileWatermarks, MemoryWatermarks, WatermarkStore,
};
use crate::broadcast::BroadcastGateway;
use crate::cache::CoalescingCache;
use crate::config::EngineConfig;
use crate::connection::{ConnectionHandle, ExchangeConnection};
use crate::dispatcher::Dispatcher;
use crate::error::{EngineError, FetchError};
use crate::flusher::{DropOnFailure, Flusher};
use crate::instruments::{InstrumentSync, SyncReport};
use crate::metrics::EngineMetrics;
use crate::reconciler::{Reconciler, SubscriptionDelta, SubscriptionTracker};
use crate::registry::SymbolRegistry;
use crate::store::MarketStore;
use crate::transport::Connector;

/// Timeout for exchange REST calls.
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Built but not yet spawned.
struct Pending {
    connections: Vec<ExchangeConnection>,
    flusher: Flusher,
}

struct Running {
    connections: Vec<JoinHandle<()>>,
    flusher: JoinHandle<()>,
    schedulers: Vec<JoinHandle<()>>,
}

pub struct MarketDataEngine {
    config: EngineConfig,
    store: Arc<dyn MarketStore>,
    registry: Arc<dyn SymbolRegistry>,
    broadcast: Arc<BroadcastGateway>,
    metrics: Arc<EngineMetrics>,
    caches: HashMap<Exchange, Arc<CoalescingCache>>,
    handles: Vec<ConnectionHandle>,
    backfill: Arc<BackfillService>,
    instruments: HashMap<Exchange, Arc<InstrumentSync>>,
    shutdown_tx: watch::Sender<bool>,
    /// Signalled only after every connection task has exited.
    flush_stop_tx: watch::Sender<bool>,
    pending: Mutex<Option<Pending>>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl MarketDataEngine {
    /// Build the engine for every enabled exchange in `config`.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn MarketStore>,
        registry: Arc<dyn SymbolRegistry>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(FetchError::from)?;
        let bundles = config
            .enabled_exchanges()
            .map(|exchange| bundle_for(exchange, config.backfill.page_limit, http.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::with_bundles(config, bundles, store, registry, connector)
    }

    /// Build the engine from prepared exchange bundles.
    pub fn with_bundles(
        config: EngineConfig,
        bundles: Vec<ExchangeBundle>,
        store: Arc<dyn MarketStore>,
        registry: Arc<dyn SymbolRegistry>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, EngineError> {
        let metrics = Arc::new(EngineMetrics::new());
        let broadcast = Arc::new(BroadcastGateway::new(config.broadcast_capacity));

        let watermarks: Arc<dyn WatermarkStore> = match &config.backfill.watermark_path {
            Some(path) => Arc::new(FileWatermarks::new(path.clone())),
            None => Arc::new(MemoryWatermarks),
        };
        let backfill = Arc::new(BackfillService::new(
            bundles.iter().map(|b| b.bars.clone()).collect(),
            store.clone(),
            watermarks,
            config.backfill.default_timeframe,
            metrics.clone(),
        )?);

        let mut caches = HashMap::new();
        let mut handles = Vec::new();
        let mut connections = Vec::new();
        let mut instruments = HashMap::new();

        for bundle in bundles {
            let exchange = bundle.adapter.exchange();
            let cache = Arc::new(CoalescingCache::new());
            let tracker = Arc::new(SubscriptionTracker::new());
            let reconciler = Arc::new(Reconciler::new(
                bundle.adapter.clone(),
                registry.clone(),
                tracker.clone(),
                metrics.clone(),
            ));
            let dispatcher = Arc::new(Dispatcher::new(
                bundle.adapter.clone(),
                store.clone(),
                cache.clone(),
                broadcast.clone(),
                tracker.clone(),
                bundle.depth_filter,
                metrics.clone(),
            ));
            let (connection, handle) = ExchangeConnection::new(
                bundle.adapter.clone(),
                connector.clone(),
                config.connection.clone(),
                dispatcher,
                tracker,
                reconciler,
                metrics.clone(),
            );

            caches.insert(exchange.clone(), cache);
            handles.push(handle);
            connections.push(connection);
            instruments.insert(
                exchange,
                Arc::new(InstrumentSync::new(bundle.instruments, store.clone(), metrics.clone())),
            );
        }

        let flusher = Flusher::new(
            caches.values().cloned().collect(),
            Arc::new(DropOnFailure::new(store.clone(), metrics.clone())),
            config.flush.interval,
        );
        let (shutdown_tx, _) = watch::channel(false);
        let (flush_stop_tx, _) = watch::channel(false);

        info!(exchanges = handles.len(), "market data engine built");
        Ok(Self {
            config,
            store,
            registry,
            broadcast,
            metrics,
            caches,
            handles,
            backfill,
            instruments,
            shutdown_tx,
            flush_stop_tx,
            pending: Mutex::new(Some(Pending {
                connections,
                flusher,
            })),
            running: tokio::sync::Mutex::new(None),
        })
    }

    /// Spawn connection tasks, the flusher and the schedulers.
    pub async fn start(&self) -> Result<(), EngineError> {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(EngineError::AlreadyStarted)?;

        let connections = pending
            .connections
            .into_iter()
            .map(|c| tokio::spawn(c.run(self.shutdown_tx.subscribe())))
            .collect();
        let flusher = tokio::spawn(pending.flusher.run(self.flush_stop_tx.subscribe()));

        let mut schedulers = vec![tokio::spawn(self.backfill.clone().run(
            self.registry.clone(),
            self.config.backfill.interval,
            self.shutdown_tx.subscribe(),
        ))];
        if self.config.instruments.enabled {
            for sync in self.instruments.values() {
                schedulers.push(tokio::spawn(sync.clone().run(
                    self.config.instruments.interval,
                    self.shutdown_tx.subscribe(),
                )));
            }
        }

        *self.running.lock().await = Some(Running {
            connections,
            flusher,
            schedulers,
        });
        info!("market data engine started");
        Ok(())
    }

    /// Stop every task: connections close their transports first, then the
    /// flusher drains one last time.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let running = self.running.lock().await.take().ok_or(EngineError::NotStarted)?;
        self.shutdown_tx.send_replace(true);

        for task in running.connections {
            if let Err(e) = task.await {
                error!(error = %e, "connection task panicked");
            }
        }
        // No dispatcher can touch a cache from here on.
        self.flush_stop_tx.send_replace(true);
        if let Err(e) = running.flusher.await {
            error!(error = %e, "flusher task panicked");
        }
        for task in running.schedulers {
            if let Err(e) = task.await {
                warn!(error = %e, "scheduler task ended abnormally");
            }
        }
        info!("market data engine stopped");
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn broadcast(&self) -> &Arc<BroadcastGateway> {
        &self.broadcast
    }

    pub fn store(&self) -> &Arc<dyn MarketStore> {
        &self.store
    }

    pub fn cache(&self, exchange: &Exchange) -> Option<&Arc<CoalescingCache>> {
        self.caches.get(exchange)
    }

    pub fn connections(&self) -> &[ConnectionHandle] {
        &self.handles
    }

    pub fn connection(&self, exchange: &Exchange) -> Result<&ConnectionHandle, EngineError> {
        self.handles
            .iter()
            .find(|h| h.exchange() == exchange)
            .ok_or_else(|| EngineError::UnknownExchange(exchange.to_string()))
    }

    pub async fn reconcile(
        &self,
        exchange: &Exchange,
        kind: DataKind,
    ) -> Result<SubscriptionDelta, EngineError> {
        Ok(self.connection(exchange)?.reconcile(kind).await?)
    }

    /// Run one backfill immediately, outside the schedule.
    pub async fn backfill_now(
        &self,
        exchange: &Exchange,
        symbol: &Symbol,
        timeframe: Option<Timeframe>,
        since: Option<i64>,
    ) -> Result<BackfillReport, EngineError> {
        let timeframe = timeframe.unwrap_or(self.config.backfill.default_timeframe);
        self.backfill.backfill(exchange, symbol, timeframe, since).await
    }

    pub async fn sync_instruments(&self, exchange: &Exchange) -> Result<SyncReport, EngineError> {
        let sync = self
            .instruments
            .get(exchange)
            .ok_or_else(|| EngineError::UnknownExchange(exchange.to_string()))?;
        Ok(sync.sync_all().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{OkxAdapter, OkxRest};
    use crate::connection::ConnectionState;
    use crate::dispatcher::DepthFilter;
    use crate::registry::InMemoryRegistry;
    use crate::store::InMemoryStore;
    use crate::transport::ChannelConnector;

    fn okx_bundle() -> ExchangeBundle {
        let rest = Arc::new(OkxRest::new(reqwest::Client::new(), "http://127.0.0.1:9", 100));
        ExchangeBundle {
            adapter: Arc::new(OkxAdapter::new("wss://okx.test/ws")),
            bars: rest.clone(),
            instruments: rest,
            depth_filter: DepthFilter::SubscribedOnly,
        }
    }

    fn engine() -> MarketDataEngine {
        let (connector, _remotes) = ChannelConnector::new();
        let config = EngineConfig {
            instruments: crate::config::InstrumentSyncConfig {
                enabled: false,
                ..Default::default()
            },
            ..EngineConfig::default()
        };
        MarketDataEngine::with_bundles(
            config,
            vec![okx_bundle()],
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryRegistry::new()),
            Arc::new(connector),
        )
        .unwrap()
    }

    #[test]
    fn test_new_builds_every_enabled_exchange() {
        let mut config = EngineConfig::default();
        config.exchanges[1].enabled = false;
        let (connector, _remotes) = ChannelConnector::new();
        let engine = MarketDataEngine::new(
            config,
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryRegistry::new()),
            Arc::new(connector),
        )
        .unwrap();

        assert_eq!(engine.connections().len(), 1);
        assert!(engine.cache(&Exchange::okx()).is_some());
        assert!(engine.cache(&Exchange::binance()).is_none());
    }

    #[tokio::test]
    async fn test_control_operations_reject_unknown_exchange() {
        let engine = engine();
        let kraken = Exchange::new("kraken");

        assert!(matches!(
            engine.reconcile(&kraken, DataKind::Depth).await,
            Err(EngineError::UnknownExchange(_))
        ));
        assert!(matches!(
            engine.sync_instruments(&kraken).await,
            Err(EngineError::UnknownExchange(_))
        ));
        assert!(matches!(
            engine
                .backfill_now(&kraken, &Symbol::new("X"), None, None)
                .await,
            Err(EngineError::UnknownExchange(_))
        ));
    }

    #[tokio::test]
    async fn test_reconcile_before_connect_reports_not_connected() {
        let engine = engine();
        let err = engine
            .reconcile(&Exchange::okx(), DataKind::Depth)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no live connection");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_and_shutdown_lifecycle() {
        let engine = engine();
        assert!(matches!(engine.shutdown().await, Err(EngineError::NotStarted)));

        engine.start().await.unwrap();
        assert!(matches!(engine.start().await, Err(EngineError::AlreadyStarted)));

        engine.shutdown().await.unwrap();
        assert_eq!(engine.connections()[0].state(), ConnectionState::Disconnected);
    }
}
