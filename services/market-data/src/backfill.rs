//! Historical bar backfill
//!
//! Fetches a page of bars newer than a watermark, upserts them by natural
//! key and advances the watermark to the newest bar written. Re-running a
//! covered range only refreshes OHLCV values.
//!
//! The watermark per (exchange, symbol, timeframe) lives behind
//! [`WatermarkStore`]. [`MemoryWatermarks`] forgets everything on restart;
//! [`FileWatermarks`] keeps a JSON file that is replaced atomically.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use types::prelude::{Bar, Exchange, Symbol, Timeframe};

use crate::error::{EngineError, FetchError, WatermarkError};
use crate::metrics::EngineMetrics;
use crate::registry::SymbolRegistry;
use crate::store::MarketStore;

/// Pairs of one cycle fetched at the same time.
const MAX_CONCURRENT_PAIRS: usize = 4;

/// Historical bar query endpoint of one exchange.
#[async_trait]
pub trait BarSource: Send + Sync {
    fn exchange(&self) -> Exchange;

    /// One page of bars strictly newer than `since` when given. Order is
    /// exchange-defined.
    async fn fetch_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        since: Option<i64>,
    ) -> Result<Vec<Bar>, FetchError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatermarkKey {
    pub exchange: Exchange,
    pub symbol: Symbol,
    pub timeframe: Timeframe,
}

impl WatermarkKey {
    pub fn new(exchange: Exchange, symbol: Symbol, timeframe: Timeframe) -> Self {
        Self {
            exchange,
            symbol,
            timeframe,
        }
    }
}

pub type Watermarks = HashMap<WatermarkKey, i64>;

pub trait WatermarkStore: Send + Sync {
    fn load(&self) -> Result<Watermarks, WatermarkError>;

    fn save(&self, marks: &Watermarks) -> Result<(), WatermarkError>;
}

/// Keeps nothing; every restart backfills from the exchange's default page.
#[derive(Debug, Default)]
pub struct MemoryWatermarks;

impl WatermarkStore for MemoryWatermarks {
    fn load(&self) -> Result<Watermarks, WatermarkError> {
        Ok(Watermarks::new())
    }

    fn save(&self, _marks: &Watermarks) -> Result<(), WatermarkError> {
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WatermarkEntry {
    #[serde(flatten)]
    key: WatermarkKey,
    timestamp: i64,
}

/// JSON file of watermark entries, rewritten through a sibling temp file.
/// Saves through one instance never overlap on the temp file.
#[derive(Debug)]
pub struct FileWatermarks {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileWatermarks {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl WatermarkStore for FileWatermarks {
    fn load(&self) -> Result<Watermarks, WatermarkError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Watermarks::new()),
            Err(e) => return Err(e.into()),
        };
        let entries: Vec<WatermarkEntry> = serde_json::from_slice(&raw)?;
        Ok(entries.into_iter().map(|e| (e.key, e.timestamp)).collect())
    }

    fn save(&self, marks: &Watermarks) -> Result<(), WatermarkError> {
        let mut entries: Vec<WatermarkEntry> = marks
            .iter()
            .map(|(key, ts)| WatermarkEntry {
                key: key.clone(),
                timestamp: *ts,
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        let body = serde_json::to_vec_pretty(&entries)?;

        let _writing = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.temp_path();
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Outcome of one backfill call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Watermark after the call.
    pub watermark: Option<i64>,
}

impl BackfillReport {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Outcome of one scheduled pass over every ohlc subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub pairs: usize,
    pub failed: usize,
    pub bars_written: usize,
}

pub struct BackfillService {
    sources: HashMap<Exchange, Arc<dyn BarSource>>,
    store: Arc<dyn MarketStore>,
    watermarks: Arc<dyn WatermarkStore>,
    marks: Mutex<Watermarks>,
    /// Held from snapshot to rename so a newer map is never overwritten
    /// by an older one.
    save_lock: tokio::sync::Mutex<()>,
    default_timeframe: Timeframe,
    metrics: Arc<EngineMetrics>,
}

impl BackfillService {
    /// Build the service, loading any persisted watermarks.
    pub fn new(
        sources: Vec<Arc<dyn BarSource>>,
        store: Arc<dyn MarketStore>,
        watermarks: Arc<dyn WatermarkStore>,
        default_timeframe: Timeframe,
        metrics: Arc<EngineMetrics>,
    ) -> Result<Self, WatermarkError> {
        let marks = watermarks.load()?;
        if !marks.is_empty() {
            info!(entries = marks.len(), "backfill watermarks restored");
        }
        Ok(Self {
            sources: sources.into_iter().map(|s| (s.exchange(), s)).collect(),
            store,
            watermarks,
            marks: Mutex::new(marks),
            save_lock: tokio::sync::Mutex::new(()),
            default_timeframe,
            metrics,
        })
    }

    pub fn watermark(&self, key: &WatermarkKey) -> Option<i64> {
        self.lock_marks().get(key).copied()
    }

    /// Fetch and upsert one (exchange, symbol, timeframe). An explicit
    /// `since` overrides the stored watermark.
    pub async fn backfill(
        &self,
        exchange: &Exchange,
        symbol: &Symbol,
        timeframe: Timeframe,
        since: Option<i64>,
    ) -> Result<BackfillReport, EngineError> {
        let source = self
            .sources
            .get(exchange)
            .ok_or_else(|| EngineError::UnknownExchange(exchange.to_string()))?;
        let key = WatermarkKey::new(exchange.clone(), symbol.clone(), timeframe);
        let since = since.or_else(|| self.watermark(&key));

        let mut bars = source.fetch_bars(symbol, timeframe, since).await?;
        let fetched = bars.len();
        if let Some(since) = since {
            bars.retain(|b| b.timestamp > since);
        }
        bars.sort_by_key(|b| b.timestamp);

        if bars.is_empty() {
            debug!(exchange = %exchange, symbol = %symbol, timeframe = %timeframe, fetched, "no new bars");
            return Ok(BackfillReport {
                fetched,
                watermark: self.watermark(&key),
                ..BackfillReport::default()
            });
        }

        let summary = self.store.upsert_bars(&bars).await?;
        EngineMetrics::add(&self.metrics.bars_upserted, summary.written() as u64);

        let newest = bars.iter().map(|b| b.timestamp).max();
        let watermark = match newest {
            Some(ts) => Some(self.advance(key, ts).await),
            None => self.watermark(&key),
        };

        info!(
            exchange = %exchange,
            symbol = %symbol,
            timeframe = %timeframe,
            inserted = summary.inserted,
            updated = summary.updated,
            watermark = ?watermark,
            "backfill applied"
        );
        Ok(BackfillReport {
            fetched,
            inserted: summary.inserted,
            updated: summary.updated,
            watermark,
        })
    }

    /// One pass over every ohlc subscription of every exchange. Each
    /// pair runs on its own task; a failing pair is logged and counted
    /// and the rest still run.
    pub async fn run_cycle(self: &Arc<Self>, registry: &dyn SymbolRegistry) -> CycleReport {
        let mut report = CycleReport::default();
        let mut exchanges: Vec<&Exchange> = self.sources.keys().collect();
        exchanges.sort();

        let permits = Arc::new(Semaphore::new(MAX_CONCURRENT_PAIRS));
        let mut tasks = JoinSet::new();
        for exchange in exchanges {
            let requests = match registry.ohlc_subscriptions(exchange).await {
                Ok(requests) => requests,
                Err(e) => {
                    EngineMetrics::incr(&self.metrics.backfill_failures);
                    warn!(exchange = %exchange, error = %e, "registry read failed; skipping exchange");
                    report.failed += 1;
                    continue;
                }
            };
            let pairs: BTreeSet<(Symbol, Timeframe)> = requests
                .into_iter()
                .map(|r| (r.symbol, r.timeframe.unwrap_or(self.default_timeframe)))
                .collect();

            for (symbol, timeframe) in pairs {
                report.pairs += 1;
                let service = Arc::clone(self);
                let permits = Arc::clone(&permits);
                let exchange = exchange.clone();
                tasks.spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    let result = service.backfill(&exchange, &symbol, timeframe, None).await;
                    if let Err(e) = &result {
                        EngineMetrics::incr(&service.metrics.backfill_failures);
                        warn!(
                            exchange = %exchange,
                            symbol = %symbol,
                            timeframe = %timeframe,
                            error = %e,
                            "backfill failed; continuing with next symbol"
                        );
                    }
                    result
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(r)) => report.bars_written += r.written(),
                Ok(Err(_)) => report.failed += 1,
                Err(e) => {
                    EngineMetrics::incr(&self.metrics.backfill_failures);
                    warn!(error = %e, "backfill task aborted");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Scheduler loop: one cycle immediately, then one per `period`.
    pub async fn run(
        self: Arc<Self>,
        registry: Arc<dyn SymbolRegistry>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(period_secs = period.as_secs(), "backfill scheduler started");
        let mut ticker = interval_at(Instant::now(), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_cycle(registry.as_ref()).await;
                    debug!(
                        pairs = report.pairs,
                        failed = report.failed,
                        bars = report.bars_written,
                        "backfill cycle complete"
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("backfill scheduler stopped");
    }

    /// Raise the watermark for `key` to at least `ts` and persist the map.
    async fn advance(&self, key: WatermarkKey, ts: i64) -> i64 {
        let value = {
            let mut marks = self.lock_marks();
            let slot = marks.entry(key).or_insert(ts);
            *slot = (*slot).max(ts);
            *slot
        };

        let _saving = self.save_lock.lock().await;
        let snapshot = self.lock_marks().clone();
        let watermarks = Arc::clone(&self.watermarks);
        match tokio::task::spawn_blocking(move || watermarks.save(&snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to persist backfill watermarks"),
            Err(e) => warn!(error = %e, "watermark save task aborted"),
        }
        value
    }

    fn lock_marks(&self) -> std::sync::MutexGuard<'_, Watermarks> {
        self.marks.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InMemoryRegistry, OhlcRequest};
    use crate::store::InMemoryStore;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use types::prelude::{BarKey, DataKind, InstrumentKind, Subscription};

    /// Serves a fixed set of bars, honoring `since` like the real endpoints.
    struct ScriptedSource {
        exchange: Exchange,
        bars: Mutex<Vec<Bar>>,
        fail_for: Option<Symbol>,
        calls: Mutex<Vec<(Symbol, Timeframe, Option<i64>)>>,
    }

    impl ScriptedSource {
        fn new(bars: Vec<Bar>) -> Self {
            Self {
                exchange: Exchange::okx(),
                bars: Mutex::new(bars),
                fail_for: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn set_bars(&self, bars: Vec<Bar>) {
            *self.bars.lock().unwrap() = bars;
        }

        fn calls(&self) -> Vec<(Symbol, Timeframe, Option<i64>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BarSource for ScriptedSource {
        fn exchange(&self) -> Exchange {
            self.exchange.clone()
        }

        async fn fetch_bars(
            &self,
            symbol: &Symbol,
            timeframe: Timeframe,
            since: Option<i64>,
        ) -> Result<Vec<Bar>, FetchError> {
            self.calls
                .lock()
                .unwrap()
                .push((symbol.clone(), timeframe, since));
            if self.fail_for.as_ref() == Some(symbol) {
                return Err(FetchError::Status {
                    status: 500,
                    url: "scripted".into(),
                });
            }
            // Newest first, like OKX.
            let mut bars: Vec<Bar> = self
                .bars
                .lock()
                .unwrap()
                .iter()
                .filter(|b| &b.symbol == symbol && b.timeframe == timeframe)
                .cloned()
                .collect();
            bars.sort_by_key(|b| std::cmp::Reverse(b.timestamp));
            Ok(bars)
        }
    }

    fn bar(symbol: &str, ts: i64, close: i64) -> Bar {
        Bar {
            symbol: Symbol::new(symbol),
            timeframe: Timeframe::H1,
            timestamp: ts,
            exchange: Exchange::okx(),
            open: Decimal::from(close),
            high: Decimal::from(close),
            low: Decimal::from(close),
            close: Decimal::from(close),
            volume: Decimal::ONE,
            created_at: Utc::now(),
        }
    }

    const HOUR: i64 = 3_600_000;

    fn service(
        source: Arc<ScriptedSource>,
        store: Arc<InMemoryStore>,
        watermarks: Arc<dyn WatermarkStore>,
    ) -> BackfillService {
        BackfillService::new(
            vec![source],
            store,
            watermarks,
            Timeframe::H1,
            Arc::new(EngineMetrics::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_backfill_inserts_and_advances_watermark() {
        let source = Arc::new(ScriptedSource::new(vec![
            bar("BTC-USDT", HOUR, 100),
            bar("BTC-USDT", 2 * HOUR, 101),
        ]));
        let store = Arc::new(InMemoryStore::new());
        let svc = service(source.clone(), store.clone(), Arc::new(MemoryWatermarks));
        let symbol = Symbol::new("BTC-USDT");

        let report = svc
            .backfill(&Exchange::okx(), &symbol, Timeframe::H1, None)
            .await
            .unwrap();

        assert_eq!(report.inserted, 2);
        assert_eq!(report.watermark, Some(2 * HOUR));
        assert_eq!(store.bars().len(), 2);

        // Next call starts from the watermark.
        svc.backfill(&Exchange::okx(), &symbol, Timeframe::H1, None)
            .await
            .unwrap();
        assert_eq!(source.calls()[1].2, Some(2 * HOUR));
    }

    #[tokio::test]
    async fn test_rerun_with_explicit_since_refreshes_without_duplicates() {
        let source = Arc::new(ScriptedSource::new(vec![
            bar("BTC-USDT", HOUR, 100),
            bar("BTC-USDT", 2 * HOUR, 101),
        ]));
        let store = Arc::new(InMemoryStore::new());
        let svc = service(source.clone(), store.clone(), Arc::new(MemoryWatermarks));
        let symbol = Symbol::new("BTC-USDT");

        svc.backfill(&Exchange::okx(), &symbol, Timeframe::H1, Some(0))
            .await
            .unwrap();
        source.set_bars(vec![
            bar("BTC-USDT", HOUR, 100),
            bar("BTC-USDT", 2 * HOUR, 105),
        ]);
        let report = svc
            .backfill(&Exchange::okx(), &symbol, Timeframe::H1, Some(0))
            .await
            .unwrap();

        assert_eq!(report.inserted, 0);
        assert_eq!(report.updated, 2);
        assert_eq!(store.bars().len(), 2);
        let key = BarKey {
            symbol,
            timeframe: Timeframe::H1,
            timestamp: 2 * HOUR,
            exchange: Exchange::okx(),
        };
        let refreshed = store.find_bar(&key).await.unwrap().unwrap();
        assert_eq!(refreshed.close, Decimal::from(105));
    }

    #[tokio::test]
    async fn test_since_is_exclusive() {
        let source = Arc::new(ScriptedSource::new(vec![
            bar("BTC-USDT", HOUR, 100),
            bar("BTC-USDT", 2 * HOUR, 101),
        ]));
        let store = Arc::new(InMemoryStore::new());
        let svc = service(source, store.clone(), Arc::new(MemoryWatermarks));

        let report = svc
            .backfill(&Exchange::okx(), &Symbol::new("BTC-USDT"), Timeframe::H1, Some(HOUR))
            .await
            .unwrap();

        assert_eq!(report.fetched, 2);
        assert_eq!(report.inserted, 1);
        assert_eq!(store.bars()[0].timestamp, 2 * HOUR);
    }

    #[tokio::test]
    async fn test_watermark_never_moves_backwards() {
        let source = Arc::new(ScriptedSource::new(vec![bar("BTC-USDT", 5 * HOUR, 100)]));
        let store = Arc::new(InMemoryStore::new());
        let svc = service(source.clone(), store, Arc::new(MemoryWatermarks));
        let symbol = Symbol::new("BTC-USDT");

        svc.backfill(&Exchange::okx(), &symbol, Timeframe::H1, None)
            .await
            .unwrap();
        source.set_bars(vec![bar("BTC-USDT", 2 * HOUR, 100)]);
        let report = svc
            .backfill(&Exchange::okx(), &symbol, Timeframe::H1, Some(0))
            .await
            .unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.watermark, Some(5 * HOUR));
    }

    #[tokio::test]
    async fn test_unknown_exchange_is_rejected() {
        let source = Arc::new(ScriptedSource::new(vec![]));
        let svc = service(source, Arc::new(InMemoryStore::new()), Arc::new(MemoryWatermarks));
        let err = svc
            .backfill(&Exchange::binance(), &Symbol::new("BTCUSDT"), Timeframe::H1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownExchange(_)));
    }

    #[tokio::test]
    async fn test_cycle_dedupes_and_continues_past_failures() {
        let mut source = ScriptedSource::new(vec![
            bar("ETH-USDT", HOUR, 10),
            bar("SOL-USDT", HOUR, 20),
        ]);
        source.fail_for = Some(Symbol::new("ETH-USDT"));
        let source = Arc::new(source);
        let store = Arc::new(InMemoryStore::new());
        let svc = Arc::new(service(source.clone(), store.clone(), Arc::new(MemoryWatermarks)));

        let registry = InMemoryRegistry::new();
        for (user, symbol) in [("alice", "ETH-USDT"), ("bob", "SOL-USDT"), ("carol", "SOL-USDT")] {
            let sub = Subscription::new(
                user,
                Symbol::new(symbol),
                DataKind::Ohlc,
                InstrumentKind::Spot,
                Some(Timeframe::H1),
                Some(Exchange::okx()),
            )
            .unwrap();
            registry.add(sub);
        }

        let report = svc.run_cycle(&registry).await;

        assert_eq!(report.pairs, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.bars_written, 1);
        assert_eq!(store.bars().len(), 1);
        assert_eq!(source.calls().len(), 2);
    }

    struct FixedRegistry(Vec<OhlcRequest>);

    #[async_trait]
    impl SymbolRegistry for FixedRegistry {
        async fn active_symbols(
            &self,
            _exchange: &Exchange,
            _kind: DataKind,
        ) -> Result<std::collections::BTreeSet<Symbol>, crate::error::StoreError> {
            Ok(Default::default())
        }

        async fn ohlc_subscriptions(
            &self,
            _exchange: &Exchange,
        ) -> Result<Vec<OhlcRequest>, crate::error::StoreError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_cycle_applies_default_timeframe() {
        let source = Arc::new(ScriptedSource::new(vec![bar("BTC-USDT", HOUR, 1)]));
        let svc = Arc::new(service(
            source.clone(),
            Arc::new(InMemoryStore::new()),
            Arc::new(MemoryWatermarks),
        ));
        let registry = FixedRegistry(vec![
            OhlcRequest {
                symbol: Symbol::new("BTC-USDT"),
                timeframe: None,
            },
            OhlcRequest {
                symbol: Symbol::new("BTC-USDT"),
                timeframe: Some(Timeframe::H1),
            },
        ]);

        let report = svc.run_cycle(&registry).await;

        assert_eq!(report.pairs, 1);
        assert_eq!(source.calls(), vec![(Symbol::new("BTC-USDT"), Timeframe::H1, None)]);
    }

    #[test]
    fn test_file_watermarks_round_trip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWatermarks::new(dir.path().join("nested").join("marks.json"));
        assert!(store.load().unwrap().is_empty());

        let mut marks = Watermarks::new();
        marks.insert(
            WatermarkKey::new(Exchange::okx(), Symbol::new("BTC-USDT"), Timeframe::H1),
            42,
        );
        marks.insert(
            WatermarkKey::new(Exchange::binance(), Symbol::new("BTCUSDT"), Timeframe::D1),
            7,
        );
        store.save(&marks).unwrap();

        assert_eq!(store.load().unwrap(), marks);
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_corrupt_watermark_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marks.json");
        fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            FileWatermarks::new(&path).load(),
            Err(WatermarkError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_restart_resumes_from_persisted_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let file: Arc<dyn WatermarkStore> = Arc::new(FileWatermarks::new(dir.path().join("w.json")));
        let source = Arc::new(ScriptedSource::new(vec![bar("BTC-USDT", 3 * HOUR, 1)]));
        let symbol = Symbol::new("BTC-USDT");

        let first = service(source.clone(), Arc::new(InMemoryStore::new()), file.clone());
        first
            .backfill(&Exchange::okx(), &symbol, Timeframe::H1, None)
            .await
            .unwrap();
        drop(first);

        let second = service(source.clone(), Arc::new(InMemoryStore::new()), file);
        let key = WatermarkKey::new(Exchange::okx(), symbol.clone(), Timeframe::H1);
        assert_eq!(second.watermark(&key), Some(3 * HOUR));
        second
            .backfill(&Exchange::okx(), &symbol, Timeframe::H1, None)
            .await
            .unwrap();
        assert_eq!(source.calls().last().unwrap().2, Some(3 * HOUR));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_advances_persist_the_maximum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marks.json");
        let file: Arc<dyn WatermarkStore> = Arc::new(FileWatermarks::new(&path));
        let svc = Arc::new(service(
            Arc::new(ScriptedSource::new(vec![])),
            Arc::new(InMemoryStore::new()),
            file,
        ));
        let symbols = ["BTC-USDT", "ETH-USDT", "SOL-USDT"];

        let mut tasks = JoinSet::new();
        for i in 0..60i64 {
            let svc = svc.clone();
            let symbol = symbols[i as usize % symbols.len()];
            tasks.spawn(async move {
                let key = WatermarkKey::new(Exchange::okx(), Symbol::new(symbol), Timeframe::H1);
                svc.advance(key, i * HOUR).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        let reloaded = FileWatermarks::new(&path).load().unwrap();
        assert_eq!(reloaded.len(), symbols.len());
        for (offset, symbol) in symbols.iter().enumerate() {
            let key = WatermarkKey::new(Exchange::okx(), Symbol::new(*symbol), Timeframe::H1);
            let newest = (57 + offset as i64) * HOUR;
            assert_eq!(reloaded[&key], newest, "{symbol}");
            assert_eq!(svc.watermark(&key), Some(newest));
        }
        assert!(!path.with_file_name("marks.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_cycle_runs_pairs_on_separate_tasks() {
        let source = Arc::new(ScriptedSource::new(
            (0..10)
                .map(|i| bar(&format!("SYM{i}-USDT"), HOUR, i))
                .collect(),
        ));
        let store = Arc::new(InMemoryStore::new());
        let svc = Arc::new(service(source.clone(), store.clone(), Arc::new(MemoryWatermarks)));
        let registry = FixedRegistry(
            (0..10)
                .map(|i| OhlcRequest {
                    symbol: Symbol::new(format!("SYM{i}-USDT")),
                    timeframe: Some(Timeframe::H1),
                })
                .collect(),
        );

        let report = svc.run_cycle(&registry).await;

        assert_eq!(report.pairs, 10);
        assert_eq!(report.failed, 0);
        assert_eq!(report.bars_written, 10);
        assert_eq!(store.bars().len(), 10);
        assert_eq!(source.calls().len(), 10);
    }
}
