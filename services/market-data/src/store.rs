//! Store boundary
//!
//! Four write shapes: single-row ticks, batched depth snapshots, bar upsert
//! by natural key, and wholesale instrument replacement per
//! (exchange, kind). [`InMemoryStore`] keeps everything in process and can
//! be told to fail each write shape, which the failure-path tests rely on.
//! Ticks and depth rows are ring buffers: [`InMemoryStore::with_retention`]
//! caps them, [`InMemoryStore::new`] does not.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use types::prelude::{Bar, BarKey, DepthSnapshot, Exchange, Instrument, InstrumentKind, Tick};

use crate::config::StoreConfig;
use crate::error::StoreError;

/// Outcome of a bar upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
}

impl UpsertSummary {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

#[async_trait]
pub trait MarketStore: Send + Sync {
    async fn insert_tick(&self, tick: &Tick) -> Result<(), StoreError>;

    /// Write a drained depth batch in one call; returns rows written.
    async fn insert_depth_batch(&self, batch: &[DepthSnapshot]) -> Result<usize, StoreError>;

    /// Insert or refresh bars by (symbol, timeframe, timestamp, exchange).
    async fn upsert_bars(&self, bars: &[Bar]) -> Result<UpsertSummary, StoreError>;

    async fn find_bar(&self, key: &BarKey) -> Result<Option<Bar>, StoreError>;

    /// Replace every instrument of `kind` on `exchange` with `instruments`.
    async fn replace_instruments(
        &self,
        exchange: &Exchange,
        kind: InstrumentKind,
        instruments: Vec<Instrument>,
    ) -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    ticks: VecDeque<Tick>,
    depth: VecDeque<DepthSnapshot>,
    bars: BTreeMap<BarKey, Bar>,
    instruments: HashMap<(Exchange, InstrumentKind), Vec<Instrument>>,
}

#[derive(Debug)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    tick_retention: usize,
    depth_retention: usize,
    fail_ticks: AtomicBool,
    fail_depth: AtomicBool,
    fail_bars: AtomicBool,
}

impl InMemoryStore {
    /// Unbounded; every row is kept.
    pub fn new() -> Self {
        Self::bounded(usize::MAX, usize::MAX)
    }

    pub fn with_retention(config: &StoreConfig) -> Self {
        Self::bounded(config.tick_retention, config.depth_retention)
    }

    fn bounded(tick_retention: usize, depth_retention: usize) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            tick_retention: tick_retention.max(1),
            depth_retention: depth_retention.max(1),
            fail_ticks: AtomicBool::new(false),
            fail_depth: AtomicBool::new(false),
            fail_bars: AtomicBool::new(false),
        }
    }

    pub fn fail_ticks(&self, fail: bool) {
        self.fail_ticks.store(fail, Ordering::SeqCst);
    }

    pub fn fail_depth(&self, fail: bool) {
        self.fail_depth.store(fail, Ordering::SeqCst);
    }

    pub fn fail_bars(&self, fail: bool) {
        self.fail_bars.store(fail, Ordering::SeqCst);
    }

    pub fn ticks(&self) -> Vec<Tick> {
        self.lock().ticks.iter().cloned().collect()
    }

    pub fn depth_rows(&self) -> Vec<DepthSnapshot> {
        self.lock().depth.iter().cloned().collect()
    }

    pub fn bars(&self) -> Vec<Bar> {
        self.lock().bars.values().cloned().collect()
    }

    pub fn instruments(&self, exchange: &Exchange, kind: InstrumentKind) -> Vec<Instrument> {
        self.lock()
            .instruments
            .get(&(exchange.clone(), kind))
            .cloned()
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(flag: &AtomicBool, what: &str) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable(format!("{what} writes disabled")))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketStore for InMemoryStore {
    async fn insert_tick(&self, tick: &Tick) -> Result<(), StoreError> {
        Self::check(&self.fail_ticks, "tick")?;
        let mut tables = self.lock();
        if tables.ticks.len() == self.tick_retention {
            tables.ticks.pop_front();
        }
        tables.ticks.push_back(tick.clone());
        Ok(())
    }

    async fn insert_depth_batch(&self, batch: &[DepthSnapshot]) -> Result<usize, StoreError> {
        Self::check(&self.fail_depth, "depth")?;
        let mut tables = self.lock();
        tables.depth.extend(batch.iter().cloned());
        let excess = tables.depth.len().saturating_sub(self.depth_retention);
        tables.depth.drain(..excess);
        Ok(batch.len())
    }

    async fn upsert_bars(&self, bars: &[Bar]) -> Result<UpsertSummary, StoreError> {
        Self::check(&self.fail_bars, "bar")?;
        let mut tables = self.lock();
        let mut summary = UpsertSummary::default();
        for bar in bars {
            match tables.bars.entry(bar.key()) {
                Entry::Occupied(mut existing) => {
                    existing.get_mut().refresh_from(bar);
                    summary.updated += 1;
                }
                Entry::Vacant(slot) => {
                    slot.insert(bar.clone());
                    summary.inserted += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn find_bar(&self, key: &BarKey) -> Result<Option<Bar>, StoreError> {
        Ok(self.lock().bars.get(key).cloned())
    }

    async fn replace_instruments(
        &self,
        exchange: &Exchange,
        kind: InstrumentKind,
        instruments: Vec<Instrument>,
    ) -> Result<usize, StoreError> {
        let count = instruments.len();
        self.lock()
            .instruments
            .insert((exchange.clone(), kind), instruments);
        Ok(count)
    }
}
