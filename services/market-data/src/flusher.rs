//! Depth flusher
//!
//! On a fixed interval, drains every coalescing cache and hands the batch
//! to a [`DepthSink`] in one call. The default sink drops a batch whose
//! write fails; substituting a durable sink needs no change here. On
//! shutdown the flusher performs one last drain before exiting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};
use types::prelude::DepthSnapshot;

use crate::cache::CoalescingCache;
use crate::metrics::EngineMetrics;
use crate::store::MarketStore;

/// Destination of drained depth batches.
#[async_trait]
pub trait DepthSink: Send + Sync {
    async fn persist(&self, batch: Vec<DepthSnapshot>);
}

/// Writes each batch once; a failed batch is logged, counted and dropped.
pub struct DropOnFailure {
    store: Arc<dyn MarketStore>,
    metrics: Arc<EngineMetrics>,
}

impl DropOnFailure {
    pub fn new(store: Arc<dyn MarketStore>, metrics: Arc<EngineMetrics>) -> Self {
        Self { store, metrics }
    }
}

#[async_trait]
impl DepthSink for DropOnFailure {
    async fn persist(&self, batch: Vec<DepthSnapshot>) {
        match self.store.insert_depth_batch(&batch).await {
            Ok(rows) => {
                EngineMetrics::incr(&self.metrics.flush_batches);
                EngineMetrics::add(&self.metrics.flush_rows, rows as u64);
                debug!(rows, "depth batch persisted");
            }
            Err(e) => {
                EngineMetrics::incr(&self.metrics.flush_failures);
                error!(rows = batch.len(), error = %e, "depth batch write failed; batch dropped");
            }
        }
    }
}

pub struct Flusher {
    caches: Vec<Arc<CoalescingCache>>,
    sink: Arc<dyn DepthSink>,
    interval: Duration,
}

impl Flusher {
    pub fn new(caches: Vec<Arc<CoalescingCache>>, sink: Arc<dyn DepthSink>, interval: Duration) -> Self {
        Self {
            caches,
            sink,
            interval,
        }
    }

    /// Drain every cache and persist the combined batch. Returns its size.
    pub async fn flush_once(&self) -> usize {
        let batch: Vec<DepthSnapshot> = self.caches.iter().flat_map(|c| c.drain()).collect();
        let rows = batch.len();
        if rows > 0 {
            self.sink.persist(batch).await;
        }
        rows
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            caches = self.caches.len(),
            "depth flusher started"
        );
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let rows = self.flush_once().await;
        info!(rows, "depth flusher stopped after final drain");
    }
}
