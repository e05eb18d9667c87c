//! Engine counters
//!
//! Failures in the engine never surface to a caller; they show up here and
//! in the logs. Counters are plain relaxed atomics, exported as a sorted
//! map for the control API.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct EngineMetrics {
    // Live feed
    pub ticks_ingested: AtomicU64,
    pub depth_ingested: AtomicU64,
    pub frames_discarded: AtomicU64,
    pub depth_filtered: AtomicU64,
    pub tick_write_failures: AtomicU64,

    // Depth persistence
    pub flush_batches: AtomicU64,
    pub flush_rows: AtomicU64,
    pub flush_failures: AtomicU64,

    // Connections
    pub reconnects: AtomicU64,
    pub reconcile_failures: AtomicU64,

    // Backfill
    pub bars_upserted: AtomicU64,
    pub backfill_failures: AtomicU64,

    // Instruments
    pub instruments_synced: AtomicU64,
    pub instrument_sync_failures: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Export metrics as a BTreeMap for Prometheus-style exposition.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let counters: [(&str, &AtomicU64); 14] = [
            ("ticks_ingested", &self.ticks_ingested),
            ("depth_ingested", &self.depth_ingested),
            ("frames_discarded", &self.frames_discarded),
            ("depth_filtered", &self.depth_filtered),
            ("tick_write_failures", &self.tick_write_failures),
            ("flush_batches", &self.flush_batches),
            ("flush_rows", &self.flush_rows),
            ("flush_failures", &self.flush_failures),
            ("reconnects", &self.reconnects),
            ("reconcile_failures", &self.reconcile_failures),
            ("bars_upserted", &self.bars_upserted),
            ("backfill_failures", &self.backfill_failures),
            ("instruments_synced", &self.instruments_synced),
            ("instrument_sync_failures", &self.instrument_sync_failures),
        ];
        counters
            .into_iter()
            .map(|(name, counter)| (name.to_string(), counter.load(Ordering::Relaxed)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = EngineMetrics::new();

        EngineMetrics::incr(&metrics.ticks_ingested);
        EngineMetrics::incr(&metrics.ticks_ingested);
        EngineMetrics::add(&metrics.flush_rows, 7);

        let exported = metrics.export();
        assert_eq!(exported["ticks_ingested"], 2);
        assert_eq!(exported["flush_rows"], 7);
        assert_eq!(exported["reconnects"], 0);
    }

    #[test]
    fn test_export_lists_every_counter() {
        let exported = EngineMetrics::new().export();
        assert_eq!(exported.len(), 14);
        assert!(exported.contains_key("backfill_failures"));
        assert!(exported.contains_key("depth_filtered"));
    }
}
