//! Inbound message dispatch
//!
//! Runs on the connection's read loop, one frame at a time in arrival
//! order. A frame that fails to parse is logged, counted and dropped; it
//! never reaches the connection as an error.
//!
//! - Tick path: write the tick to the store, then broadcast it. No
//!   buffering. A failed write is logged and the broadcast still happens.
//! - Depth path: optionally filter to tracked symbols, overwrite the
//!   symbol's slot in the coalescing cache, broadcast immediately.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use types::prelude::{DataKind, DepthSnapshot, Tick};

use crate::adapters::ExchangeAdapter;
use crate::broadcast::{BroadcastGateway, UpdateRecord};
use crate::cache::CoalescingCache;
use crate::metrics::EngineMetrics;
use crate::reconciler::SubscriptionTracker;
use crate::store::MarketStore;

/// Longest frame excerpt included in a discard log line.
const LOG_EXCERPT: usize = 256;

/// An inbound frame after venue-specific parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedEvent {
    Tick(Tick),
    Depth(DepthSnapshot),
}

/// Which depth frames reach the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthFilter {
    /// Only symbols in the connection's tracked depth set; stale frames for
    /// a just-unsubscribed symbol are dropped.
    SubscribedOnly,
    AcceptAll,
}

pub struct Dispatcher {
    adapter: Arc<dyn ExchangeAdapter>,
    store: Arc<dyn MarketStore>,
    cache: Arc<CoalescingCache>,
    broadcast: Arc<BroadcastGateway>,
    tracker: Arc<SubscriptionTracker>,
    filter: DepthFilter,
    metrics: Arc<EngineMetrics>,
}

impl Dispatcher {
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        store: Arc<dyn MarketStore>,
        cache: Arc<CoalescingCache>,
        broadcast: Arc<BroadcastGateway>,
        tracker: Arc<SubscriptionTracker>,
        filter: DepthFilter,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            adapter,
            store,
            cache,
            broadcast,
            tracker,
            filter,
            metrics,
        }
    }

    /// Handle one raw inbound frame. Returns the number of events accepted.
    pub async fn on_message(&self, raw: &str) -> usize {
        let events = match self.adapter.parse(raw) {
            Ok(events) => events,
            Err(e) => {
                EngineMetrics::incr(&self.metrics.frames_discarded);
                warn!(
                    exchange = %self.adapter.exchange(),
                    error = %e,
                    frame = excerpt(raw),
                    "discarding unparseable frame"
                );
                return 0;
            }
        };

        let mut accepted = 0;
        for event in events {
            let ok = match event {
                NormalizedEvent::Tick(tick) => {
                    self.on_tick(tick).await;
                    true
                }
                NormalizedEvent::Depth(snapshot) => self.on_depth(snapshot),
            };
            if ok {
                accepted += 1;
            }
        }
        accepted
    }

    async fn on_tick(&self, tick: Tick) {
        if let Err(e) = self.store.insert_tick(&tick).await {
            EngineMetrics::incr(&self.metrics.tick_write_failures);
            warn!(
                exchange = %tick.exchange,
                symbol = %tick.symbol,
                error = %e,
                "tick write failed; tick not persisted"
            );
        }
        EngineMetrics::incr(&self.metrics.ticks_ingested);
        let reached = self.broadcast.publish(UpdateRecord::tick(&tick));
        trace!(symbol = %tick.symbol, price = %tick.price, reached, "tick dispatched");
    }

    fn on_depth(&self, snapshot: DepthSnapshot) -> bool {
        if self.filter == DepthFilter::SubscribedOnly
            && !self.tracker.is_subscribed(DataKind::Depth, &snapshot.symbol)
        {
            EngineMetrics::incr(&self.metrics.depth_filtered);
            debug!(
                exchange = %snapshot.exchange,
                symbol = %snapshot.symbol,
                "depth for untracked symbol dropped"
            );
            return false;
        }

        let record = UpdateRecord::depth(&snapshot);
        self.cache.insert(snapshot);
        EngineMetrics::incr(&self.metrics.depth_ingested);
        self.broadcast.publish(record);
        true
    }
}

fn excerpt(raw: &str) -> &str {
    match raw.char_indices().nth(LOG_EXCERPT) {
        Some((idx, _)) => &raw[..idx],
        None => raw,
    }
}
