//! Subscription reconciliation
//!
//! Aligns what a connection is subscribed to with what the registry wants,
//! using the minimal set of control frames: one unsubscribe frame for
//! `current - desired`, one subscribe frame for `desired - current`.
//!
//! The tracked set is the only state shared between the connection's read
//! loop (depth filtering) and reconciliation. Writers serialize on the
//! tracker's guard, so at most one reconciliation runs per connection.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use types::prelude::{DataKind, Exchange, Symbol};

use crate::adapters::ExchangeAdapter;
use crate::error::ReconcileError;
use crate::metrics::EngineMetrics;
use crate::registry::SymbolRegistry;
use crate::transport::OutboundFrame;

/// Minimal change turning `current` into `desired`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionDelta {
    pub unsubscribe: BTreeSet<Symbol>,
    pub subscribe: BTreeSet<Symbol>,
}

impl SubscriptionDelta {
    pub fn compute(current: &BTreeSet<Symbol>, desired: &BTreeSet<Symbol>) -> Self {
        Self {
            unsubscribe: current.difference(desired).cloned().collect(),
            subscribe: desired.difference(current).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.unsubscribe.is_empty() && self.subscribe.is_empty()
    }
}

/// Per-connection record of the live session and what it is subscribed to.
#[derive(Debug, Default)]
pub struct SubscriptionTracker {
    /// Held for the whole of a reconciliation or session switch.
    guard: tokio::sync::Mutex<()>,
    link: Mutex<Option<mpsc::Sender<OutboundFrame>>>,
    subscribed: RwLock<HashMap<DataKind, BTreeSet<Symbol>>>,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the outbound queue of a freshly opened session. The upstream
    /// side of a new session holds no subscriptions, so neither do we.
    pub async fn begin_session(&self, outbound: mpsc::Sender<OutboundFrame>) {
        let _guard = self.guard.lock().await;
        self.subscribed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(outbound);
    }

    /// Detach the session; reconciliation becomes a no-op until the next one.
    pub fn end_session(&self) {
        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Forget every tracked subscription. A new upstream session starts empty.
    pub async fn clear(&self) {
        let _guard = self.guard.lock().await;
        self.subscribed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn is_connected(&self) -> bool {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn is_subscribed(&self, kind: DataKind, symbol: &Symbol) -> bool {
        self.subscribed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .is_some_and(|set| set.contains(symbol))
    }

    pub fn subscribed(&self, kind: DataKind) -> BTreeSet<Symbol> {
        self.subscribed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_subscribed(&self) -> usize {
        self.subscribed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(BTreeSet::len)
            .sum()
    }

    fn current_link(&self) -> Option<mpsc::Sender<OutboundFrame>> {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn apply(&self, kind: DataKind, remove: &BTreeSet<Symbol>, add: &BTreeSet<Symbol>) {
        let mut subscribed = self
            .subscribed
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let set = subscribed.entry(kind).or_default();
        for symbol in remove {
            set.remove(symbol);
        }
        set.extend(add.iter().cloned());
    }
}

pub struct Reconciler {
    adapter: Arc<dyn ExchangeAdapter>,
    registry: Arc<dyn SymbolRegistry>,
    tracker: Arc<SubscriptionTracker>,
    metrics: Arc<EngineMetrics>,
}

impl Reconciler {
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        registry: Arc<dyn SymbolRegistry>,
        tracker: Arc<SubscriptionTracker>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            adapter,
            registry,
            tracker,
            metrics,
        }
    }

    pub fn exchange(&self) -> Exchange {
        self.adapter.exchange()
    }

    /// Reconcile one data kind. Without a live session this does nothing and
    /// reports `NotConnected`; the next connect reconciles from empty.
    ///
    /// A rejected frame leaves its half of the delta untracked, so the next
    /// run retries it.
    pub async fn reconcile(&self, kind: DataKind) -> Result<SubscriptionDelta, ReconcileError> {
        let exchange = self.adapter.exchange();
        if !kind.is_streamed() {
            return Ok(SubscriptionDelta::default());
        }

        let _guard = self.tracker.guard.lock().await;
        let Some(link) = self.tracker.current_link() else {
            debug!(exchange = %exchange, kind = %kind, "no live connection; skipping reconcile");
            return Err(ReconcileError::NotConnected);
        };

        let desired = self.registry.active_symbols(&exchange, kind).await?;
        let current = self.tracker.subscribed(kind);
        let delta = SubscriptionDelta::compute(&current, &desired);
        if delta.is_empty() {
            return Ok(delta);
        }

        let empty = BTreeSet::new();
        if !delta.unsubscribe.is_empty() {
            if let Some(frame) = self.adapter.unsubscribe_frame(kind, &delta.unsubscribe) {
                self.send(&link, frame, kind, "unsubscribe")?;
            }
            self.tracker.apply(kind, &delta.unsubscribe, &empty);
        }
        if !delta.subscribe.is_empty() {
            if let Some(frame) = self.adapter.subscribe_frame(kind, &delta.subscribe) {
                self.send(&link, frame, kind, "subscribe")?;
            }
            self.tracker.apply(kind, &empty, &delta.subscribe);
        }

        info!(
            exchange = %exchange,
            kind = %kind,
            unsubscribed = delta.unsubscribe.len(),
            subscribed = delta.subscribe.len(),
            "subscriptions reconciled"
        );
        Ok(delta)
    }

    /// Reconcile every kind the adapter streams, continuing past failures.
    pub async fn reconcile_all(&self) -> Vec<(DataKind, Result<SubscriptionDelta, ReconcileError>)> {
        let mut results = Vec::new();
        for &kind in self.adapter.streamed_kinds() {
            results.push((kind, self.reconcile(kind).await));
        }
        results
    }

    fn send(
        &self,
        link: &mpsc::Sender<OutboundFrame>,
        frame: OutboundFrame,
        kind: DataKind,
        op: &'static str,
    ) -> Result<(), ReconcileError> {
        link.try_send(frame).map_err(|e| {
            EngineMetrics::incr(&self.metrics.reconcile_failures);
            warn!(
                exchange = %self.adapter.exchange(),
                kind = %kind,
                op,
                error = %e,
                "control frame rejected; tracked set left unchanged"
            );
            ReconcileError::SendRejected { kind, op }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::okx::OkxAdapter;
    use crate::registry::InMemoryRegistry;
    use proptest::prelude::*;
    use types::prelude::{InstrumentKind, Subscription};

    fn set(symbols: &[&str]) -> BTreeSet<Symbol> {
        symbols.iter().map(|s| Symbol::new(*s)).collect()
    }

    fn depth_sub(symbol: &str) -> Subscription {
        Subscription::new(
            "alice",
            Symbol::new(symbol),
            DataKind::Depth,
            InstrumentKind::Spot,
            None,
            Some(Exchange::okx()),
        )
        .unwrap()
    }

    struct Fixture {
        registry: Arc<InMemoryRegistry>,
        tracker: Arc<SubscriptionTracker>,
        reconciler: Reconciler,
        metrics: Arc<EngineMetrics>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(InMemoryRegistry::new());
        let tracker = Arc::new(SubscriptionTracker::new());
        let metrics = Arc::new(EngineMetrics::new());
        let reconciler = Reconciler::new(
            Arc::new(OkxAdapter::new("wss://example.invalid")),
            registry.clone(),
            tracker.clone(),
            metrics.clone(),
        );
        Fixture {
            registry,
            tracker,
            reconciler,
            metrics,
        }
    }

    #[test]
    fn test_delta_minimality_example() {
        let delta = SubscriptionDelta::compute(&set(&["A", "B", "C"]), &set(&["B", "C", "D"]));
        assert_eq!(delta.unsubscribe, set(&["A"]));
        assert_eq!(delta.subscribe, set(&["D"]));
    }

    #[tokio::test]
    async fn test_reconcile_sends_minimal_frames_and_tracks() {
        let f = fixture();
        let (tx, mut rx) = mpsc::channel(8);
        f.tracker.begin_session(tx).await;
        f.tracker.apply(DataKind::Depth, &BTreeSet::new(), &set(&["A", "B", "C"]));
        for s in ["B", "C", "D"] {
            f.registry.add(depth_sub(s));
        }

        let delta = f.reconciler.reconcile(DataKind::Depth).await.unwrap();
        assert_eq!(delta.unsubscribe, set(&["A"]));
        assert_eq!(delta.subscribe, set(&["D"]));
        assert_eq!(f.tracker.subscribed(DataKind::Depth), set(&["B", "C", "D"]));

        let unsub = rx.try_recv().unwrap();
        let sub = rx.try_recv().unwrap();
        assert!(matches!(unsub, OutboundFrame::Text(ref t) if t.contains("unsubscribe") && t.contains("\"A\"")));
        assert!(matches!(sub, OutboundFrame::Text(ref t) if t.contains("\"subscribe\"") && t.contains("\"D\"")));
        assert!(rx.try_recv().is_err());

        // Second run is a no-op.
        let again = f.reconciler.reconcile(DataKind::Depth).await.unwrap();
        assert!(again.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconcile_without_connection_is_noop() {
        let f = fixture();
        f.registry.add(depth_sub("A"));
        let result = f.reconciler.reconcile(DataKind::Depth).await;
        assert_eq!(result, Err(ReconcileError::NotConnected));
        assert!(f.tracker.subscribed(DataKind::Depth).is_empty());
    }

    #[tokio::test]
    async fn test_rejected_send_leaves_tracked_set_unchanged() {
        let f = fixture();
        let (tx, _rx) = mpsc::channel(1);
        tx.try_send(OutboundFrame::Ping).unwrap(); // queue now full
        f.tracker.begin_session(tx).await;
        f.registry.add(depth_sub("A"));

        let result = f.reconciler.reconcile(DataKind::Depth).await;
        assert_eq!(
            result,
            Err(ReconcileError::SendRejected {
                kind: DataKind::Depth,
                op: "subscribe"
            })
        );
        assert!(f.tracker.subscribed(DataKind::Depth).is_empty());
        assert_eq!(f.metrics.export()["reconcile_failures"], 1);
    }

    #[tokio::test]
    async fn test_ohlc_is_never_streamed() {
        let f = fixture();
        let (tx, mut rx) = mpsc::channel(8);
        f.tracker.begin_session(tx).await;
        let delta = f.reconciler.reconcile(DataKind::Ohlc).await.unwrap();
        assert!(delta.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_clear_and_end_session() {
        let f = fixture();
        let (tx, _rx) = mpsc::channel(8);
        f.tracker.begin_session(tx).await;
        f.tracker.apply(DataKind::Trade, &BTreeSet::new(), &set(&["A"]));
        assert!(f.tracker.is_subscribed(DataKind::Trade, &Symbol::new("A")));
        assert_eq!(f.tracker.total_subscribed(), 1);

        f.tracker.clear().await;
        f.tracker.end_session();
        assert!(!f.tracker.is_connected());
        assert_eq!(f.tracker.total_subscribed(), 0);
    }

    fn symbol_set() -> impl Strategy<Value = BTreeSet<Symbol>> {
        prop::collection::btree_set("[A-E]{1,2}", 0..8)
            .prop_map(|s| s.into_iter().map(Symbol::new).collect())
    }

    proptest! {
        #[test]
        fn prop_delta_is_minimal_and_reaches_desired(current in symbol_set(), desired in symbol_set()) {
            let delta = SubscriptionDelta::compute(&current, &desired);

            // Never touch a symbol already in the right state.
            for s in &delta.unsubscribe {
                prop_assert!(current.contains(s) && !desired.contains(s));
            }
            for s in &delta.subscribe {
                prop_assert!(desired.contains(s) && !current.contains(s));
            }

            let mut next: BTreeSet<Symbol> = current.difference(&delta.unsubscribe).cloned().collect();
            next.extend(delta.subscribe.iter().cloned());
            prop_assert_eq!(next, desired);
        }
    }
}
