//! Broadcast gateway
//!
//! Fan-out of normalized updates to in-process subscribers on per-symbol
//! topics `market/{kind}/{exchange}/{symbol}`. Delivery is at-most-once:
//! publishing to a topic nobody listens on drops the record, and a lagging
//! receiver skips whatever the channel overwrote.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tracing::trace;
use types::prelude::{DepthSnapshot, Exchange, Symbol, Tick};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Tick,
    Depth,
}

impl UpdateKind {
    /// Parse the kind segment of a topic.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tick" => Some(UpdateKind::Tick),
            "depth" => Some(UpdateKind::Depth),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateKind::Tick => "tick",
            UpdateKind::Depth => "depth",
        }
    }
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UpdatePayload {
    Tick(Tick),
    Depth(DepthSnapshot),
}

/// Normalized update pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub kind: UpdateKind,
    pub symbol: Symbol,
    pub exchange: Exchange,
    pub payload: UpdatePayload,
    /// Exchange-reported time, Unix milliseconds
    pub timestamp: i64,
}

impl UpdateRecord {
    pub fn tick(tick: &Tick) -> Self {
        Self {
            kind: UpdateKind::Tick,
            symbol: tick.symbol.clone(),
            exchange: tick.exchange.clone(),
            payload: UpdatePayload::Tick(tick.clone()),
            timestamp: tick.timestamp,
        }
    }

    pub fn depth(snapshot: &DepthSnapshot) -> Self {
        Self {
            kind: UpdateKind::Depth,
            symbol: snapshot.symbol.clone(),
            exchange: snapshot.exchange.clone(),
            payload: UpdatePayload::Depth(snapshot.clone()),
            timestamp: snapshot.timestamp,
        }
    }

    pub fn topic(&self) -> String {
        topic(self.kind, &self.exchange, &self.symbol)
    }
}

/// Topic name for a (kind, exchange, symbol) stream.
pub fn topic(kind: UpdateKind, exchange: &Exchange, symbol: &Symbol) -> String {
    format!("market/{}/{}/{}", kind, exchange, symbol)
}

pub struct BroadcastGateway {
    channels: DashMap<String, broadcast::Sender<UpdateRecord>>,
    capacity: usize,
}

impl BroadcastGateway {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to a topic, creating it on first use.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<UpdateRecord> {
        self.channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish to the record's topic. Returns the number of receivers reached.
    pub fn publish(&self, record: UpdateRecord) -> usize {
        let topic = record.topic();
        let Some(sender) = self.channels.get(&topic).map(|s| s.value().clone()) else {
            trace!(topic = %topic, "no subscribers; dropping update");
            return 0;
        };
        match sender.send(record) {
            Ok(reached) => reached,
            Err(_) => {
                // Every receiver is gone: forget the topic until someone resubscribes.
                self.channels
                    .remove_if(&topic, |_, s| s.receiver_count() == 0);
                0
            }
        }
    }

    pub fn receiver_count(&self, topic: &str) -> usize {
        self.channels
            .get(topic)
            .map_or(0, |s| s.receiver_count())
    }

    pub fn topic_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for BroadcastGateway {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn tick(symbol: &str, price: i64) -> Tick {
        Tick::new(Symbol::new(symbol), Exchange::okx(), Decimal::from(price), 1_700_000_000_000)
    }

    #[test]
    fn test_topic_naming() {
        let record = UpdateRecord::tick(&tick("BTC-USDT", 1));
        assert_eq!(record.topic(), "market/tick/okx/BTC-USDT");
        assert_eq!(UpdateKind::parse("depth"), Some(UpdateKind::Depth));
        assert_eq!(UpdateKind::parse("ohlc"), None);
    }

    #[tokio::test]
    async fn test_publish_reaches_topic_subscribers_only() {
        let gateway = BroadcastGateway::new(16);
        let mut btc = gateway.subscribe("market/tick/okx/BTC-USDT");
        let mut eth = gateway.subscribe("market/tick/okx/ETH-USDT");

        assert_eq!(gateway.publish(UpdateRecord::tick(&tick("BTC-USDT", 43000))), 1);

        let got = btc.recv().await.unwrap();
        assert_eq!(got.symbol.as_str(), "BTC-USDT");
        assert!(eth.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers_is_silent_drop() {
        let gateway = BroadcastGateway::new(16);
        assert_eq!(gateway.publish(UpdateRecord::tick(&tick("BTC-USDT", 1))), 0);
        assert_eq!(gateway.topic_count(), 0);
    }

    #[test]
    fn test_topic_forgotten_after_last_receiver_drops() {
        let gateway = BroadcastGateway::new(16);
        let rx = gateway.subscribe("market/tick/okx/BTC-USDT");
        drop(rx);
        assert_eq!(gateway.publish(UpdateRecord::tick(&tick("BTC-USDT", 1))), 0);
        assert_eq!(gateway.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_lagging_receiver_skips() {
        let gateway = BroadcastGateway::new(2);
        let mut rx = gateway.subscribe("market/tick/okx/BTC-USDT");
        for price in 0..5 {
            gateway.publish(UpdateRecord::tick(&tick("BTC-USDT", price)));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        let next = rx.recv().await.unwrap();
        assert_eq!(next.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_record_serializes_kind_lowercase() {
        let json = serde_json::to_value(UpdateRecord::tick(&tick("BTC-USDT", 1))).unwrap();
        assert_eq!(json["kind"], "tick");
        assert_eq!(json["payload"]["price"], "1");
    }
}
