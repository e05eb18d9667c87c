//! Real-time price ticks and order-book depth snapshots

use crate::ids::{Exchange, Symbol, TickId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single real-time price observation. Append-only once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    pub id: TickId,
    pub symbol: Symbol,
    pub exchange: Exchange,
    pub price: Decimal,
    /// Exchange-reported time, Unix milliseconds
    pub timestamp: i64,
    /// Local receive time
    pub received_at: DateTime<Utc>,
}

impl Tick {
    pub fn new(symbol: Symbol, exchange: Exchange, price: Decimal, timestamp: i64) -> Self {
        Self {
            id: TickId::new(),
            symbol,
            exchange,
            price,
            timestamp,
            received_at: Utc::now(),
        }
    }
}

/// One price level of an order book side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Point-in-time view of an order book.
///
/// Levels keep the exchange's own ordering; they are never re-sorted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub symbol: Symbol,
    pub exchange: Exchange,
    /// Exchange-reported time, Unix milliseconds
    pub timestamp: i64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl DepthSnapshot {
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }
}
