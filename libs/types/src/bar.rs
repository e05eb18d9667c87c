//! OHLCV bars and their timeframes
//!
//! A bar's natural key is (symbol, timeframe, timestamp, exchange). Stores
//! hold at most one bar per key: writing the same key again refreshes the
//! OHLCV fields of the existing row.

use crate::errors::ValidationError;
use crate::ids::{Exchange, Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported bar timeframes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H12,
    D1,
    W1,
}

impl Timeframe {
    /// Duration of this timeframe in milliseconds.
    pub fn duration_millis(&self) -> i64 {
        const MINUTE: i64 = 60 * 1_000;
        const HOUR: i64 = 60 * MINUTE;
        match self {
            Timeframe::M1 => MINUTE,
            Timeframe::M3 => 3 * MINUTE,
            Timeframe::M5 => 5 * MINUTE,
            Timeframe::M15 => 15 * MINUTE,
            Timeframe::M30 => 30 * MINUTE,
            Timeframe::H1 => HOUR,
            Timeframe::H2 => 2 * HOUR,
            Timeframe::H4 => 4 * HOUR,
            Timeframe::H6 => 6 * HOUR,
            Timeframe::H12 => 12 * HOUR,
            Timeframe::D1 => 24 * HOUR,
            Timeframe::W1 => 7 * 24 * HOUR,
        }
    }

    /// Canonical lower-case label ("1m", "4h", "1d").
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::H6 => "6h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
        }
    }

    /// Align a timestamp to this timeframe's boundary (floor).
    pub fn align_to_boundary(&self, timestamp_millis: i64) -> i64 {
        let duration = self.duration_millis();
        timestamp_millis.div_euclid(duration) * duration
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = ValidationError;

    /// Minutes are always lower-case `m`; `1M` is a month on every venue and
    /// is rejected. Hour/day/week units are case-insensitive ("1H" on OKX).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || ValidationError::UnknownTimeframe(s.to_string());
        let unit = s.chars().last().ok_or_else(unknown)?;
        let count = &s[..s.len() - unit.len_utf8()];
        let tf = match (count, unit) {
            ("1", 'm') => Timeframe::M1,
            ("3", 'm') => Timeframe::M3,
            ("5", 'm') => Timeframe::M5,
            ("15", 'm') => Timeframe::M15,
            ("30", 'm') => Timeframe::M30,
            ("1", 'h' | 'H') => Timeframe::H1,
            ("2", 'h' | 'H') => Timeframe::H2,
            ("4", 'h' | 'H') => Timeframe::H4,
            ("6", 'h' | 'H') => Timeframe::H6,
            ("12", 'h' | 'H') => Timeframe::H12,
            ("1", 'd' | 'D') => Timeframe::D1,
            ("1", 'w' | 'W') => Timeframe::W1,
            _ => return Err(unknown()),
        };
        Ok(tf)
    }
}

impl TryFrom<String> for Timeframe {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.as_str().to_string()
    }
}

/// Natural key of a bar
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BarKey {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub timestamp: i64,
    pub exchange: Exchange,
}

/// A single OHLCV bar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    /// Bucket open time, Unix milliseconds
    pub timestamp: i64,
    pub exchange: Exchange,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub created_at: DateTime<Utc>,
}

impl Bar {
    pub fn key(&self) -> BarKey {
        BarKey {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            timestamp: self.timestamp,
            exchange: self.exchange.clone(),
        }
    }

    /// Overwrite OHLCV fields from `other`, keeping identity and `created_at`.
    pub fn refresh_from(&mut self, other: &Bar) {
        self.open = other.open;
        self.high = other.high;
        self.low = other.low;
        self.close = other.close;
        self.volume = other.volume;
    }

    /// Validate bar integrity (OHLCV invariants).
    pub fn is_valid(&self) -> bool {
        self.high >= self.open
            && self.high >= self.close
            && self.high >= self.low
            && self.low <= self.open
            && self.low <= self.close
            && self.volume >= Decimal::ZERO
    }
}
