//! User subscriptions
//!
//! A subscription's existence is what drives live-feed reconciliation and
//! scheduled backfill. Subscriptions are created and deleted by the
//! request-handling layer; the ingestion engine only reads them.

use crate::bar::Timeframe;
use crate::errors::ValidationError;
use crate::ids::{Exchange, SubscriptionId, Symbol};
use crate::instrument::InstrumentKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of market data a subscription asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    /// Historical and periodically refreshed OHLCV bars
    Ohlc,
    /// Order-book depth stream
    Depth,
    /// Real-time price stream
    Trade,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Ohlc => "ohlc",
            DataKind::Depth => "depth",
            DataKind::Trade => "trade",
        }
    }

    /// Whether this kind is served by the live stream (as opposed to backfill)
    pub fn is_streamed(&self) -> bool {
        matches!(self, DataKind::Depth | DataKind::Trade)
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ohlc" => Ok(DataKind::Ohlc),
            "depth" => Ok(DataKind::Depth),
            "trade" | "realtime" => Ok(DataKind::Trade),
            _ => Err(ValidationError::UnknownDataKind(s.to_string())),
        }
    }
}

/// A user's request for a stream of market data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub username: String,
    pub symbol: Symbol,
    pub data_kind: DataKind,
    pub instrument_kind: InstrumentKind,
    /// Present only for `ohlc` subscriptions
    pub timeframe: Option<Timeframe>,
    /// Absent for asset classes without an exchange concept
    pub exchange: Option<Exchange>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Build a subscription, enforcing the timeframe rule: required for
    /// `ohlc`, discarded for every other kind.
    pub fn new(
        username: impl Into<String>,
        symbol: Symbol,
        data_kind: DataKind,
        instrument_kind: InstrumentKind,
        timeframe: Option<Timeframe>,
        exchange: Option<Exchange>,
    ) -> Result<Self, ValidationError> {
        if symbol.as_str().trim().is_empty() {
            return Err(ValidationError::EmptySymbol);
        }
        let timeframe = match data_kind {
            DataKind::Ohlc => Some(timeframe.ok_or(ValidationError::MissingTimeframe)?),
            DataKind::Depth | DataKind::Trade => None,
        };

        Ok(Self {
            id: SubscriptionId::new(),
            username: username.into(),
            symbol,
            data_kind,
            instrument_kind,
            timeframe,
            exchange,
            created_at: Utc::now(),
        })
    }

    /// Whether this subscription targets `exchange`
    pub fn is_on(&self, exchange: &Exchange) -> bool {
        self.exchange.as_ref() == Some(exchange)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ohlc_requires_timeframe() {
        let result = Subscription::new(
            "alice",
            Symbol::new("BTC-USDT"),
            DataKind::Ohlc,
            InstrumentKind::Spot,
            None,
            Some(Exchange::okx()),
        );
        assert_eq!(result.unwrap_err(), ValidationError::MissingTimeframe);
    }

    #[test]
    fn test_depth_drops_timeframe() {
        let sub = Subscription::new(
            "alice",
            Symbol::new("BTC-USDT"),
            DataKind::Depth,
            InstrumentKind::Spot,
            Some(Timeframe::H1),
            Some(Exchange::okx()),
        )
        .unwrap();
        assert!(sub.timeframe.is_none());
        assert!(sub.is_on(&Exchange::okx()));
        assert!(!sub.is_on(&Exchange::binance()));
    }

    #[test]
    fn test_data_kind_parse() {
        assert_eq!("DEPTH".parse::<DataKind>().unwrap(), DataKind::Depth);
        assert_eq!("realtime".parse::<DataKind>().unwrap(), DataKind::Trade);
        assert!("candles".parse::<DataKind>().is_err());
        assert!(!DataKind::Ohlc.is_streamed());
    }

    #[test]
    fn test_empty_symbol_rejected() {
        let result = Subscription::new(
            "bob",
            Symbol::new(" "),
            DataKind::Trade,
            InstrumentKind::Spot,
            None,
            None,
        );
        assert_eq!(result.unwrap_err(), ValidationError::EmptySymbol);
    }
}
