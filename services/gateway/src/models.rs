use market_data::backfill::BackfillReport;
use market_data::connection::{ConnectionHandle, ConnectionState};
use market_data::reconciler::SubscriptionDelta;
use serde::{Deserialize, Serialize};
use types::prelude::{DataKind, Exchange, Symbol, Timeframe};

/// Kinds, timeframes and exchanges arrive as strings so that venue
/// spellings (`realtime`, `PERPETUAL`, `1H`) go through the model parsers.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub username: String,
    pub symbol: String,
    pub data_kind: String,
    pub instrument_kind: String,
    pub timeframe: Option<String>,
    pub exchange: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackfillRequest {
    pub exchange: String,
    pub symbol: String,
    pub timeframe: Option<String>,
    /// Exclusive lower bound, Unix milliseconds
    pub since: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillResponse {
    pub exchange: Exchange,
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub written: usize,
    pub watermark: Option<i64>,
}

impl BackfillResponse {
    pub fn new(exchange: Exchange, symbol: Symbol, timeframe: Timeframe, report: BackfillReport) -> Self {
        Self {
            exchange,
            symbol,
            timeframe,
            fetched: report.fetched,
            inserted: report.inserted,
            updated: report.updated,
            written: report.written(),
            watermark: report.watermark,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileResponse {
    pub exchange: Exchange,
    pub data_kind: DataKind,
    pub subscribed: Vec<Symbol>,
    pub unsubscribed: Vec<Symbol>,
}

impl ReconcileResponse {
    pub fn new(exchange: Exchange, data_kind: DataKind, delta: SubscriptionDelta) -> Self {
        Self {
            exchange,
            data_kind,
            subscribed: delta.subscribe.into_iter().collect(),
            unsubscribed: delta.unsubscribe.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub exchange: Exchange,
    pub state: ConnectionState,
    pub depth_symbols: usize,
    pub trade_symbols: usize,
}

impl From<&ConnectionHandle> for ConnectionStatus {
    fn from(handle: &ConnectionHandle) -> Self {
        Self {
            exchange: handle.exchange().clone(),
            state: handle.state(),
            depth_symbols: handle.subscribed(DataKind::Depth).len(),
            trade_symbols: handle.subscribed(DataKind::Trade).len(),
        }
    }
}
