//! OKX v5 public API
//!
//! Stream: `{"op":"subscribe","args":[{"channel":"books5","instId":"BTC-USDT"}]}`
//! control frames, literal `ping`/`pong` keepalive, data frames tagged by
//! `arg.channel`. REST: `/api/v5/market/candles` and
//! `/api/v5/public/instruments`, both wrapped in `{"code","msg","data"}`.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use types::prelude::{
    Bar, DataKind, DepthSnapshot, Exchange, Instrument, InstrumentKind, InstrumentState, Symbol,
    Tick, Timeframe,
};

use super::{
    get_json, non_empty, parse_decimal, parse_levels, parse_millis, parse_optional_decimal,
    ExchangeAdapter,
};
use crate::backfill::BarSource;
use crate::dispatcher::NormalizedEvent;
use crate::error::{FetchError, ParseError};
use crate::instruments::InstrumentSource;
use crate::transport::OutboundFrame;

const DEPTH_CHANNEL: &str = "books5";
const TICKER_CHANNEL: &str = "tickers";

#[derive(Debug, Deserialize)]
struct Arg {
    channel: String,
    #[serde(rename = "instId")]
    inst_id: Option<String>,
}

/// Any stream frame: an event ack/error or a data push.
#[derive(Debug, Deserialize)]
struct StreamFrame {
    event: Option<String>,
    code: Option<String>,
    msg: Option<String>,
    arg: Option<Arg>,
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct TickerData {
    #[serde(rename = "instId")]
    inst_id: String,
    last: String,
    ts: String,
}

#[derive(Debug, Deserialize)]
struct BookData {
    #[serde(rename = "instId")]
    inst_id: Option<String>,
    asks: Vec<Vec<String>>,
    bids: Vec<Vec<String>>,
    ts: String,
}

#[derive(Debug)]
pub struct OkxAdapter {
    stream_url: String,
}

impl OkxAdapter {
    pub fn new(stream_url: impl Into<String>) -> Self {
        Self {
            stream_url: stream_url.into(),
        }
    }

    fn channel(kind: DataKind) -> Option<&'static str> {
        match kind {
            DataKind::Depth => Some(DEPTH_CHANNEL),
            DataKind::Trade => Some(TICKER_CHANNEL),
            DataKind::Ohlc => None,
        }
    }

    fn control_frame(op: &str, kind: DataKind, symbols: &BTreeSet<Symbol>) -> Option<OutboundFrame> {
        let channel = Self::channel(kind)?;
        if symbols.is_empty() {
            return None;
        }
        let args: Vec<Value> = symbols
            .iter()
            .map(|s| json!({ "channel": channel, "instId": s.as_str() }))
            .collect();
        Some(OutboundFrame::Text(json!({ "op": op, "args": args }).to_string()))
    }

    fn exchange_id() -> Exchange {
        Exchange::okx()
    }
}

impl ExchangeAdapter for OkxAdapter {
    fn exchange(&self) -> Exchange {
        Self::exchange_id()
    }

    fn stream_url(&self) -> &str {
        &self.stream_url
    }

    fn subscribe_frame(&self, kind: DataKind, symbols: &BTreeSet<Symbol>) -> Option<OutboundFrame> {
        Self::control_frame("subscribe", kind, symbols)
    }

    fn unsubscribe_frame(
        &self,
        kind: DataKind,
        symbols: &BTreeSet<Symbol>,
    ) -> Option<OutboundFrame> {
        Self::control_frame("unsubscribe", kind, symbols)
    }

    fn ping_frame(&self) -> OutboundFrame {
        OutboundFrame::Text("ping".to_string())
    }

    fn parse(&self, raw: &str) -> Result<Vec<NormalizedEvent>, ParseError> {
        if raw.trim() == "pong" {
            return Ok(Vec::new());
        }

        let frame: StreamFrame = serde_json::from_str(raw)?;
        if let Some(event) = frame.event {
            if event == "error" {
                warn!(
                    exchange = Exchange::OKX,
                    code = frame.code.as_deref().unwrap_or_default(),
                    msg = frame.msg.as_deref().unwrap_or_default(),
                    "exchange reported stream error"
                );
            }
            return Ok(Vec::new());
        }

        let arg = frame.arg.ok_or(ParseError::MissingField("arg"))?;
        let data = frame.data.ok_or(ParseError::MissingField("data"))?;

        match arg.channel.as_str() {
            TICKER_CHANNEL => {
                let rows: Vec<TickerData> = serde_json::from_value(data)?;
                rows.into_iter()
                    .map(|row| {
                        Ok(NormalizedEvent::Tick(Tick::new(
                            Symbol::new(row.inst_id),
                            Self::exchange_id(),
                            parse_decimal("last", &row.last)?,
                            parse_millis("ts", &row.ts)?,
                        )))
                    })
                    .collect()
            }
            DEPTH_CHANNEL => {
                let rows: Vec<BookData> = serde_json::from_value(data)?;
                rows.into_iter()
                    .map(|row| {
                        let symbol = row
                            .inst_id
                            .or_else(|| arg.inst_id.clone())
                            .ok_or(ParseError::MissingField("instId"))?;
                        Ok(NormalizedEvent::Depth(DepthSnapshot {
                            symbol: Symbol::new(symbol),
                            exchange: Self::exchange_id(),
                            timestamp: parse_millis("ts", &row.ts)?,
                            bids: parse_levels("bids", &row.bids)?,
                            asks: parse_levels("asks", &row.asks)?,
                        }))
                    })
                    .collect()
            }
            other => Err(ParseError::UnknownChannel(other.to_string())),
        }
    }
}

/// `{"code":"0","msg":"","data":[...]}`
#[derive(Debug, Deserialize)]
struct RestEnvelope<T> {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

impl<T> RestEnvelope<T> {
    fn into_data(self) -> Result<Vec<T>, FetchError> {
        if self.code == "0" {
            Ok(self.data)
        } else {
            Err(FetchError::Exchange {
                code: self.code,
                message: self.msg,
            })
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentRow {
    inst_id: String,
    #[serde(default)]
    base_ccy: Option<String>,
    #[serde(default)]
    quote_ccy: Option<String>,
    #[serde(default)]
    settle_ccy: Option<String>,
    #[serde(default)]
    ct_val: Option<String>,
    #[serde(default)]
    ct_mult: Option<String>,
    #[serde(default)]
    ct_val_ccy: Option<String>,
    #[serde(default)]
    uly: Option<String>,
    state: String,
}

/// OKX REST client for bars and instruments.
#[derive(Debug, Clone)]
pub struct OkxRest {
    http: reqwest::Client,
    api_url: String,
    page_limit: u32,
}

impl OkxRest {
    pub fn new(http: reqwest::Client, api_url: &str, page_limit: u32) -> Self {
        Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            page_limit,
        }
    }

    /// Venue spelling of a timeframe: hours and above are upper-case.
    pub fn bar_param(timeframe: Timeframe) -> &'static str {
        match timeframe {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1H",
            Timeframe::H2 => "2H",
            Timeframe::H4 => "4H",
            Timeframe::H6 => "6H",
            Timeframe::H12 => "12H",
            Timeframe::D1 => "1D",
            Timeframe::W1 => "1W",
        }
    }

    /// `before` asks for rows newer than the given timestamp.
    pub fn candles_url(&self, symbol: &Symbol, timeframe: Timeframe, since: Option<i64>) -> String {
        let mut url = format!(
            "{}/api/v5/market/candles?instId={}&bar={}&limit={}",
            self.api_url,
            symbol,
            Self::bar_param(timeframe),
            self.page_limit
        );
        if let Some(since) = since {
            url.push_str(&format!("&before={}", since));
        }
        url
    }

    pub fn instruments_url(&self, kind: InstrumentKind) -> String {
        format!("{}/api/v5/public/instruments?instType={}", self.api_url, kind)
    }

    /// Option families, e.g. `BTC-USD`; option listings are queried per family.
    pub fn option_families_url(&self) -> String {
        format!("{}/api/v5/public/underlying?instType=OPTION", self.api_url)
    }

    pub fn option_instruments_url(&self, family: &str) -> String {
        format!(
            "{}&instFamily={}",
            self.instruments_url(InstrumentKind::Option),
            family
        )
    }

    async fn fetch_rows(&self, url: &str) -> Result<Vec<InstrumentRow>, FetchError> {
        get_json::<RestEnvelope<InstrumentRow>>(&self.http, url)
            .await?
            .into_data()
    }

    async fn fetch_option_rows(&self) -> Result<Vec<InstrumentRow>, FetchError> {
        let families = get_json::<RestEnvelope<Vec<String>>>(&self.http, &self.option_families_url())
            .await?
            .into_data()?;
        let mut rows = Vec::new();
        for family in families.into_iter().flatten() {
            let listed = self.fetch_rows(&self.option_instruments_url(&family)).await?;
            debug!(family = %family, instruments = listed.len(), "fetched option family");
            rows.extend(listed);
        }
        Ok(rows)
    }

    fn parse_candle(
        symbol: &Symbol,
        timeframe: Timeframe,
        row: &[String],
    ) -> Result<Bar, ParseError> {
        match row {
            [ts, open, high, low, close, volume, ..] => Ok(Bar {
                symbol: symbol.clone(),
                timeframe,
                timestamp: parse_millis("ts", ts)?,
                exchange: Exchange::okx(),
                open: parse_decimal("open", open)?,
                high: parse_decimal("high", high)?,
                low: parse_decimal("low", low)?,
                close: parse_decimal("close", close)?,
                volume: parse_decimal("volume", volume)?,
                created_at: Utc::now(),
            }),
            _ => Err(ParseError::InvalidValue {
                field: "candle",
                value: format!("{:?}", row),
            }),
        }
    }

    fn parse_instrument(kind: InstrumentKind, row: InstrumentRow) -> Result<Instrument, ParseError> {
        // Derivatives leave baseCcy/quoteCcy empty; the underlying carries them.
        let (uly_base, uly_quote) = match row.uly.as_deref().and_then(|u| u.split_once('-')) {
            Some((b, q)) => (Some(b.to_string()), Some(q.to_string())),
            None => (None, None),
        };
        Ok(Instrument {
            exchange: Exchange::okx(),
            instrument_id: Symbol::new(row.inst_id),
            kind,
            base_currency: non_empty(row.base_ccy).or(uly_base).unwrap_or_default(),
            quote_currency: non_empty(row.quote_ccy).or(uly_quote).unwrap_or_default(),
            settle_currency: non_empty(row.settle_ccy),
            contract_value: parse_optional_decimal("ctVal", row.ct_val.as_deref())?,
            contract_multiplier: parse_optional_decimal("ctMult", row.ct_mult.as_deref())?,
            contract_value_currency: non_empty(row.ct_val_ccy),
            state: InstrumentState::from_venue(&row.state),
        })
    }
}

#[async_trait]
impl BarSource for OkxRest {
    fn exchange(&self) -> Exchange {
        Exchange::okx()
    }

    async fn fetch_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        since: Option<i64>,
    ) -> Result<Vec<Bar>, FetchError> {
        let url = self.candles_url(symbol, timeframe, since);
        let rows = get_json::<RestEnvelope<Vec<String>>>(&self.http, &url)
            .await?
            .into_data()?;
        let bars = rows
            .iter()
            .map(|row| Self::parse_candle(symbol, timeframe, row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bars)
    }
}

#[async_trait]
impl InstrumentSource for OkxRest {
    fn exchange(&self) -> Exchange {
        Exchange::okx()
    }

    fn kinds(&self) -> Vec<InstrumentKind> {
        vec![
            InstrumentKind::Spot,
            InstrumentKind::Margin,
            InstrumentKind::Swap,
            InstrumentKind::Futures,
            InstrumentKind::Option,
        ]
    }

    async fn fetch_instruments(&self, kind: InstrumentKind) -> Result<Vec<Instrument>, FetchError> {
        let rows = match kind {
            InstrumentKind::Option => self.fetch_option_rows().await?,
            _ => self.fetch_rows(&self.instruments_url(kind)).await?,
        };
        let instruments = rows
            .into_iter()
            .map(|row| Self::parse_instrument(kind, row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(instruments)
    }
}
