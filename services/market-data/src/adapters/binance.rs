//! Binance public API
//!
//! Stream: combined-stream endpoint, `{"method":"SUBSCRIBE","params":[...],"id":N}`
//! control frames with lower-case stream names (`btcusdt@depth10@100ms`,
//! `btcusdt@ticker`), protocol-level ping. Data arrives as
//! `{"stream": ..., "data": ...}`; a raw-stream payload without the wrapper
//! is accepted too. REST: `/api/v3/klines` and the spot/futures
//! `exchangeInfo` listings.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use types::prelude::{
    Bar, DataKind, DepthSnapshot, Exchange, Instrument, InstrumentKind, InstrumentState, Symbol,
    Tick, Timeframe,
};

use super::{get_json, parse_decimal, parse_levels, ExchangeAdapter};
use crate::backfill::BarSource;
use crate::dispatcher::NormalizedEvent;
use crate::error::{FetchError, ParseError};
use crate::instruments::InstrumentSource;
use crate::transport::OutboundFrame;

const DEPTH_SUFFIX: &str = "@depth10@100ms";
const TICKER_SUFFIX: &str = "@ticker";

/// Top-level frame: combined-stream wrapper, ack, or raw payload.
#[derive(Debug, Deserialize)]
struct StreamFrame {
    stream: Option<String>,
    data: Option<Value>,
    id: Option<Value>,
    #[serde(flatten)]
    rest: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct DiffDepth {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b")]
    bids: Vec<Vec<String>>,
    #[serde(rename = "a")]
    asks: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct PartialDepth {
    bids: Vec<Vec<String>>,
    asks: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct Ticker {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    last: String,
}

#[derive(Debug)]
pub struct BinanceAdapter {
    stream_url: String,
    next_id: AtomicU64,
}

impl BinanceAdapter {
    pub fn new(stream_url: impl Into<String>) -> Self {
        Self {
            stream_url: stream_url.into(),
            next_id: AtomicU64::new(1),
        }
    }

    fn suffix(kind: DataKind) -> Option<&'static str> {
        match kind {
            DataKind::Depth => Some(DEPTH_SUFFIX),
            DataKind::Trade => Some(TICKER_SUFFIX),
            DataKind::Ohlc => None,
        }
    }

    fn control_frame(
        &self,
        method: &str,
        kind: DataKind,
        symbols: &BTreeSet<Symbol>,
    ) -> Option<OutboundFrame> {
        let suffix = Self::suffix(kind)?;
        if symbols.is_empty() {
            return None;
        }
        let params: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}{}", s.as_str().to_ascii_lowercase(), suffix))
            .collect();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Some(OutboundFrame::Text(
            json!({ "method": method, "params": params, "id": id }).to_string(),
        ))
    }

    fn parse_payload(stream: Option<&str>, data: Value) -> Result<Vec<NormalizedEvent>, ParseError> {
        let event_type = data.get("e").and_then(Value::as_str);
        let is_ticker = event_type == Some("24hrTicker")
            || stream.is_some_and(|s| s.ends_with(TICKER_SUFFIX));

        if is_ticker {
            let t: Ticker = serde_json::from_value(data)?;
            return Ok(vec![NormalizedEvent::Tick(Tick::new(
                Symbol::new(t.symbol),
                Exchange::binance(),
                parse_decimal("c", &t.last)?,
                t.event_time,
            ))]);
        }

        if event_type == Some("depthUpdate") {
            let d: DiffDepth = serde_json::from_value(data)?;
            return Ok(vec![NormalizedEvent::Depth(DepthSnapshot {
                symbol: Symbol::new(d.symbol),
                exchange: Exchange::binance(),
                timestamp: d.event_time,
                bids: parse_levels("b", &d.bids)?,
                asks: parse_levels("a", &d.asks)?,
            })]);
        }

        if data.get("lastUpdateId").is_some() {
            // Partial book payloads carry neither symbol nor event time.
            let stream = stream.ok_or(ParseError::MissingField("stream"))?;
            let symbol = stream
                .split('@')
                .next()
                .filter(|s| !s.is_empty())
                .ok_or(ParseError::MissingField("stream"))?;
            let d: PartialDepth = serde_json::from_value(data)?;
            return Ok(vec![NormalizedEvent::Depth(DepthSnapshot {
                symbol: Symbol::new(symbol.to_ascii_uppercase()),
                exchange: Exchange::binance(),
                timestamp: Utc::now().timestamp_millis(),
                bids: parse_levels("bids", &d.bids)?,
                asks: parse_levels("asks", &d.asks)?,
            })]);
        }

        Err(ParseError::UnknownChannel(
            stream
                .map(str::to_string)
                .or_else(|| event_type.map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string()),
        ))
    }
}

impl ExchangeAdapter for BinanceAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::binance()
    }

    fn stream_url(&self) -> &str {
        &self.stream_url
    }

    fn subscribe_frame(&self, kind: DataKind, symbols: &BTreeSet<Symbol>) -> Option<OutboundFrame> {
        self.control_frame("SUBSCRIBE", kind, symbols)
    }

    fn unsubscribe_frame(
        &self,
        kind: DataKind,
        symbols: &BTreeSet<Symbol>,
    ) -> Option<OutboundFrame> {
        self.control_frame("UNSUBSCRIBE", kind, symbols)
    }

    fn ping_frame(&self) -> OutboundFrame {
        OutboundFrame::Ping
    }

    fn parse(&self, raw: &str) -> Result<Vec<NormalizedEvent>, ParseError> {
        let frame: StreamFrame = serde_json::from_str(raw)?;
        match (frame.stream, frame.data) {
            (Some(stream), Some(data)) => Self::parse_payload(Some(&stream), data),
            (_, None) if frame.id.is_some() => Ok(Vec::new()),
            (None, None) => Self::parse_payload(None, Value::Object(frame.rest)),
            (Some(_), None) => Err(ParseError::MissingField("data")),
            (None, Some(_)) => Err(ParseError::MissingField("stream")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    /// Spot and USDⓈ-M listings.
    #[serde(default)]
    status: Option<String>,
    /// Coin-margined listings report this instead of `status`.
    #[serde(default)]
    contract_status: Option<String>,
    base_asset: String,
    quote_asset: String,
    #[serde(default)]
    margin_asset: Option<String>,
    #[serde(default)]
    contract_type: Option<String>,
    #[serde(default)]
    contract_size: Option<Value>,
}

/// Binance REST client for bars and instruments.
#[derive(Debug, Clone)]
pub struct BinanceRest {
    http: reqwest::Client,
    api_url: String,
    futures_api_url: Option<String>,
    coin_futures_api_url: Option<String>,
    page_limit: u32,
}

impl BinanceRest {
    pub fn new(
        http: reqwest::Client,
        api_url: &str,
        futures_api_url: Option<&str>,
        coin_futures_api_url: Option<&str>,
        page_limit: u32,
    ) -> Self {
        Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            futures_api_url: futures_api_url.map(|u| u.trim_end_matches('/').to_string()),
            coin_futures_api_url: coin_futures_api_url.map(|u| u.trim_end_matches('/').to_string()),
            page_limit,
        }
    }

    /// Listing endpoints holding instruments of `kind`: spot on the main
    /// host, contracts on the USDⓈ-M and coin-margined hosts.
    pub fn exchange_info_urls(&self, kind: InstrumentKind) -> Vec<String> {
        match kind {
            InstrumentKind::Spot => vec![format!("{}/api/v3/exchangeInfo", self.api_url)],
            InstrumentKind::Swap | InstrumentKind::Futures => self
                .futures_api_url
                .iter()
                .map(|host| format!("{}/fapi/v1/exchangeInfo", host))
                .chain(
                    self.coin_futures_api_url
                        .iter()
                        .map(|host| format!("{}/dapi/v1/exchangeInfo", host)),
                )
                .collect(),
            _ => Vec::new(),
        }
    }

    fn listing(kind: InstrumentKind, info: ExchangeInfo) -> Result<Vec<Instrument>, ParseError> {
        info.symbols
            .into_iter()
            .filter(|s| Self::matches_kind(kind, s))
            .map(|s| Self::to_instrument(kind, s))
            .collect()
    }

    /// `startTime` is inclusive, so the exclusive `since` is bumped by one.
    pub fn klines_url(&self, symbol: &Symbol, timeframe: Timeframe, since: Option<i64>) -> String {
        let mut url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.api_url,
            symbol.as_str().to_ascii_uppercase(),
            timeframe.as_str(),
            self.page_limit
        );
        if let Some(since) = since {
            url.push_str(&format!("&startTime={}", since.saturating_add(1)));
        }
        url
    }

    fn parse_kline(symbol: &Symbol, timeframe: Timeframe, row: &[Value]) -> Result<Bar, ParseError> {
        let text = |field: &'static str, v: &Value| -> Result<rust_decimal::Decimal, ParseError> {
            let s = v.as_str().ok_or(ParseError::InvalidValue {
                field,
                value: v.to_string(),
            })?;
            parse_decimal(field, s)
        };
        match row {
            [open_time, open, high, low, close, volume, ..] => Ok(Bar {
                symbol: symbol.clone(),
                timeframe,
                timestamp: open_time.as_i64().ok_or(ParseError::InvalidValue {
                    field: "openTime",
                    value: open_time.to_string(),
                })?,
                exchange: Exchange::binance(),
                open: text("open", open)?,
                high: text("high", high)?,
                low: text("low", low)?,
                close: text("close", close)?,
                volume: text("volume", volume)?,
                created_at: Utc::now(),
            }),
            _ => Err(ParseError::InvalidValue {
                field: "kline",
                value: format!("{:?}", row),
            }),
        }
    }

    fn to_instrument(kind: InstrumentKind, info: SymbolInfo) -> Result<Instrument, ParseError> {
        let contract_value = match &info.contract_size {
            Some(Value::Number(n)) => Some(parse_decimal("contractSize", &n.to_string())?),
            Some(Value::String(s)) => Some(parse_decimal("contractSize", s)?),
            _ => None,
        };
        Ok(Instrument {
            exchange: Exchange::binance(),
            instrument_id: Symbol::new(info.symbol),
            kind,
            base_currency: info.base_asset,
            quote_currency: info.quote_asset,
            settle_currency: info.margin_asset,
            contract_value,
            contract_multiplier: None,
            contract_value_currency: None,
            state: InstrumentState::from_venue(
                info.status
                    .as_deref()
                    .or(info.contract_status.as_deref())
                    .unwrap_or_default(),
            ),
        })
    }

    fn matches_kind(kind: InstrumentKind, info: &SymbolInfo) -> bool {
        match kind {
            InstrumentKind::Spot => true,
            _ => info
                .contract_type
                .as_deref()
                .and_then(|t| t.parse::<InstrumentKind>().ok())
                == Some(kind),
        }
    }
}

#[async_trait]
impl BarSource for BinanceRest {
    fn exchange(&self) -> Exchange {
        Exchange::binance()
    }

    async fn fetch_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        since: Option<i64>,
    ) -> Result<Vec<Bar>, FetchError> {
        let url = self.klines_url(symbol, timeframe, since);
        let rows: Vec<Vec<Value>> = get_json(&self.http, &url).await?;
        let bars = rows
            .iter()
            .map(|row| Self::parse_kline(symbol, timeframe, row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bars)
    }
}

#[async_trait]
impl InstrumentSource for BinanceRest {
    fn exchange(&self) -> Exchange {
        Exchange::binance()
    }

    fn kinds(&self) -> Vec<InstrumentKind> {
        let mut kinds = vec![InstrumentKind::Spot];
        if self.futures_api_url.is_some() || self.coin_futures_api_url.is_some() {
            kinds.extend([InstrumentKind::Swap, InstrumentKind::Futures]);
        }
        kinds
    }

    async fn fetch_instruments(&self, kind: InstrumentKind) -> Result<Vec<Instrument>, FetchError> {
        let mut instruments = Vec::new();
        for url in self.exchange_info_urls(kind) {
            let info: ExchangeInfo = get_json(&self.http, &url).await?;
            instruments.extend(Self::listing(kind, info)?);
        }
        Ok(instruments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn adapter() -> BinanceAdapter {
        BinanceAdapter::new("wss://stream.binance.com:9443/stream")
    }

    fn symbols(list: &[&str]) -> BTreeSet<Symbol> {
        list.iter().map(|s| Symbol::new(*s)).collect()
    }

    fn frame_json(frame: OutboundFrame) -> Value {
        match frame {
            OutboundFrame::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn test_subscribe_frame_lowercases_and_numbers_requests() {
        let a = adapter();
        let first = frame_json(
            a.subscribe_frame(DataKind::Depth, &symbols(&["BTCUSDT", "ETHUSDT"]))
                .unwrap(),
        );
        assert_eq!(first["method"], "SUBSCRIBE");
        assert_eq!(first["params"][0], "btcusdt@depth10@100ms");
        assert_eq!(first["params"][1], "ethusdt@depth10@100ms");

        let second = frame_json(
            a.unsubscribe_frame(DataKind::Trade, &symbols(&["BTCUSDT"]))
                .unwrap(),
        );
        assert_eq!(second["method"], "UNSUBSCRIBE");
        assert_eq!(second["params"][0], "btcusdt@ticker");
        assert_eq!(second["id"].as_u64().unwrap(), first["id"].as_u64().unwrap() + 1);

        assert!(a.subscribe_frame(DataKind::Ohlc, &symbols(&["BTCUSDT"])).is_none());
        assert_eq!(a.ping_frame(), OutboundFrame::Ping);
    }

    #[test]
    fn test_parse_partial_depth_recovers_symbol_from_stream() {
        let raw = r#"{"stream":"btcusdt@depth10@100ms","data":{"lastUpdateId":160,"bids":[["0.0024","10"]],"asks":[["0.0026","100"],["0.0027","5"]]}}"#;
        let events = adapter().parse(raw).unwrap();
        let NormalizedEvent::Depth(depth) = &events[0] else {
            panic!("expected depth");
        };
        assert_eq!(depth.symbol.as_str(), "BTCUSDT");
        assert_eq!(depth.exchange, Exchange::binance());
        assert_eq!(depth.bids[0].price, dec("0.0024"));
        assert_eq!(depth.asks.len(), 2);
        assert!(depth.timestamp > 0);
    }

    #[test]
    fn test_parse_diff_depth() {
        let raw = r#"{"stream":"bnbbtc@depth","data":{"e":"depthUpdate","E":1700000000001,"s":"BNBBTC","U":157,"u":160,"b":[["0.0024","10"]],"a":[["0.0026","100"]]}}"#;
        let events = adapter().parse(raw).unwrap();
        let NormalizedEvent::Depth(depth) = &events[0] else {
            panic!("expected depth");
        };
        assert_eq!(depth.symbol.as_str(), "BNBBTC");
        assert_eq!(depth.timestamp, 1_700_000_000_001);
    }

    #[test]
    fn test_parse_ticker_wrapped_and_raw() {
        let wrapped = r#"{"stream":"btcusdt@ticker","data":{"e":"24hrTicker","E":1700000000002,"s":"BTCUSDT","c":"43000.50","o":"42000"}}"#;
        let events = adapter().parse(wrapped).unwrap();
        let NormalizedEvent::Tick(tick) = &events[0] else {
            panic!("expected tick");
        };
        assert_eq!(tick.price, dec("43000.50"));
        assert_eq!(tick.timestamp, 1_700_000_000_002);

        let raw = r#"{"e":"24hrTicker","E":1700000000003,"s":"ETHUSDT","c":"2300.1"}"#;
        let events = adapter().parse(raw).unwrap();
        let NormalizedEvent::Tick(tick) = &events[0] else {
            panic!("expected tick");
        };
        assert_eq!(tick.symbol.as_str(), "ETHUSDT");
    }

    #[test]
    fn test_ack_yields_nothing() {
        assert!(adapter().parse(r#"{"result":null,"id":1}"#).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        let a = adapter();
        assert!(matches!(a.parse("[1,2"), Err(ParseError::Json(_))));
        assert!(matches!(
            a.parse(r#"{"stream":"btcusdt@aggTrade","data":{"e":"aggTrade","s":"BTCUSDT"}}"#),
            Err(ParseError::UnknownChannel(_))
        ));
        assert!(matches!(
            a.parse(r#"{"stream":"btcusdt@ticker","data":{"e":"24hrTicker","E":1,"s":"BTCUSDT","c":"n/a"}}"#),
            Err(ParseError::InvalidValue { field: "c", .. })
        ));
    }

    fn rest(futures: Option<&str>) -> BinanceRest {
        rest_with(futures, None)
    }

    fn rest_with(futures: Option<&str>, coin_futures: Option<&str>) -> BinanceRest {
        BinanceRest::new(
            reqwest::Client::new(),
            "https://api.binance.com",
            futures,
            coin_futures,
            500,
        )
    }

    #[test]
    fn test_klines_url_uses_exclusive_since() {
        let r = rest(None);
        assert_eq!(
            r.klines_url(&Symbol::new("btcusdt"), Timeframe::H4, Some(1_700_000_000_000)),
            "https://api.binance.com/api/v3/klines?symbol=BTCUSDT&interval=4h&limit=500&startTime=1700000000001"
        );
    }

    #[test]
    fn test_parse_kline_row() {
        let rows: Vec<Vec<Value>> = serde_json::from_str(
            r#"[[1700000000000,"100.0","112.0","90.0","108.0","12.5",1700003599999,"1300.0",42,"6.0","650.0","0"]]"#,
        )
        .unwrap();
        let bar = BinanceRest::parse_kline(&Symbol::new("BTCUSDT"), Timeframe::H1, &rows[0]).unwrap();
        assert_eq!(bar.timestamp, 1_700_000_000_000);
        assert_eq!(bar.close, dec("108.0"));
        assert_eq!(bar.volume, dec("12.5"));
    }

    #[test]
    fn test_instrument_kinds_depend_on_futures_host() {
        assert_eq!(rest(None).kinds(), vec![InstrumentKind::Spot]);
        assert_eq!(rest(Some("https://fapi.binance.com")).kinds().len(), 3);
        assert_eq!(rest_with(None, Some("https://dapi.binance.com")).kinds().len(), 3);
    }

    #[test]
    fn test_contract_listings_span_both_futures_hosts() {
        let r = rest_with(Some("https://fapi.binance.com/"), Some("https://dapi.binance.com"));
        assert_eq!(
            r.exchange_info_urls(InstrumentKind::Swap),
            vec![
                "https://fapi.binance.com/fapi/v1/exchangeInfo".to_string(),
                "https://dapi.binance.com/dapi/v1/exchangeInfo".to_string(),
            ]
        );
        assert_eq!(
            r.exchange_info_urls(InstrumentKind::Spot),
            vec!["https://api.binance.com/api/v3/exchangeInfo".to_string()]
        );
        assert!(r.exchange_info_urls(InstrumentKind::Option).is_empty());
    }

    #[test]
    fn test_coin_margined_perpetuals_are_swaps() {
        let info: ExchangeInfo = serde_json::from_str(
            r#"{"symbols":[
                {"symbol":"BTCUSD_PERP","pair":"BTCUSD","contractType":"PERPETUAL","contractStatus":"TRADING","baseAsset":"BTC","quoteAsset":"USD","marginAsset":"BTC","contractSize":100},
                {"symbol":"BTCUSD_250328","pair":"BTCUSD","contractType":"CURRENT_QUARTER","contractStatus":"TRADING","baseAsset":"BTC","quoteAsset":"USD","marginAsset":"BTC","contractSize":100},
                {"symbol":"LUNAUSD_PERP","pair":"LUNAUSD","contractType":"PERPETUAL","contractStatus":"SETTLING","baseAsset":"LUNA","quoteAsset":"USD","marginAsset":"LUNA","contractSize":10}
            ]}"#,
        )
        .unwrap();

        let swaps = BinanceRest::listing(InstrumentKind::Swap, info).unwrap();
        assert_eq!(swaps.len(), 2);
        assert_eq!(swaps[0].instrument_id.as_str(), "BTCUSD_PERP");
        assert_eq!(swaps[0].kind, InstrumentKind::Swap);
        assert_eq!(swaps[0].settle_currency.as_deref(), Some("BTC"));
        assert_eq!(swaps[0].contract_value, Some(dec("100")));
        assert!(swaps[0].is_active());
        assert!(!swaps[1].is_active());
    }

    #[test]
    fn test_futures_listing_split_by_contract_type() {
        let info: ExchangeInfo = serde_json::from_str(
            r#"{"symbols":[
                {"symbol":"BTCUSDT","status":"TRADING","baseAsset":"BTC","quoteAsset":"USDT","marginAsset":"USDT","contractType":"PERPETUAL"},
                {"symbol":"BTCUSDT_250328","status":"TRADING","baseAsset":"BTC","quoteAsset":"USDT","marginAsset":"USDT","contractType":"CURRENT_QUARTER"}
            ]}"#,
        )
        .unwrap();
        let swaps: Vec<_> = info
            .symbols
            .iter()
            .filter(|s| BinanceRest::matches_kind(InstrumentKind::Swap, s))
            .collect();
        assert_eq!(swaps.len(), 1);
        assert_eq!(swaps[0].symbol, "BTCUSDT");

        let futures: Vec<_> = info
            .symbols
            .into_iter()
            .filter(|s| BinanceRest::matches_kind(InstrumentKind::Futures, s))
            .map(|s| BinanceRest::to_instrument(InstrumentKind::Futures, s).unwrap())
            .collect();
        assert_eq!(futures.len(), 1);
        assert_eq!(futures[0].settle_currency.as_deref(), Some("USDT"));
        assert!(futures[0].is_active());
    }
}
