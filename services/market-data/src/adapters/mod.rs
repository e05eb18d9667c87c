//! Exchange adapters
//!
//! Everything venue-specific lives behind three seams: [`ExchangeAdapter`]
//! for the streaming wire format, [`BarSource`] for historical bars and
//! [`InstrumentSource`] for instrument metadata. Adding a venue means
//! implementing those and registering it in [`bundle_for`].

pub mod binance;
pub mod okx;

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use types::prelude::{DataKind, Exchange, PriceLevel, Symbol};

use crate::backfill::BarSource;
use crate::config::ExchangeConfig;
use crate::dispatcher::{DepthFilter, NormalizedEvent};
use crate::error::{EngineError, FetchError, ParseError};
use crate::instruments::InstrumentSource;
use crate::transport::OutboundFrame;

pub use binance::{BinanceAdapter, BinanceRest};
pub use okx::{OkxAdapter, OkxRest};

/// Streaming wire format of one exchange.
pub trait ExchangeAdapter: Send + Sync {
    fn exchange(&self) -> Exchange;

    fn stream_url(&self) -> &str;

    /// Data kinds served by the live stream.
    fn streamed_kinds(&self) -> &'static [DataKind] {
        &[DataKind::Depth, DataKind::Trade]
    }

    /// Control frame subscribing `symbols`; `None` when `kind` is not
    /// streamed or there is nothing to subscribe.
    fn subscribe_frame(&self, kind: DataKind, symbols: &BTreeSet<Symbol>) -> Option<OutboundFrame>;

    fn unsubscribe_frame(&self, kind: DataKind, symbols: &BTreeSet<Symbol>)
        -> Option<OutboundFrame>;

    fn ping_frame(&self) -> OutboundFrame;

    /// Normalize one inbound text frame. Acks and keepalive replies yield
    /// no events.
    fn parse(&self, raw: &str) -> Result<Vec<NormalizedEvent>, ParseError>;
}

/// Everything the engine needs to run one exchange.
#[derive(Clone)]
pub struct ExchangeBundle {
    pub adapter: Arc<dyn ExchangeAdapter>,
    pub bars: Arc<dyn BarSource>,
    pub instruments: Arc<dyn InstrumentSource>,
    pub depth_filter: DepthFilter,
}

/// Build the adapter set for a configured exchange.
pub fn bundle_for(
    config: &ExchangeConfig,
    page_limit: u32,
    http: reqwest::Client,
) -> Result<ExchangeBundle, EngineError> {
    match config.exchange.as_str() {
        Exchange::OKX => {
            let rest = Arc::new(OkxRest::new(http, &config.api_url, page_limit));
            Ok(ExchangeBundle {
                adapter: Arc::new(OkxAdapter::new(&config.ws_url)),
                bars: rest.clone(),
                instruments: rest,
                depth_filter: config.depth_filter,
            })
        }
        Exchange::BINANCE => {
            let rest = Arc::new(BinanceRest::new(
                http,
                &config.api_url,
                config.futures_api_url.as_deref(),
                config.coin_futures_api_url.as_deref(),
                page_limit,
            ));
            Ok(ExchangeBundle {
                adapter: Arc::new(BinanceAdapter::new(&config.ws_url)),
                bars: rest.clone(),
                instruments: rest,
                depth_filter: config.depth_filter,
            })
        }
        other => Err(EngineError::UnknownExchange(other.to_string())),
    }
}

pub(crate) fn parse_decimal(field: &'static str, value: &str) -> Result<Decimal, ParseError> {
    Decimal::from_str(value).map_err(|_| ParseError::InvalidValue {
        field,
        value: value.to_string(),
    })
}

/// Empty strings mean "not applicable" in instrument listings.
pub(crate) fn parse_optional_decimal(
    field: &'static str,
    value: Option<&str>,
) -> Result<Option<Decimal>, ParseError> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) => parse_decimal(field, v).map(Some),
    }
}

pub(crate) fn parse_millis(field: &'static str, value: &str) -> Result<i64, ParseError> {
    value.parse::<i64>().map_err(|_| ParseError::InvalidValue {
        field,
        value: value.to_string(),
    })
}

/// `[[price, size, ...], ...]` in exchange order.
pub(crate) fn parse_levels(
    field: &'static str,
    rows: &[Vec<String>],
) -> Result<Vec<PriceLevel>, ParseError> {
    rows.iter()
        .map(|row| match row.as_slice() {
            [price, size, ..] => Ok(PriceLevel::new(
                parse_decimal(field, price)?,
                parse_decimal(field, size)?,
            )),
            _ => Err(ParseError::InvalidValue {
                field,
                value: format!("{:?}", row),
            }),
        })
        .collect()
}

pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

pub(crate) async fn get_json<T: DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
) -> Result<T, FetchError> {
    let response = http.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| FetchError::Parse(ParseError::from(e)))
}
