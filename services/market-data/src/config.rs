//! Engine configuration
//!
//! Every tunable has a default matching production behavior; `from_env`
//! overlays `MD_*` environment variables on top of those defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use types::prelude::{Exchange, Timeframe};

use crate::dispatcher::DepthFilter;
use crate::error::ConfigError;

/// Reconnect and keepalive settings for exchange connections.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Delay before the first reconnect attempt.
    pub initial_reconnect_delay: Duration,
    /// Upper bound on the exponential reconnect delay (jitter excluded).
    pub max_reconnect_delay: Duration,
    /// Jitter is drawn uniformly from `[0, max_jitter)`.
    pub max_jitter: Duration,
    /// Keepalive ping interval while connected.
    pub ping_interval: Duration,
    /// Capacity of the outbound frame queue; a full queue rejects sends.
    pub outbound_queue: usize,
    /// A handshake that takes longer counts as a transport failure.
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            initial_reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
            max_jitter: Duration::from_millis(1000),
            ping_interval: Duration::from_secs(25),
            outbound_queue: 64,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Depth cache flush settings.
#[derive(Debug, Clone)]
pub struct FlushConfig {
    pub interval: Duration,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
        }
    }
}

/// Scheduled backfill settings.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    pub interval: Duration,
    /// Timeframe used for ohlc subscriptions that carry none.
    pub default_timeframe: Timeframe,
    /// Rows requested per page from the exchange.
    pub page_limit: u32,
    /// Where to persist watermarks; `None` keeps them in memory only.
    pub watermark_path: Option<PathBuf>,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            default_timeframe: Timeframe::H1,
            page_limit: 100,
            watermark_path: None,
        }
    }
}

/// Retention for the in-process store. Ticks and depth rows beyond the
/// limit evict the oldest entries first.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub tick_retention: usize,
    pub depth_retention: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            tick_retention: 100_000,
            depth_retention: 100_000,
        }
    }
}

/// Instrument metadata sync settings.
#[derive(Debug, Clone)]
pub struct InstrumentSyncConfig {
    pub interval: Duration,
    pub enabled: bool,
}

impl Default for InstrumentSyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            enabled: true,
        }
    }
}

/// Endpoints and policy for one exchange.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub exchange: Exchange,
    pub ws_url: String,
    pub api_url: String,
    /// USDⓈ-M futures REST host, where the venue splits it out.
    pub futures_api_url: Option<String>,
    /// Coin-margined futures REST host.
    pub coin_futures_api_url: Option<String>,
    pub depth_filter: DepthFilter,
    pub enabled: bool,
}

impl ExchangeConfig {
    pub fn okx() -> Self {
        Self {
            exchange: Exchange::okx(),
            ws_url: "wss://ws.okx.com:8443/ws/v5/public".to_string(),
            api_url: "https://www.okx.com".to_string(),
            futures_api_url: None,
            coin_futures_api_url: None,
            depth_filter: DepthFilter::SubscribedOnly,
            enabled: true,
        }
    }

    pub fn binance() -> Self {
        Self {
            exchange: Exchange::binance(),
            ws_url: "wss://stream.binance.com:9443/stream".to_string(),
            api_url: "https://api.binance.com".to_string(),
            futures_api_url: Some("https://fapi.binance.com".to_string()),
            coin_futures_api_url: Some("https://dapi.binance.com".to_string()),
            depth_filter: DepthFilter::AcceptAll,
            enabled: true,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub connection: ConnectionConfig,
    pub flush: FlushConfig,
    pub backfill: BackfillConfig,
    pub instruments: InstrumentSyncConfig,
    pub store: StoreConfig,
    /// Per-topic broadcast channel capacity.
    pub broadcast_capacity: usize,
    pub exchanges: Vec<ExchangeConfig>,
    /// Control API bind address.
    pub listen_addr: SocketAddr,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            flush: FlushConfig::default(),
            backfill: BackfillConfig::default(),
            instruments: InstrumentSyncConfig::default(),
            store: StoreConfig::default(),
            broadcast_capacity: 1024,
            exchanges: vec![ExchangeConfig::okx(), ExchangeConfig::binance()],
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `MD_*` process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64, _>(&lookup, "MD_FLUSH_INTERVAL_MS")? {
            config.flush.interval = positive_millis("MD_FLUSH_INTERVAL_MS", ms)?;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "MD_PING_INTERVAL_MS")? {
            config.connection.ping_interval = positive_millis("MD_PING_INTERVAL_MS", ms)?;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "MD_CONNECT_TIMEOUT_MS")? {
            config.connection.connect_timeout = positive_millis("MD_CONNECT_TIMEOUT_MS", ms)?;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "MD_RECONNECT_INITIAL_MS")? {
            config.connection.initial_reconnect_delay =
                positive_millis("MD_RECONNECT_INITIAL_MS", ms)?;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "MD_RECONNECT_MAX_MS")? {
            config.connection.max_reconnect_delay = positive_millis("MD_RECONNECT_MAX_MS", ms)?;
        }
        if config.connection.max_reconnect_delay < config.connection.initial_reconnect_delay {
            return Err(ConfigError::InvalidVar {
                name: "MD_RECONNECT_MAX_MS",
                value: config.connection.max_reconnect_delay.as_millis().to_string(),
                reason: "must not be below the initial reconnect delay".to_string(),
            });
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "MD_BACKFILL_INTERVAL_SECS")? {
            config.backfill.interval = positive_millis("MD_BACKFILL_INTERVAL_SECS", secs * 1000)?;
        }
        if let Some(tf) = parse_var::<Timeframe, _>(&lookup, "MD_DEFAULT_TIMEFRAME")? {
            config.backfill.default_timeframe = tf;
        }
        if let Some(path) = lookup("MD_WATERMARK_PATH").filter(|p| !p.trim().is_empty()) {
            config.backfill.watermark_path = Some(PathBuf::from(path));
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "MD_INSTRUMENT_SYNC_INTERVAL_SECS")? {
            config.instruments.interval =
                positive_millis("MD_INSTRUMENT_SYNC_INTERVAL_SECS", secs * 1000)?;
        }
        if let Some(enabled) = parse_var::<bool, _>(&lookup, "MD_INSTRUMENT_SYNC_ENABLED")? {
            config.instruments.enabled = enabled;
        }
        if let Some(capacity) = parse_var::<usize, _>(&lookup, "MD_BROADCAST_CAPACITY")? {
            config.broadcast_capacity = positive_count("MD_BROADCAST_CAPACITY", capacity)?;
        }
        if let Some(rows) = parse_var::<usize, _>(&lookup, "MD_TICK_RETENTION")? {
            config.store.tick_retention = positive_count("MD_TICK_RETENTION", rows)?;
        }
        if let Some(rows) = parse_var::<usize, _>(&lookup, "MD_DEPTH_RETENTION")? {
            config.store.depth_retention = positive_count("MD_DEPTH_RETENTION", rows)?;
        }
        if let Some(addr) = parse_var::<SocketAddr, _>(&lookup, "MD_LISTEN_ADDR")? {
            config.listen_addr = addr;
        }

        for exchange in &mut config.exchanges {
            let (ws, api, enabled) = match exchange.exchange.as_str() {
                Exchange::OKX => ("MD_OKX_WS_URL", "MD_OKX_API_URL", "MD_OKX_ENABLED"),
                Exchange::BINANCE => (
                    "MD_BINANCE_WS_URL",
                    "MD_BINANCE_API_URL",
                    "MD_BINANCE_ENABLED",
                ),
                _ => continue,
            };
            if let Some(url) = lookup(ws) {
                exchange.ws_url = url_var(ws, url, &["ws://", "wss://"])?;
            }
            if let Some(url) = lookup(api) {
                exchange.api_url = url_var(api, url, &["http://", "https://"])?;
            }
            if let Some(flag) = parse_var::<bool, _>(&lookup, enabled)? {
                exchange.enabled = flag;
            }
        }

        Ok(config)
    }

    /// Configuration of every enabled exchange.
    pub fn enabled_exchanges(&self) -> impl Iterator<Item = &ExchangeConfig> {
        self.exchanges.iter().filter(|e| e.enabled)
    }
}

fn parse_var<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidVar {
                name,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn positive_millis(name: &'static str, ms: u64) -> Result<Duration, ConfigError> {
    if ms == 0 {
        return Err(ConfigError::InvalidVar {
            name,
            value: ms.to_string(),
            reason: "must be positive".to_string(),
        });
    }
    Ok(Duration::from_millis(ms))
}

fn positive_count(name: &'static str, count: usize) -> Result<usize, ConfigError> {
    if count == 0 {
        return Err(ConfigError::InvalidVar {
            name,
            value: count.to_string(),
            reason: "must be positive".to_string(),
        });
    }
    Ok(count)
}

fn url_var(name: &'static str, url: String, schemes: &[&str]) -> Result<String, ConfigError> {
    if schemes.iter().any(|s| url.starts_with(s)) {
        Ok(url.trim_end_matches('/').to_string())
    } else {
        Err(ConfigError::InvalidVar {
            name,
            value: url,
            reason: format!("expected one of {:?}", schemes),
        })
    }
}
