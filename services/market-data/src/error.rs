//! Error types for the market data engine
//!
//! One enum per concern. None of these escape the background tasks: the
//! connection, flusher and schedulers log them and carry on. Only the
//! on-demand control operations return them to a caller.

use thiserror::Error;
use types::prelude::{DataKind, ValidationError};

/// An inbound frame could not be turned into normalized events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed JSON: {0}")]
    Json(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("unknown channel: {0}")]
    UnknownChannel(String),
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        ParseError::Json(err.to_string())
    }
}

impl From<ValidationError> for ParseError {
    fn from(err: ValidationError) -> Self {
        ParseError::InvalidValue {
            field: "model",
            value: err.to_string(),
        }
    }
}

/// Streaming transport failures. Always answered with a reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("outbound frame rejected")]
    SendRejected,

    #[error("transport closed")]
    Closed,

    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Store write failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Exchange REST failures.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("exchange returned error code {code}: {message}")]
    Exchange { code: String, message: String },

    #[error("response parse failed: {0}")]
    Parse(#[from] ParseError),
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {name}={value}: {reason}")]
    InvalidVar {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Subscription reconciliation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("registry lookup failed: {0}")]
    Registry(#[from] StoreError),

    #[error("{op} frame for {kind} rejected by transport")]
    SendRejected { kind: DataKind, op: &'static str },

    #[error("no live connection")]
    NotConnected,
}

/// Watermark persistence failures.
#[derive(Debug, Error)]
pub enum WatermarkError {
    #[error("watermark file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("watermark file corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Top-level error for control operations on the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown exchange: {0}")]
    UnknownExchange(String),

    #[error("engine not started")]
    NotStarted,

    #[error("engine already started")]
    AlreadyStarted,

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Watermark(#[from] WatermarkError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
