//! Error types for the market data model
//!
//! Validation failures raised while building model values from external
//! input (exchange payloads, control requests, configuration).

use thiserror::Error;

/// Model validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Unknown timeframe: {0}")]
    UnknownTimeframe(String),

    #[error("Unknown instrument kind: {0}")]
    UnknownInstrumentKind(String),

    #[error("Unknown data kind: {0}")]
    UnknownDataKind(String),

    #[error("Timeframe is required for ohlc subscriptions")]
    MissingTimeframe,

    #[error("Invalid decimal for {field}: {value}")]
    InvalidDecimal { field: &'static str, value: String },

    #[error("Empty symbol")]
    EmptySymbol,
}
