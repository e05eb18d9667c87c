//! Types library for the market data platform
//!
//! This library provides the data model shared by the ingestion engine and
//! the services that read what it stores.
//!
//! # Modules
//! - `ids`: Identifiers (TickId, SubscriptionId, Symbol, Exchange)
//! - `instrument`: Instrument metadata
//! - `tick`: Price ticks and depth snapshots
//! - `bar`: OHLCV bars and timeframes
//! - `subscription`: User subscriptions and data kinds
//! - `errors`: Validation errors

pub mod bar;
pub mod errors;
pub mod ids;
pub mod instrument;
pub mod subscription;
pub mod tick;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bar::*;
    pub use crate::errors::*;
    pub use crate::ids::*;
    pub use crate::instrument::*;
    pub use crate::subscription::*;
    pub use crate::tick::*;
}
