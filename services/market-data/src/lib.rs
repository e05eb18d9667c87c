//! Market Data Service
//!
//! Ingests live ticks and order-book depth from exchange streams, keeps a
//! local store consistent with upstream, and redistributes every update to
//! in-process subscribers. Historical bars are backfilled on a schedule and
//! upserted by natural key.
//!
//! # Architecture
//!
//! ```text
//!  Symbol Registry
//!        │
//!   ┌────▼──────┐     control frames      ┌──────────┐
//!   │Reconciler ├────────────────────────►│ Exchange │
//!   └───────────┘                         │Connection│
//!                                         └────┬─────┘
//!                                              │ inbound frames
//!                                         ┌────▼─────┐
//!                                         │Dispatcher│
//!                                         └┬───────┬─┘
//!                               tick path  │       │  depth path
//!                          ┌───────────────┘       └──────────┐
//!                     ┌────▼────┐   ┌──────────┐         ┌────▼────┐
//!                     │  Store  │◄──┤ Flusher  │◄────────┤  Cache  │
//!                     └─────────┘   └──────────┘         └─────────┘
//!                          ▲                                  │
//!   ┌─────────┐            │           ┌─────────┐            │
//!   │Backfill ├────────────┘           │Broadcast│◄───────────┘
//!   └─────────┘                        └─────────┘   (ticks too)
//! ```
//!
//! One [`connection::ExchangeConnection`] runs per exchange. Everything is
//! owned by [`engine::MarketDataEngine`].

pub mod adapters;
pub mod backfill;
pub mod backoff;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod flusher;
pub mod instruments;
pub mod metrics;
pub mod reconciler;
pub mod registry;
pub mod store;
pub mod transport;

pub use config::EngineConfig;
pub use engine::MarketDataEngine;
pub use error::EngineError;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
