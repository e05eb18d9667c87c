//! Instrument metadata
//!
//! An instrument is identified by (exchange, instrument id). Sync cycles
//! overwrite the full set for an (exchange, kind) pair; there is no soft
//! delete.

use crate::errors::ValidationError;
use crate::ids::{Exchange, Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Instrument kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstrumentKind {
    Spot,
    Futures,
    Swap,
    Option,
    Margin,
}

impl InstrumentKind {
    pub fn all() -> &'static [InstrumentKind] {
        &[
            InstrumentKind::Spot,
            InstrumentKind::Futures,
            InstrumentKind::Swap,
            InstrumentKind::Option,
            InstrumentKind::Margin,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentKind::Spot => "SPOT",
            InstrumentKind::Futures => "FUTURES",
            InstrumentKind::Swap => "SWAP",
            InstrumentKind::Option => "OPTION",
            InstrumentKind::Margin => "MARGIN",
        }
    }
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstrumentKind {
    type Err = ValidationError;

    /// Accepts venue spellings as well; Binance perpetuals map to `Swap`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SPOT" => Ok(InstrumentKind::Spot),
            "FUTURES" | "CURRENT_QUARTER" | "NEXT_QUARTER" => Ok(InstrumentKind::Futures),
            "SWAP" | "PERPETUAL" | "PERPETUAL_COIN" => Ok(InstrumentKind::Swap),
            "OPTION" => Ok(InstrumentKind::Option),
            "MARGIN" => Ok(InstrumentKind::Margin),
            _ => Err(ValidationError::UnknownInstrumentKind(s.to_string())),
        }
    }
}

/// Lifecycle state of an instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentState {
    Active,
    Suspended,
}

impl InstrumentState {
    /// Map a venue state string ("live", "TRADING", "suspend", "BREAK", ...)
    pub fn from_venue(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "live" | "trading" => InstrumentState::Active,
            _ => InstrumentState::Suspended,
        }
    }
}

/// Instrument metadata as synced from an exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub exchange: Exchange,
    pub instrument_id: Symbol,
    pub kind: InstrumentKind,
    pub base_currency: String,
    pub quote_currency: String,
    pub settle_currency: Option<String>,
    /// Contract value (derivatives only)
    pub contract_value: Option<Decimal>,
    /// Contract multiplier (derivatives only)
    pub contract_multiplier: Option<Decimal>,
    /// Currency of the contract value (derivatives only)
    pub contract_value_currency: Option<String>,
    pub state: InstrumentState,
}

impl Instrument {
    pub fn is_active(&self) -> bool {
        self.state == InstrumentState::Active
    }
}
