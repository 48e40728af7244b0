//! Common Types Module
//!
//! Shared primitive types used across the connector to avoid circular
//! dependencies between the order, ledger, and exchange modules.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// Order kind (limit or market)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderKind {
    Limit,
    Market,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderKind::Limit => write!(f, "limit"),
            OrderKind::Market => write!(f, "market"),
        }
    }
}

/// Error returned when a symbol cannot be parsed as a `BASE-QUOTE` pair.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid trading pair: '{0}' (expected BASE-QUOTE, e.g. BTC-USD)")]
pub struct InvalidPair(pub String);

/// A trading pair in `BASE-QUOTE` form (e.g. "BTC-USD").
///
/// Newtype wrapper so symbols cannot be mixed up with asset names or
/// order ids, and so the base/quote split is validated exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TradingPair(String);

impl TradingPair {
    /// Parse a `BASE-QUOTE` symbol.
    pub fn new(symbol: impl Into<String>) -> Result<Self, InvalidPair> {
        let s: String = symbol.into();
        match s.split_once('-') {
            Some((base, quote)) if !base.is_empty() && !quote.is_empty() => Ok(Self(s)),
            _ => Err(InvalidPair(s)),
        }
    }

    /// The full symbol string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base asset (left of the dash).
    #[must_use]
    pub fn base(&self) -> &str {
        self.0.split_once('-').map(|(b, _)| b).unwrap_or(&self.0)
    }

    /// Quote asset (right of the dash).
    #[must_use]
    pub fn quote(&self) -> &str {
        self.0.split_once('-').map(|(_, q)| q).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for TradingPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
