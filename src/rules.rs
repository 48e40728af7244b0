//! Trading rules cache.
//!
//! Per-symbol constraints (minimum size, increments) fetched from the
//! exchange and swapped wholesale on each refresh. Validation here is a
//! cost-saving precondition check before a request is dispatched; the
//! exchange remains the authority.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::exchange::{ExchangeError, ExchangeTransport, TradingRule};

/// Precondition violations detected before dispatch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleViolation {
    #[error("invalid order size for {symbol}: {amount} (min {min}, increment {increment})")]
    InvalidOrderSize {
        symbol: String,
        amount: Decimal,
        min: Decimal,
        increment: Decimal,
    },

    #[error("invalid price increment for {symbol}: {price} (increment {increment})")]
    InvalidPriceIncrement {
        symbol: String,
        price: Decimal,
        increment: Decimal,
    },
}

/// Thread-safe cache of per-symbol trading rules.
#[derive(Clone, Default)]
pub struct TradingRulesCache {
    rules: Arc<RwLock<HashMap<String, TradingRule>>>,
}

impl TradingRulesCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the full rule set and atomically swap the cache.
    pub async fn refresh(&self, transport: &dyn ExchangeTransport) -> Result<usize, ExchangeError> {
        let fetched = transport.fetch_trading_rules().await?;
        let count = fetched.len();
        let map: HashMap<String, TradingRule> = fetched
            .into_iter()
            .map(|r| (r.symbol.clone(), r))
            .collect();

        let mut rules = self.rules.write().await;
        *rules = map;
        debug!(count = count, "trading rules refreshed");
        Ok(count)
    }

    /// Replace the rule set directly (startup seeding and tests).
    pub async fn set_rules(&self, fetched: Vec<TradingRule>) {
        let map: HashMap<String, TradingRule> = fetched
            .into_iter()
            .map(|r| (r.symbol.clone(), r))
            .collect();
        let mut rules = self.rules.write().await;
        *rules = map;
    }

    /// Check amount and price against the symbol's rule.
    ///
    /// A symbol with no cached rule passes with a warning; the check only
    /// exists to avoid paying for requests the exchange would reject.
    pub async fn validate(
        &self,
        symbol: &str,
        amount: Decimal,
        price: Option<Decimal>,
    ) -> Result<(), RuleViolation> {
        let rules = self.rules.read().await;
        let Some(rule) = rules.get(symbol) else {
            warn!(symbol = symbol, "no trading rule cached, skipping validation");
            return Ok(());
        };

        if amount < rule.min_order_size
            || (!rule.size_increment.is_zero() && !(amount % rule.size_increment).is_zero())
        {
            return Err(RuleViolation::InvalidOrderSize {
                symbol: symbol.to_string(),
                amount,
                min: rule.min_order_size,
                increment: rule.size_increment,
            });
        }

        if let Some(price) = price {
            if !rule.price_increment.is_zero() && !(price % rule.price_increment).is_zero() {
                return Err(RuleViolation::InvalidPriceIncrement {
                    symbol: symbol.to_string(),
                    price,
                    increment: rule.price_increment,
                });
            }
        }

        Ok(())
    }

    pub async fn get(&self, symbol: &str) -> Option<TradingRule> {
        let rules = self.rules.read().await;
        rules.get(symbol).cloned()
    }

    #[must_use]
    pub async fn len(&self) -> usize {
        let rules = self.rules.read().await;
        rules.len()
    }

    #[must_use]
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn btc_rule() -> TradingRule {
        TradingRule {
            symbol: "BTC-USD".to_string(),
            min_order_size: dec!(0.001),
            price_increment: dec!(0.01),
            size_increment: dec!(0.0001),
        }
    }

    #[tokio::test]
    async fn test_validate_passes_conforming_order() {
        let cache = TradingRulesCache::new();
        cache.set_rules(vec![btc_rule()]).await;

        assert!(cache
            .validate("BTC-USD", dec!(0.5), Some(dec!(43000.25)))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_validate_rejects_below_minimum() {
        let cache = TradingRulesCache::new();
        cache.set_rules(vec![btc_rule()]).await;

        let err = cache
            .validate("BTC-USD", dec!(0.0005), Some(dec!(43000)))
            .await
            .unwrap_err();
        assert!(matches!(err, RuleViolation::InvalidOrderSize { .. }));
    }

    #[tokio::test]
    async fn test_validate_rejects_off_increment_size() {
        let cache = TradingRulesCache::new();
        cache.set_rules(vec![btc_rule()]).await;

        let err = cache
            .validate("BTC-USD", dec!(0.00015), Some(dec!(43000)))
            .await
            .unwrap_err();
        assert!(matches!(err, RuleViolation::InvalidOrderSize { .. }));
    }

    #[tokio::test]
    async fn test_validate_rejects_off_increment_price() {
        let cache = TradingRulesCache::new();
        cache.set_rules(vec![btc_rule()]).await;

        let err = cache
            .validate("BTC-USD", dec!(0.5), Some(dec!(43000.005)))
            .await
            .unwrap_err();
        assert!(matches!(err, RuleViolation::InvalidPriceIncrement { .. }));
    }

    #[tokio::test]
    async fn test_unknown_symbol_passes_with_warning() {
        let cache = TradingRulesCache::new();
        assert!(cache.validate("DOGE-USD", dec!(1), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_set_rules_swaps_wholesale() {
        let cache = TradingRulesCache::new();
        cache.set_rules(vec![btc_rule()]).await;
        assert_eq!(cache.len().await, 1);

        cache
            .set_rules(vec![TradingRule {
                symbol: "ETH-USD".to_string(),
                min_order_size: dec!(0.01),
                price_increment: dec!(0.01),
                size_increment: dec!(0.001),
            }])
            .await;
        assert!(cache.get("BTC-USD").await.is_none());
        assert!(cache.get("ETH-USD").await.is_some());
    }
}
