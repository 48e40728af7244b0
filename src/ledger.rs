//! Per-asset balance ledger.
//!
//! Tracks total and available balance per asset. Poll snapshots replace
//! values wholesale, stream deltas adjust them, and order placement takes
//! optimistic reservations so the caller sees an immediately-consistent
//! view without waiting for the exchange to confirm the debit.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Total and available balance for one asset.
///
/// Invariant: `0 <= available <= total`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub asset: String,
    pub total: Decimal,
    pub available: Decimal,
}

/// Errors from reservation attempts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BalanceError {
    /// The reservation would drive available balance below zero
    #[error("insufficient {asset} balance: requested {requested}, available {available}")]
    InsufficientBalance {
        asset: String,
        requested: Decimal,
        available: Decimal,
    },
}

/// Thread-safe balance ledger.
///
/// Mutated only by confirmed poll snapshots, stream deltas, and local
/// reservation/release tied to order lifecycle transitions.
#[derive(Clone, Default)]
pub struct BalanceLedger {
    balances: Arc<RwLock<HashMap<String, BalanceEntry>>>,
}

impl BalanceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace an asset's balances wholesale (poll snapshot).
    ///
    /// Returns the updated entry when the values actually changed, so
    /// callers can emit a notification only on real change.
    pub async fn apply_snapshot(
        &self,
        asset: &str,
        total: Decimal,
        available: Decimal,
    ) -> Option<BalanceEntry> {
        let available = if available > total {
            warn!(asset = asset, %available, %total, "snapshot available exceeds total, clamping");
            total
        } else {
            available
        };
        let entry = BalanceEntry {
            asset: asset.to_string(),
            total,
            available,
        };

        let mut balances = self.balances.write().await;
        let changed = balances.get(asset) != Some(&entry);
        if changed {
            debug!(asset = asset, %total, %available, "balance snapshot applied");
            balances.insert(asset.to_string(), entry.clone());
            Some(entry)
        } else {
            None
        }
    }

    /// Adjust an asset's balances by signed deltas (stream event).
    ///
    /// Results are clamped into `0 <= available <= total` with a warning,
    /// since a delta applied on top of a fresher snapshot can overshoot.
    pub async fn apply_delta(
        &self,
        asset: &str,
        total_delta: Decimal,
        available_delta: Decimal,
    ) -> BalanceEntry {
        let mut balances = self.balances.write().await;
        let entry = balances
            .entry(asset.to_string())
            .or_insert_with(|| BalanceEntry {
                asset: asset.to_string(),
                total: Decimal::ZERO,
                available: Decimal::ZERO,
            });

        let total = entry.total + total_delta;
        if total < Decimal::ZERO {
            warn!(asset = asset, %total, "balance delta drove total negative, clamping to zero");
        }
        entry.total = total.max(Decimal::ZERO);

        let available = entry.available + available_delta;
        if available < Decimal::ZERO || available > entry.total {
            warn!(
                asset = asset,
                %available,
                total = %entry.total,
                "balance delta drove available out of range, clamping"
            );
        }
        entry.available = available.clamp(Decimal::ZERO, entry.total);

        debug!(
            asset = asset,
            total = %entry.total,
            available = %entry.available,
            "balance delta applied"
        );
        entry.clone()
    }

    /// Optimistically debit available balance for a new order.
    ///
    /// This is the only synchronous rejection path before a request is
    /// dispatched; total balance is untouched.
    pub async fn reserve(&self, asset: &str, amount: Decimal) -> Result<(), BalanceError> {
        let mut balances = self.balances.write().await;
        let available = balances.get(asset).map_or(Decimal::ZERO, |e| e.available);

        if amount > available {
            return Err(BalanceError::InsufficientBalance {
                asset: asset.to_string(),
                requested: amount,
                available,
            });
        }
        if let Some(entry) = balances.get_mut(asset) {
            entry.available -= amount;
            debug!(asset = asset, %amount, available = %entry.available, "balance reserved");
        }
        Ok(())
    }

    /// Return a previously reserved amount to available balance.
    ///
    /// Capped at total, since a confirmed snapshot may already have
    /// reflected the release.
    pub async fn release(&self, asset: &str, amount: Decimal) -> Option<BalanceEntry> {
        if amount.is_zero() {
            return None;
        }
        let mut balances = self.balances.write().await;
        let Some(entry) = balances.get_mut(asset) else {
            warn!(asset = asset, %amount, "release for unknown asset ignored");
            return None;
        };

        let available = entry.available + amount;
        if available > entry.total {
            warn!(
                asset = asset,
                %available,
                total = %entry.total,
                "release overshoots total, capping"
            );
        }
        entry.available = available.min(entry.total);
        debug!(asset = asset, %amount, available = %entry.available, "balance released");
        Some(entry.clone())
    }

    pub async fn get(&self, asset: &str) -> Option<BalanceEntry> {
        let balances = self.balances.read().await;
        balances.get(asset).cloned()
    }

    pub async fn all(&self) -> Vec<BalanceEntry> {
        let balances = self.balances.read().await;
        balances.values().cloned().collect()
    }
}
