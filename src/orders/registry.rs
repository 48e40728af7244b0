//! In-flight order registry with a monotonic state machine.
//!
//! The registry is the single local source of truth for what this process
//! believes is happening to each order. Dispatch results, poll snapshots,
//! and stream events all converge on [`InFlightOrderRegistry::apply`],
//! which merges observations idempotently and never regresses state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::types::{AppliedChange, ClientOrderId, InFlightOrder, OrderObservation, OrderStatus};

/// Errors surfaced by cancel preconditions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// No order with this client id is tracked
    #[error("order not found: {0}")]
    OrderNotFound(ClientOrderId),

    /// The order already reached a terminal state
    #[error("order {0} is already terminal ({1})")]
    OrderAlreadyTerminal(ClientOrderId, OrderStatus),
}

/// Thread-safe registry of in-flight orders.
///
/// All mutation happens inside a single write-lock critical section with
/// no awaits while the lock is held, so poll, stream, and facade updates
/// never interleave mid-merge.
///
/// # Memory Management
///
/// Terminal orders are retained for a configurable window so late
/// duplicate events can still be matched, then removed by
/// [`evict_terminal`](Self::evict_terminal) on the polling tick.
#[derive(Clone)]
pub struct InFlightOrderRegistry {
    orders: Arc<RwLock<HashMap<ClientOrderId, InFlightOrder>>>,
    retention: Duration,
}

impl InFlightOrderRegistry {
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            orders: Arc::new(RwLock::new(HashMap::new())),
            retention,
        }
    }

    /// Register a freshly created order (status `CreatedLocal`).
    pub async fn insert(&self, order: InFlightOrder) {
        let id = order.client_order_id.clone();
        let mut orders = self.orders.write().await;
        orders.insert(id.clone(), order);
        debug!(order_id = %id, "order registered");
    }

    /// Merge one observation into the tracked order.
    ///
    /// Monotonic and idempotent:
    /// - the exchange order id is set only if not already set;
    /// - cumulative fill takes the maximum of known and observed, clamped
    ///   to the requested amount;
    /// - the status advances only if the observed (or fill-implied) status
    ///   outranks the current one; anything else is discarded as stale;
    /// - a fill that reaches the requested amount implies `Filled`, a
    ///   partial fill implies `PartiallyFilled`.
    ///
    /// Returns what actually changed, or `None` when the observation was
    /// a no-op (stale, duplicate, or for an unknown order).
    pub async fn apply(
        &self,
        id: &ClientOrderId,
        obs: OrderObservation,
    ) -> Option<AppliedChange> {
        let mut orders = self.orders.write().await;

        let Some(order) = orders.get_mut(id) else {
            warn!(order_id = %id, "observation for unknown order discarded");
            return None;
        };

        let mut changed = false;

        if order.exchange_order_id.is_none() {
            if let Some(eid) = obs.exchange_order_id {
                debug!(order_id = %id, exchange_id = %eid, "exchange order id assigned");
                order.exchange_order_id = Some(eid);
                changed = true;
            }
        }

        // Fills merge by max: cumulative values from different sources can
        // arrive out of order but never shrink.
        let mut fill_delta = Decimal::ZERO;
        if let Some(observed) = obs.filled {
            let mut observed = observed;
            if observed > order.amount {
                warn!(
                    order_id = %id,
                    observed = %observed,
                    requested = %order.amount,
                    "observed fill exceeds requested amount, clamping"
                );
                observed = order.amount;
            }
            if observed > order.filled {
                fill_delta = observed - order.filled;
                order.filled = observed;
                changed = true;
            }
        }

        let previous = order.status;
        if !previous.is_terminal() {
            // A fill observation implies a status even when the source
            // reported none (or a stale one).
            let implied = match obs.filled {
                Some(_) if order.filled >= order.amount && !order.amount.is_zero() => {
                    Some(OrderStatus::Filled)
                }
                Some(_) if order.filled > Decimal::ZERO => Some(OrderStatus::PartiallyFilled),
                _ => None,
            };

            let candidate = match (obs.status, implied) {
                (Some(a), Some(b)) => Some(if a.rank() >= b.rank() { a } else { b }),
                (a, b) => a.or(b),
            };

            if let Some(next) = candidate {
                if next.rank() > previous.rank() {
                    order.status = next;
                    if next.is_terminal() {
                        order.precancel_status = None;
                    }
                    changed = true;
                    info!(
                        order_id = %id,
                        symbol = %order.pair,
                        old_status = %previous,
                        new_status = %next,
                        filled = %order.filled,
                        requested = %order.amount,
                        "order state updated"
                    );
                } else if obs.status.is_some() {
                    debug!(
                        order_id = %id,
                        current = %previous,
                        observed = %next,
                        "stale observation discarded"
                    );
                }
            }
        }

        if !changed {
            return None;
        }

        order.updated_at = obs.observed_at;
        Some(AppliedChange {
            previous,
            current: order.status,
            fill_delta,
            order: order.clone(),
        })
    }

    /// Move an order to `CancelRequested`, stashing the prior status for
    /// rollback. Idempotent for an already cancel-requested order.
    pub async fn begin_cancel(
        &self,
        id: &ClientOrderId,
    ) -> Result<InFlightOrder, RegistryError> {
        let mut orders = self.orders.write().await;

        let Some(order) = orders.get_mut(id) else {
            return Err(RegistryError::OrderNotFound(id.clone()));
        };
        if order.status.is_terminal() {
            return Err(RegistryError::OrderAlreadyTerminal(id.clone(), order.status));
        }
        if order.status != OrderStatus::CancelRequested {
            order.precancel_status = Some(order.status);
            order.status = OrderStatus::CancelRequested;
            order.updated_at = Utc::now();
            info!(order_id = %id, "cancel requested");
        }
        Ok(order.clone())
    }

    /// Roll a failed or timed-out cancel back to its pre-cancel status.
    ///
    /// The order may still be live on the exchange, so it must keep being
    /// tracked rather than be declared canceled.
    pub async fn revert_cancel(&self, id: &ClientOrderId) -> Option<InFlightOrder> {
        let mut orders = self.orders.write().await;
        let order = orders.get_mut(id)?;

        if order.status != OrderStatus::CancelRequested {
            return None;
        }
        let restored = order.precancel_status.take().unwrap_or(OrderStatus::Open);
        warn!(
            order_id = %id,
            restored = %restored,
            "cancel request not confirmed, restoring pre-cancel status"
        );
        order.status = restored;
        order.updated_at = Utc::now();
        Some(order.clone())
    }

    /// Get a snapshot of one order.
    pub async fn get(&self, id: &ClientOrderId) -> Option<InFlightOrder> {
        let orders = self.orders.read().await;
        orders.get(id).cloned()
    }

    /// All non-terminal orders.
    pub async fn active_orders(&self) -> Vec<InFlightOrder> {
        let orders = self.orders.read().await;
        orders
            .values()
            .filter(|o| !o.is_terminal())
            .cloned()
            .collect()
    }

    #[must_use]
    pub async fn order_count(&self) -> usize {
        let orders = self.orders.read().await;
        orders.len()
    }

    #[must_use]
    pub async fn active_order_count(&self) -> usize {
        let orders = self.orders.read().await;
        orders.values().filter(|o| !o.is_terminal()).count()
    }

    /// Remove terminal orders older than the retention window.
    ///
    /// Returns the number of evicted orders. Called on the polling tick
    /// to bound memory.
    pub async fn evict_terminal(&self, now: DateTime<Utc>) -> usize {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return 0;
        };
        let cutoff = now - retention;
        let mut orders = self.orders.write().await;

        let to_remove: Vec<ClientOrderId> = orders
            .iter()
            .filter(|(_, o)| o.is_terminal() && o.updated_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &to_remove {
            orders.remove(id);
        }
        if !to_remove.is_empty() {
            debug!(count = to_remove.len(), "evicted terminal orders");
        }
        to_remove.len()
    }
}
