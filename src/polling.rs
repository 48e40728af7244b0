//! Periodic reconciliation against exchange snapshot state.
//!
//! The polling loop is the fallback truth source: it repairs whatever the
//! stream missed, sweeps expired request deadlines, confirms orders that
//! vanished from the exchange's open-order list, refreshes trading rules,
//! and evicts terminal orders past their retention window.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::connector::ConnectorCore;
use crate::exchange::OrderSnapshot;
use crate::orders::{ClientOrderId, InFlightOrder, TxnKind};

pub(crate) struct StatusPollingLoop {
    core: Arc<ConnectorCore>,
    trigger: Arc<Notify>,
    /// When each acknowledged order was first seen absent from the
    /// open-order snapshot. Only this task touches it.
    missing_since: HashMap<ClientOrderId, DateTime<Utc>>,
}

impl StatusPollingLoop {
    pub(crate) fn new(core: Arc<ConnectorCore>, trigger: Arc<Notify>) -> Self {
        Self {
            core,
            trigger,
            missing_since: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let trigger = self.trigger.clone();
        let mut ticker = interval(self.core.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rules_ticker = interval(self.core.config.rules_refresh_interval);
        rules_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Both intervals fire immediately on the first tick; start() already
        // did the initial sync, so swallow those.
        ticker.tick().await;
        rules_ticker.tick().await;

        debug!(interval = ?self.core.config.poll_interval, "status polling loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.bounded_cycle().await,
                _ = trigger.notified() => {
                    debug!("out-of-cycle poll triggered");
                    self.bounded_cycle().await;
                }
                _ = rules_ticker.tick() => self.refresh_rules().await,
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("status polling loop stopped");
    }

    /// One cycle, abandoned if it outlasts a full poll interval.
    async fn bounded_cycle(&mut self) {
        let limit = self.core.config.poll_interval;
        if timeout(limit, self.poll_cycle()).await.is_err() {
            warn!("poll cycle exceeded the poll interval, abandoning");
        }
    }

    async fn refresh_rules(&self) {
        match self.core.rules.refresh(self.core.transport.as_ref()).await {
            Ok(count) => debug!(count = count, "trading rules refreshed"),
            Err(e) => {
                if e.is_fatal() {
                    error!(error = %e, "fatal transport error refreshing trading rules");
                    self.core.initiate_shutdown();
                    return;
                }
                warn!(error = %e, "trading-rule refresh failed, keeping previous rules");
            }
        }
    }

    async fn poll_cycle(&mut self) {
        let now = Utc::now();

        // Sweep deadlines first so a submit that never got acknowledged is
        // expired before this cycle's snapshot could be misread as progress.
        for txn in self.core.tracker.expired(now).await {
            match txn.kind {
                TxnKind::Submit => self.core.expire_order(&txn.client_order_id).await,
                TxnKind::Cancel => {
                    warn!(
                        order_id = %txn.client_order_id,
                        "cancel deadline passed without confirmation, reverting"
                    );
                    self.core.registry.revert_cancel(&txn.client_order_id).await;
                }
            }
        }

        match self.core.transport.fetch_balances().await {
            Ok(snapshots) => {
                for snapshot in snapshots {
                    self.core.apply_balance_snapshot(snapshot).await;
                }
            }
            Err(e) => {
                if e.is_fatal() {
                    error!(error = %e, "fatal transport error fetching balances");
                    self.core.initiate_shutdown();
                    return;
                }
                warn!(error = %e, "balance poll failed");
            }
        }

        let active = self.core.registry.active_orders().await;
        if !active.is_empty() {
            self.reconcile_orders(active).await;
        }

        let evicted = self.core.registry.evict_terminal(now).await;
        if evicted > 0 {
            debug!(count = evicted, "evicted retained terminal orders");
        }
    }

    async fn reconcile_orders(&mut self, active: Vec<InFlightOrder>) {
        let snapshots = match self.core.transport.fetch_open_orders().await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                if e.is_fatal() {
                    error!(error = %e, "fatal transport error fetching open orders");
                    self.core.initiate_shutdown();
                } else {
                    warn!(error = %e, "open-order poll failed");
                }
                return;
            }
        };

        let by_id: HashMap<ClientOrderId, OrderSnapshot> = snapshots
            .into_iter()
            .map(|s| (s.client_order_id.clone(), s))
            .collect();

        for order in &active {
            match by_id.get(&order.client_order_id) {
                Some(snapshot) => {
                    self.missing_since.remove(&order.client_order_id);
                    self.core.apply_snapshot(snapshot.clone()).await;
                }
                // Unacknowledged orders are expected to be absent; the
                // submit deadline covers them.
                None if order.status.is_acknowledged() => self.confirm_missing(order).await,
                None => {}
            }
        }

        // Drop absence clocks for orders that are no longer tracked as
        // active (terminal, evicted, or resolved above).
        let active_ids: HashSet<&ClientOrderId> =
            active.iter().map(|o| &o.client_order_id).collect();
        self.missing_since.retain(|id, _| active_ids.contains(id));
    }

    /// An acknowledged order is absent from the open-order snapshot. It
    /// may have just filled or canceled (the snapshot races the stream),
    /// so give it a grace window from first absence, then confirm with a
    /// direct query before declaring it lost.
    async fn confirm_missing(&mut self, order: &InFlightOrder) {
        let grace = chrono::Duration::from_std(self.core.config.missing_order_grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let now = Utc::now();
        let since = *self
            .missing_since
            .entry(order.client_order_id.clone())
            .or_insert(now);
        if now - since < grace {
            return;
        }

        match self.core.transport.fetch_order(&order.client_order_id).await {
            Ok(Some(snapshot)) => {
                self.missing_since.remove(&order.client_order_id);
                self.core.apply_snapshot(snapshot).await;
            }
            Ok(None) => {
                self.missing_since.remove(&order.client_order_id);
                self.core
                    .fail_order(&order.client_order_id, "order not found on exchange")
                    .await;
            }
            Err(e) => {
                if e.is_fatal() {
                    error!(error = %e, "fatal transport error confirming missing order");
                    self.core.initiate_shutdown();
                    return;
                }
                warn!(
                    order_id = %order.client_order_id,
                    error = %e,
                    "missing-order confirmation failed, will retry next cycle"
                );
            }
        }
    }
}
