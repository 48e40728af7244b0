//! Deadline bookkeeping for outstanding requests.
//!
//! Every dispatched submit or cancel gets a tracked transaction with a
//! deadline; the polling tick samples [`TransactionTracker::expired`] and
//! converts overdue entries into order transitions. The tracker itself
//! holds no authority over order semantics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::types::ClientOrderId;

/// Request kind a transaction tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnKind {
    Submit,
    Cancel,
}

impl std::fmt::Display for TxnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxnKind::Submit => write!(f, "submit"),
            TxnKind::Cancel => write!(f, "cancel"),
        }
    }
}

/// One outstanding asynchronous request.
///
/// Exists only between dispatch and confirmation-or-timeout.
#[derive(Debug, Clone)]
pub struct TrackedTransaction {
    /// Client order id for submits, synthetic `cancel-{id}-{n}` for cancels
    pub tracking_id: String,
    pub kind: TxnKind,
    pub deadline: DateTime<Utc>,
    /// The order this request belongs to
    pub client_order_id: ClientOrderId,
}

/// Thread-safe tracker of outstanding request deadlines.
#[derive(Clone)]
pub struct TransactionTracker {
    txns: Arc<RwLock<HashMap<String, TrackedTransaction>>>,
    cancel_seq: Arc<AtomicU64>,
}

impl TransactionTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            txns: Arc::new(RwLock::new(HashMap::new())),
            cancel_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Track a submit request; the tracking id is the client order id.
    pub async fn track_submit(&self, order_id: &ClientOrderId, deadline: DateTime<Utc>) -> String {
        let tracking_id = order_id.as_str().to_string();
        let txn = TrackedTransaction {
            tracking_id: tracking_id.clone(),
            kind: TxnKind::Submit,
            deadline,
            client_order_id: order_id.clone(),
        };
        let mut txns = self.txns.write().await;
        txns.insert(tracking_id.clone(), txn);
        debug!(tracking_id = %tracking_id, kind = "submit", "transaction tracked");
        tracking_id
    }

    /// Track a cancel request under a synthetic tracking id, since the
    /// submit transaction may still be alive under the order id itself.
    pub async fn track_cancel(&self, order_id: &ClientOrderId, deadline: DateTime<Utc>) -> String {
        let seq = self.cancel_seq.fetch_add(1, Ordering::Relaxed);
        let tracking_id = format!("cancel-{}-{}", order_id, seq);
        let txn = TrackedTransaction {
            tracking_id: tracking_id.clone(),
            kind: TxnKind::Cancel,
            deadline,
            client_order_id: order_id.clone(),
        };
        let mut txns = self.txns.write().await;
        txns.insert(tracking_id.clone(), txn);
        debug!(tracking_id = %tracking_id, kind = "cancel", "transaction tracked");
        tracking_id
    }

    /// Stop tracking after a confirmation. Returns false when the entry
    /// had already been removed (e.g. by a timeout).
    pub async fn stop(&self, tracking_id: &str) -> bool {
        let mut txns = self.txns.write().await;
        let removed = txns.remove(tracking_id).is_some();
        if removed {
            debug!(tracking_id = %tracking_id, "transaction confirmed");
        }
        removed
    }

    /// Remove every transaction belonging to an order (used when the
    /// order reaches a terminal state through another channel).
    pub async fn stop_for_order(&self, order_id: &ClientOrderId) -> usize {
        let mut txns = self.txns.write().await;
        let before = txns.len();
        txns.retain(|_, t| t.client_order_id != *order_id);
        before - txns.len()
    }

    /// Remove and return every transaction whose deadline has passed.
    pub async fn expired(&self, now: DateTime<Utc>) -> Vec<TrackedTransaction> {
        let mut txns = self.txns.write().await;
        let overdue: Vec<String> = txns
            .values()
            .filter(|t| t.deadline <= now)
            .map(|t| t.tracking_id.clone())
            .collect();

        overdue
            .iter()
            .filter_map(|id| txns.remove(id))
            .collect()
    }

    #[must_use]
    pub async fn len(&self) -> usize {
        let txns = self.txns.read().await;
        txns.len()
    }

    #[must_use]
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for TransactionTracker {
    fn default() -> Self {
        Self::new()
    }
}
