//! Exchange Abstraction Layer
//!
//! Exchange-agnostic collaborator contracts the connector core depends
//! on. Wire formats, request signing, and payload parsing live behind
//! these traits; a new exchange is added by implementing them, never by
//! touching the core.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::orders::{ClientOrderId, ExchangeOrderId, OrderStatus};
use crate::types::{OrderKind, OrderSide, TradingPair};

/// Errors produced by the transport and stream collaborators.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("network error: {0}")]
    Network(String),

    /// Authentication failures are fatal: retrying will not help.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The exchange understood the request and said no.
    #[error("rejected by exchange: {0}")]
    Rejected(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ExchangeError {
    /// Fatal errors stop the connector instead of being retried.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Parameters for a new order, handed to the transport as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: ClientOrderId,
    pub pair: TradingPair,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub amount: Decimal,
    pub price: Option<Decimal>,
}

/// Exchange-reported state of one order, already parsed by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub client_order_id: ClientOrderId,
    pub exchange_order_id: Option<ExchangeOrderId>,
    pub status: OrderStatus,
    /// Cumulative filled quantity
    pub filled: Decimal,
}

/// Exchange-reported balances for one asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub asset: String,
    pub total: Decimal,
    pub available: Decimal,
}

/// Per-symbol order constraints, refreshed wholesale on a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingRule {
    pub symbol: String,
    pub min_order_size: Decimal,
    pub price_increment: Decimal,
    pub size_increment: Decimal,
}

/// Push events from the exchange's persistent stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Fill/cancel/ack progress for one order
    OrderUpdate(OrderSnapshot),
    /// Signed balance deltas for one asset
    BalanceUpdate {
        asset: String,
        total_delta: Decimal,
        available_delta: Decimal,
    },
    /// The connection dropped; events in the gap are lost
    Disconnected,
}

/// Request/response surface of the exchange. Implementations own signing,
/// serialization, and HTTP plumbing.
#[async_trait]
pub trait ExchangeTransport: Send + Sync {
    /// Submit a new order; `Ok` carries the exchange-assigned id.
    async fn submit_order(&self, request: &OrderRequest)
        -> Result<ExchangeOrderId, ExchangeError>;

    /// Cancel an acknowledged order.
    async fn cancel_order(&self, exchange_order_id: &ExchangeOrderId)
        -> Result<(), ExchangeError>;

    /// Full account balance snapshot.
    async fn fetch_balances(&self) -> Result<Vec<BalanceSnapshot>, ExchangeError>;

    /// Snapshot of every currently open order.
    async fn fetch_open_orders(&self) -> Result<Vec<OrderSnapshot>, ExchangeError>;

    /// Direct status query for one order; `Ok(None)` means the exchange
    /// definitively does not know it.
    async fn fetch_order(
        &self,
        client_order_id: &ClientOrderId,
    ) -> Result<Option<OrderSnapshot>, ExchangeError>;

    /// Current trading rules for all symbols.
    async fn fetch_trading_rules(&self) -> Result<Vec<TradingRule>, ExchangeError>;
}

/// Source of the persistent push stream.
///
/// Each successful `subscribe` yields a fresh event receiver; the core
/// resubscribes after a disconnect and triggers an out-of-cycle poll to
/// cover the gap.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn subscribe(&self) -> Result<mpsc::Receiver<StreamEvent>, ExchangeError>;
}
