//! Core types for in-flight order tracking.
//!
//! Provides type-safe order identifiers, the order status state machine,
//! and the observation type that all update sources converge on.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{OrderKind, OrderSide, TradingPair};

/// Client-assigned order identifier, stable from local creation.
///
/// Newtype wrapper so client ids cannot be confused with exchange ids
/// or other strings at compile time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientOrderId(String);

impl ClientOrderId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let s: String = id.into();
        debug_assert!(!s.is_empty(), "ClientOrderId cannot be empty");
        Self(s)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientOrderId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ClientOrderId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Exchange-assigned order identifier, known only after acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeOrderId(String);

impl ExchangeOrderId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExchangeOrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ExchangeOrderId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Order lifecycle states.
///
/// The happy path is `CreatedLocal -> PendingAck -> Open ->
/// PartiallyFilled -> Filled`; the cancel path branches through
/// `CancelRequested -> Canceled`. Any non-terminal state can jump to
/// `Failed` (explicit rejection) or `Expired` (submit deadline passed
/// with no acknowledgment).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Created locally, not yet handed to the request queue
    CreatedLocal,
    /// Request dispatched, awaiting exchange acknowledgment
    PendingAck,
    /// Acknowledged by the exchange, resting on the book
    Open,
    /// Some quantity executed, remainder still working
    PartiallyFilled,
    /// Cancel request dispatched, outcome not yet known
    CancelRequested,
    /// Fully executed (terminal)
    Filled,
    /// Canceled by user or exchange (terminal)
    Canceled,
    /// Rejected by the exchange or the transport (terminal)
    Failed,
    /// Submit deadline passed with no acknowledgment (terminal)
    Expired,
}

impl OrderStatus {
    /// Position in the monotonic ordering used by apply-transition.
    ///
    /// An observation whose status ranks at or below the current status
    /// is stale and must be discarded. All terminal states share the top
    /// rank: once terminal, nothing moves.
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            Self::CreatedLocal => 0,
            Self::PendingAck => 1,
            Self::Open => 2,
            Self::PartiallyFilled => 3,
            Self::CancelRequested => 4,
            Self::Filled | Self::Canceled | Self::Failed | Self::Expired => 5,
        }
    }

    /// Returns true if no further transition can occur.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Failed | Self::Expired
        )
    }

    /// Returns true once the exchange has acknowledged the order.
    #[must_use]
    pub fn is_acknowledged(&self) -> bool {
        self.rank() >= Self::Open.rank() && !matches!(self, Self::Failed | Self::Expired)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CreatedLocal => "CreatedLocal",
            Self::PendingAck => "PendingAck",
            Self::Open => "Open",
            Self::PartiallyFilled => "PartiallyFilled",
            Self::CancelRequested => "CancelRequested",
            Self::Filled => "Filled",
            Self::Canceled => "Canceled",
            Self::Failed => "Failed",
            Self::Expired => "Expired",
        };
        write!(f, "{}", s)
    }
}

/// The local view of one order across its whole lifecycle.
///
/// Owned exclusively by the registry; everything else refers to it by
/// client order id and receives clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InFlightOrder {
    /// Client-assigned id, unique per process
    pub client_order_id: ClientOrderId,
    /// Exchange-assigned id; set exactly once, on acknowledgment
    pub exchange_order_id: Option<ExchangeOrderId>,
    /// Trading pair (e.g. "BTC-USD")
    pub pair: TradingPair,
    pub side: OrderSide,
    pub kind: OrderKind,
    /// Requested quantity in base units
    pub amount: Decimal,
    /// Limit price; None for market orders
    pub price: Option<Decimal>,
    /// Cumulative filled quantity, never exceeds `amount`
    pub filled: Decimal,
    pub status: OrderStatus,
    /// Asset debited from available balance at placement
    pub reserved_asset: String,
    /// Amount reserved at placement (quote for buys, base for sells)
    pub reserved_amount: Decimal,
    /// Status stashed when a cancel was requested, for rollback if the
    /// cancel request fails or times out
    pub precancel_status: Option<OrderStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InFlightOrder {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        client_order_id: ClientOrderId,
        pair: TradingPair,
        side: OrderSide,
        kind: OrderKind,
        amount: Decimal,
        price: Option<Decimal>,
        reserved_asset: String,
        reserved_amount: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            client_order_id,
            exchange_order_id: None,
            pair,
            side,
            kind,
            amount,
            price,
            filled: Decimal::ZERO,
            status: OrderStatus::CreatedLocal,
            reserved_asset,
            reserved_amount,
            precancel_status: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Unfilled quantity in base units.
    #[must_use]
    pub fn remaining(&self) -> Decimal {
        self.amount - self.filled
    }

    /// The pro-rata share of the placement reservation not consumed by
    /// fills; this is what gets released back to available balance when
    /// the order reaches a terminal state.
    #[must_use]
    pub fn unspent_reservation(&self) -> Decimal {
        if self.amount.is_zero() || self.reserved_amount.is_zero() {
            return self.reserved_amount;
        }
        let remaining_ratio = (self.amount - self.filled) / self.amount;
        self.reserved_amount * remaining_ratio
    }
}

/// One merged observation of an order's exchange-side state.
///
/// Local dispatch results, poll snapshots, and stream events all reduce
/// to this shape before being applied to the registry.
#[derive(Debug, Clone)]
pub struct OrderObservation {
    pub status: Option<OrderStatus>,
    /// Cumulative (not incremental) filled quantity
    pub filled: Option<Decimal>,
    pub exchange_order_id: Option<ExchangeOrderId>,
    pub observed_at: DateTime<Utc>,
}

impl OrderObservation {
    #[must_use]
    pub fn status(status: OrderStatus) -> Self {
        Self {
            status: Some(status),
            filled: None,
            exchange_order_id: None,
            observed_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn fill(cumulative: Decimal) -> Self {
        Self {
            status: None,
            filled: Some(cumulative),
            exchange_order_id: None,
            observed_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_fill(mut self, cumulative: Decimal) -> Self {
        self.filled = Some(cumulative);
        self
    }

    #[must_use]
    pub fn with_exchange_id(mut self, id: ExchangeOrderId) -> Self {
        self.exchange_order_id = Some(id);
        self
    }
}

/// What an apply-transition call actually changed, reported so callers
/// can emit notifications and release reservations exactly once.
#[derive(Debug, Clone)]
pub struct AppliedChange {
    pub previous: OrderStatus,
    pub current: OrderStatus,
    /// Increase in cumulative fill (zero when only the status moved)
    pub fill_delta: Decimal,
    /// Snapshot of the order after the change
    pub order: InFlightOrder,
}

impl AppliedChange {
    /// True when this change moved the order into a terminal state.
    #[must_use]
    pub fn entered_terminal(&self) -> bool {
        !self.previous.is_terminal() && self.current.is_terminal()
    }
}
