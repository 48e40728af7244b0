//! Order Management Module
//!
//! Provides the in-flight order registry, the order status state machine,
//! and deadline tracking for outstanding requests.
//!
//! # Architecture
//!
//! - `InFlightOrderRegistry` - thread-safe, monotonic order state machine
//! - `TransactionTracker` - deadlines for unacknowledged submits/cancels
//! - Core types - `ClientOrderId`, `ExchangeOrderId`, `OrderStatus`,
//!   `InFlightOrder`, `OrderObservation`

mod registry;
mod transactions;
mod types;

pub use registry::{InFlightOrderRegistry, RegistryError};
pub use transactions::{TrackedTransaction, TransactionTracker, TxnKind};
pub use types::{
    AppliedChange, ClientOrderId, ExchangeOrderId, InFlightOrder, OrderObservation, OrderStatus,
};
