pub mod config;
pub mod connector;
pub mod exchange;
pub mod ledger;
pub mod orders;
mod polling;
pub mod rules;
pub mod scheduler;
mod stream;
pub mod types;

pub use config::ConnectorConfig;
pub use connector::{Connector, ConnectorError, ConnectorEvent};
pub use orders::{ClientOrderId, ExchangeOrderId, InFlightOrder, OrderStatus};
pub use types::{OrderKind, OrderSide, TradingPair};
