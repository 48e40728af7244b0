//! End-to-end connector flows against a scripted exchange.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use ordersync::connector::{Connector, ConnectorError, ConnectorEvent};
use ordersync::exchange::{
    BalanceSnapshot, ExchangeError, ExchangeTransport, OrderRequest, OrderSnapshot, StreamEvent,
    StreamSource, TradingRule,
};
use ordersync::orders::RegistryError;
use ordersync::rules::RuleViolation;
use ordersync::{ClientOrderId, ConnectorConfig, ExchangeOrderId, OrderKind, OrderSide, OrderStatus};

// --- Mocks ---

#[derive(Clone)]
enum SubmitMode {
    Accept,
    Hang,
    Reject(String),
}

/// Scriptable transport double. Poll responses and submit behavior are
/// set per test; every call is observable through counters.
struct MockTransport {
    balances: Mutex<Vec<BalanceSnapshot>>,
    open_orders: Mutex<Vec<OrderSnapshot>>,
    order_lookups: Mutex<HashMap<String, Option<OrderSnapshot>>>,
    rules: Vec<TradingRule>,
    submit_mode: Mutex<SubmitMode>,
    open_order_fetches: AtomicUsize,
}

impl MockTransport {
    fn new() -> Self {
        Self {
            balances: Mutex::new(vec![BalanceSnapshot {
                asset: "USD".to_string(),
                total: dec!(2000),
                available: dec!(2000),
            }]),
            open_orders: Mutex::new(Vec::new()),
            order_lookups: Mutex::new(HashMap::new()),
            rules: vec![TradingRule {
                symbol: "BTC-USD".to_string(),
                min_order_size: dec!(0.01),
                price_increment: dec!(0.01),
                size_increment: dec!(0.01),
            }],
            submit_mode: Mutex::new(SubmitMode::Accept),
            open_order_fetches: AtomicUsize::new(0),
        }
    }

    fn set_submit_mode(&self, mode: SubmitMode) {
        *self.submit_mode.lock().unwrap() = mode;
    }

    fn set_open_orders(&self, snapshots: Vec<OrderSnapshot>) {
        *self.open_orders.lock().unwrap() = snapshots;
    }
}

#[async_trait]
impl ExchangeTransport for MockTransport {
    async fn submit_order(&self, request: &OrderRequest) -> Result<ExchangeOrderId, ExchangeError> {
        let mode = self.submit_mode.lock().unwrap().clone();
        match mode {
            SubmitMode::Accept => Ok(ExchangeOrderId::new(format!("ex-{}", request.client_order_id))),
            SubmitMode::Hang => std::future::pending().await,
            SubmitMode::Reject(reason) => Err(ExchangeError::Rejected(reason)),
        }
    }

    async fn cancel_order(&self, _id: &ExchangeOrderId) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn fetch_balances(&self) -> Result<Vec<BalanceSnapshot>, ExchangeError> {
        Ok(self.balances.lock().unwrap().clone())
    }

    async fn fetch_open_orders(&self) -> Result<Vec<OrderSnapshot>, ExchangeError> {
        self.open_order_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.open_orders.lock().unwrap().clone())
    }

    async fn fetch_order(&self, id: &ClientOrderId) -> Result<Option<OrderSnapshot>, ExchangeError> {
        Ok(self
            .order_lookups
            .lock()
            .unwrap()
            .get(id.as_str())
            .cloned()
            .flatten())
    }

    async fn fetch_trading_rules(&self) -> Result<Vec<TradingRule>, ExchangeError> {
        Ok(self.rules.clone())
    }
}

/// Stream source that hands out a fresh channel on every subscribe and
/// exposes the senders so tests can push events.
struct MockStream {
    senders: Mutex<Vec<mpsc::Sender<StreamEvent>>>,
}

impl MockStream {
    fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    fn sender(&self) -> mpsc::Sender<StreamEvent> {
        self.senders
            .lock()
            .unwrap()
            .last()
            .expect("stream not subscribed yet")
            .clone()
    }
}

#[async_trait]
impl StreamSource for MockStream {
    async fn subscribe(&self) -> Result<mpsc::Receiver<StreamEvent>, ExchangeError> {
        let (tx, rx) = mpsc::channel(32);
        self.senders.lock().unwrap().push(tx);
        Ok(rx)
    }
}

// --- Helpers ---

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Slow polling so balance snapshots do not race reservation assertions.
fn quiet_config() -> ConnectorConfig {
    let mut config = ConnectorConfig::default();
    config.poll_interval = Duration::from_secs(30);
    config.rules_refresh_interval = Duration::from_secs(3600);
    config.missing_order_grace = Duration::from_secs(60);
    config
}

async fn started(
    transport: Arc<MockTransport>,
    config: ConnectorConfig,
) -> (Connector, Arc<MockStream>) {
    init_tracing();
    let stream = Arc::new(MockStream::new());
    let connector = Connector::new(transport, stream.clone(), config);
    connector.start().await.expect("start should succeed");
    // Let the stream listener subscribe before tests push events.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (connector, stream)
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<ConnectorEvent>, mut pred: F) -> ConnectorEvent
where
    F: FnMut(&ConnectorEvent) -> bool,
{
    loop {
        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

// --- Tests ---

#[tokio::test]
async fn test_full_fill_lifecycle() {
    let transport = Arc::new(MockTransport::new());
    let (connector, stream) = started(transport, quiet_config()).await;
    let mut events = connector.subscribe();

    let id = connector
        .place_order("BTC-USD", OrderSide::Buy, OrderKind::Limit, dec!(10), Some(dec!(100)))
        .await
        .unwrap();

    // Reservation comes out of available immediately.
    assert_eq!(
        connector.get_balance("USD").await.unwrap().available,
        dec!(1000)
    );
    assert_eq!(connector.balances().await.len(), 1);

    wait_for(&mut events, |e| matches!(e, ConnectorEvent::OrderCreated(o) if o.client_order_id == id)).await;
    wait_for(&mut events, |e| matches!(e, ConnectorEvent::OrderAccepted(o) if o.client_order_id == id)).await;

    let order = connector.get_order(&id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Open);
    assert!(order.exchange_order_id.is_some());

    stream
        .sender()
        .send(StreamEvent::OrderUpdate(OrderSnapshot {
            client_order_id: id.clone(),
            exchange_order_id: order.exchange_order_id.clone(),
            status: OrderStatus::Filled,
            filled: dec!(10),
        }))
        .await
        .unwrap();

    let filled = wait_for(&mut events, |e| {
        matches!(e, ConnectorEvent::OrderFilled { order, .. }
            if order.client_order_id == id && order.status == OrderStatus::Filled)
    })
    .await;
    if let ConnectorEvent::OrderFilled { fill_delta, .. } = filled {
        assert_eq!(fill_delta, dec!(10));
    }

    // Fully consumed reservation: nothing flows back to available.
    assert_eq!(
        connector.get_balance("USD").await.unwrap().available,
        dec!(1000)
    );
    assert_eq!(connector.active_order_count().await, 0);

    connector.stop().await;
}

#[tokio::test]
async fn test_partial_fill_then_cancel_releases_unspent_reservation() {
    let transport = Arc::new(MockTransport::new());
    let (connector, stream) = started(transport, quiet_config()).await;
    let mut events = connector.subscribe();

    let id = connector
        .place_order("BTC-USD", OrderSide::Buy, OrderKind::Limit, dec!(10), Some(dec!(100)))
        .await
        .unwrap();
    wait_for(&mut events, |e| matches!(e, ConnectorEvent::OrderAccepted(o) if o.client_order_id == id)).await;

    let exchange_id = connector.get_order(&id).await.unwrap().exchange_order_id;
    stream
        .sender()
        .send(StreamEvent::OrderUpdate(OrderSnapshot {
            client_order_id: id.clone(),
            exchange_order_id: exchange_id,
            status: OrderStatus::PartiallyFilled,
            filled: dec!(4),
        }))
        .await
        .unwrap();
    wait_for(&mut events, |e| matches!(e, ConnectorEvent::OrderFilled { order, .. } if order.client_order_id == id)).await;

    connector.cancel_order(&id).await.unwrap();
    wait_for(&mut events, |e| matches!(e, ConnectorEvent::OrderCanceled(o) if o.client_order_id == id)).await;

    let order = connector.get_order(&id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Canceled);
    assert_eq!(order.filled, dec!(4));
    assert_eq!(order.remaining(), dec!(6));

    // 1000 reserved, 4/10 consumed by fills, 600 comes back.
    assert_eq!(
        connector.get_balance("USD").await.unwrap().available,
        dec!(1600)
    );

    // The next poll's balance snapshot is authoritative and replaces the
    // optimistic local view.
    connector.trigger_poll();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        connector.get_balance("USD").await.unwrap().available,
        dec!(2000)
    );

    connector.stop().await;
}

#[tokio::test]
async fn test_stale_poll_does_not_regress_stream_fill() {
    let transport = Arc::new(MockTransport::new());
    let mut config = quiet_config();
    config.poll_interval = Duration::from_millis(100);
    let (connector, stream) = started(transport.clone(), config).await;
    let mut events = connector.subscribe();

    let id = connector
        .place_order("BTC-USD", OrderSide::Buy, OrderKind::Limit, dec!(10), Some(dec!(100)))
        .await
        .unwrap();
    wait_for(&mut events, |e| matches!(e, ConnectorEvent::OrderAccepted(o) if o.client_order_id == id)).await;
    let exchange_id = connector.get_order(&id).await.unwrap().exchange_order_id;

    // The poller keeps seeing a snapshot from before the fill.
    transport.set_open_orders(vec![OrderSnapshot {
        client_order_id: id.clone(),
        exchange_order_id: exchange_id.clone(),
        status: OrderStatus::Open,
        filled: Decimal::ZERO,
    }]);

    stream
        .sender()
        .send(StreamEvent::OrderUpdate(OrderSnapshot {
            client_order_id: id.clone(),
            exchange_order_id: exchange_id,
            status: OrderStatus::PartiallyFilled,
            filled: dec!(4),
        }))
        .await
        .unwrap();
    wait_for(&mut events, |e| matches!(e, ConnectorEvent::OrderFilled { order, .. } if order.client_order_id == id)).await;

    // Several poll cycles with the stale snapshot.
    tokio::time::sleep(Duration::from_millis(350)).await;

    let order = connector.get_order(&id).await.unwrap();
    assert_eq!(order.status, OrderStatus::PartiallyFilled);
    assert_eq!(order.filled, dec!(4));

    connector.stop().await;
}

#[tokio::test]
async fn test_submit_hang_expires_order_exactly_once() {
    let transport = Arc::new(MockTransport::new());
    transport.set_submit_mode(SubmitMode::Hang);
    let mut config = quiet_config();
    config.poll_interval = Duration::from_millis(50);
    config.submit_timeout = Duration::from_millis(150);
    let (connector, _stream) = started(transport, config).await;
    let mut events = connector.subscribe();

    let id = connector
        .place_order("BTC-USD", OrderSide::Buy, OrderKind::Limit, dec!(10), Some(dec!(100)))
        .await
        .unwrap();

    wait_for(&mut events, |e| matches!(e, ConnectorEvent::OrderExpired(o) if o.client_order_id == id)).await;
    assert_eq!(
        connector.get_order(&id).await.unwrap().status,
        OrderStatus::Expired
    );

    // Several more deadline sweeps must not expire it again.
    let mut extra_expirations = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
    while let Ok(Ok(event)) =
        timeout(deadline.saturating_duration_since(tokio::time::Instant::now()), events.recv()).await
    {
        if matches!(&event, ConnectorEvent::OrderExpired(o) if o.client_order_id == id) {
            extra_expirations += 1;
        }
    }
    assert_eq!(extra_expirations, 0);

    connector.stop().await;
}

#[tokio::test]
async fn test_rejected_submission_fails_order_and_releases_reservation() {
    let transport = Arc::new(MockTransport::new());
    transport.set_submit_mode(SubmitMode::Reject("insufficient margin".to_string()));
    let (connector, _stream) = started(transport, quiet_config()).await;
    let mut events = connector.subscribe();

    let id = connector
        .place_order("BTC-USD", OrderSide::Buy, OrderKind::Limit, dec!(10), Some(dec!(100)))
        .await
        .unwrap();

    wait_for(&mut events, |e| matches!(e, ConnectorEvent::OrderFailed(o) if o.client_order_id == id)).await;
    assert_eq!(
        connector.get_order(&id).await.unwrap().status,
        OrderStatus::Failed
    );
    // Nothing was filled, the whole reservation comes back.
    assert_eq!(
        connector.get_balance("USD").await.unwrap().available,
        dec!(2000)
    );

    connector.stop().await;
}

#[tokio::test]
async fn test_cancel_preconditions() {
    let transport = Arc::new(MockTransport::new());
    let (connector, stream) = started(transport, quiet_config()).await;
    let mut events = connector.subscribe();

    let err = connector
        .cancel_order(&ClientOrderId::new("never-placed"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ConnectorError::Order(RegistryError::OrderNotFound(_))
    ));

    let id = connector
        .place_order("BTC-USD", OrderSide::Buy, OrderKind::Limit, dec!(10), Some(dec!(100)))
        .await
        .unwrap();
    wait_for(&mut events, |e| matches!(e, ConnectorEvent::OrderAccepted(o) if o.client_order_id == id)).await;
    let exchange_id = connector.get_order(&id).await.unwrap().exchange_order_id;

    stream
        .sender()
        .send(StreamEvent::OrderUpdate(OrderSnapshot {
            client_order_id: id.clone(),
            exchange_order_id: exchange_id,
            status: OrderStatus::Filled,
            filled: dec!(10),
        }))
        .await
        .unwrap();
    wait_for(&mut events, |e| {
        matches!(e, ConnectorEvent::OrderFilled { order, .. } if order.status == OrderStatus::Filled)
    })
    .await;

    let err = connector.cancel_order(&id).await.unwrap_err();
    assert!(matches!(
        err,
        ConnectorError::Order(RegistryError::OrderAlreadyTerminal(..))
    ));

    connector.stop().await;
}

#[tokio::test]
async fn test_invalid_order_size_rejected_synchronously() {
    let transport = Arc::new(MockTransport::new());
    let (connector, _stream) = started(transport, quiet_config()).await;

    let err = connector
        .place_order("BTC-USD", OrderSide::Buy, OrderKind::Limit, dec!(0.001), Some(dec!(100)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ConnectorError::Rule(RuleViolation::InvalidOrderSize { .. })
    ));

    // No tracked order, no reservation.
    assert!(connector.open_orders().await.is_empty());
    assert_eq!(
        connector.get_balance("USD").await.unwrap().available,
        dec!(2000)
    );

    connector.stop().await;
}

#[tokio::test]
async fn test_disconnect_triggers_immediate_poll() {
    let transport = Arc::new(MockTransport::new());
    // Polling is effectively off; only triggered polls touch open orders.
    let (connector, stream) = started(transport.clone(), quiet_config()).await;
    let mut events = connector.subscribe();

    // An active order makes poll cycles fetch open orders.
    let id = connector
        .place_order("BTC-USD", OrderSide::Buy, OrderKind::Limit, dec!(10), Some(dec!(100)))
        .await
        .unwrap();
    wait_for(&mut events, |e| matches!(e, ConnectorEvent::OrderAccepted(o) if o.client_order_id == id)).await;
    let exchange_id = connector.get_order(&id).await.unwrap().exchange_order_id;
    transport.set_open_orders(vec![OrderSnapshot {
        client_order_id: id.clone(),
        exchange_order_id: exchange_id,
        status: OrderStatus::Open,
        filled: Decimal::ZERO,
    }]);

    let before = transport.open_order_fetches.load(Ordering::SeqCst);
    stream.sender().send(StreamEvent::Disconnected).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if transport.open_order_fetches.load(Ordering::SeqCst) > before {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "disconnect did not trigger an out-of-cycle poll"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    connector.stop().await;
}
