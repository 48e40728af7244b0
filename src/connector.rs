//! Connector facade.
//!
//! The public surface of the crate: place/cancel orders, read balances
//! and order state, subscribe to lifecycle notifications. Composes the
//! registry, ledger, rules cache, transaction tracker, scheduler, polling
//! loop, and stream listener, and owns their lifecycles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::ConnectorConfig;
use crate::exchange::{
    BalanceSnapshot, ExchangeError, ExchangeTransport, OrderRequest, OrderSnapshot, StreamSource,
};
use crate::ledger::{BalanceEntry, BalanceError, BalanceLedger};
use crate::orders::{
    AppliedChange, ClientOrderId, InFlightOrder, InFlightOrderRegistry, OrderObservation,
    OrderStatus, RegistryError, TransactionTracker,
};
use crate::polling::StatusPollingLoop;
use crate::rules::{RuleViolation, TradingRulesCache};
use crate::scheduler::RequestScheduler;
use crate::stream::StreamListener;
use crate::types::{InvalidPair, OrderKind, OrderSide, TradingPair};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle notifications emitted to subscribed observers.
///
/// Slow subscribers lose oldest events (broadcast semantics); the core
/// never blocks on a lagging observer.
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    /// Order registered locally, before dispatch
    OrderCreated(InFlightOrder),
    /// Exchange acknowledged the order
    OrderAccepted(InFlightOrder),
    /// Cumulative fill increased; the order's status tells whether the
    /// fill is partial or complete
    OrderFilled {
        order: InFlightOrder,
        fill_delta: Decimal,
    },
    OrderCanceled(InFlightOrder),
    OrderFailed(InFlightOrder),
    OrderExpired(InFlightOrder),
    BalanceChanged(BalanceEntry),
}

/// Errors surfaced synchronously by the facade.
///
/// Everything asynchronous (rejections, timeouts, reconciliation) arrives
/// as lifecycle events instead.
#[derive(Debug, Clone, Error)]
pub enum ConnectorError {
    #[error(transparent)]
    InvalidSymbol(#[from] InvalidPair),

    #[error("price is required for limit orders")]
    PriceRequired,

    #[error(transparent)]
    Rule(#[from] RuleViolation),

    #[error(transparent)]
    Balance(#[from] BalanceError),

    #[error(transparent)]
    Order(#[from] RegistryError),

    #[error(transparent)]
    Transport(#[from] ExchangeError),

    #[error("connector is shut down")]
    Shutdown,
}

/// Shared state and lifecycle logic behind the facade.
///
/// The facade's direct path, the polling loop, and the stream listener
/// all converge here: every order observation funnels through
/// [`apply_observation`](Self::apply_observation) so that event emission
/// and reservation release happen exactly once per transition.
pub(crate) struct ConnectorCore {
    pub(crate) config: ConnectorConfig,
    pub(crate) transport: Arc<dyn ExchangeTransport>,
    pub(crate) registry: InFlightOrderRegistry,
    pub(crate) ledger: BalanceLedger,
    pub(crate) rules: TradingRulesCache,
    pub(crate) tracker: TransactionTracker,
    events: broadcast::Sender<ConnectorEvent>,
    shutdown: watch::Sender<bool>,
    order_seq: AtomicU64,
}

impl ConnectorCore {
    pub(crate) fn new(transport: Arc<dyn ExchangeTransport>, config: ConnectorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Self {
            registry: InFlightOrderRegistry::new(config.terminal_retention),
            ledger: BalanceLedger::new(),
            rules: TradingRulesCache::new(),
            tracker: TransactionTracker::new(),
            config,
            transport,
            events,
            shutdown,
            order_seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn stop_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn initiate_shutdown(&self) {
        // No receivers just means nothing is running yet.
        let _ = self.shutdown.send(true);
    }

    pub(crate) fn emit(&self, event: ConnectorEvent) {
        // Err means no subscribers, which is fine.
        let _ = self.events.send(event);
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.events.subscribe()
    }

    fn next_client_order_id(&self, side: OrderSide, pair: &TradingPair) -> ClientOrderId {
        let seq = self.order_seq.fetch_add(1, Ordering::Relaxed);
        ClientOrderId::new(format!(
            "{}-{}-{}-{}",
            side,
            pair.base(),
            Utc::now().timestamp_millis(),
            seq
        ))
    }

    fn deadline_after(&self, timeout: std::time::Duration) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::hours(1))
    }

    /// Merge one observation into the registry and settle its effects.
    pub(crate) async fn apply_observation(&self, id: &ClientOrderId, obs: OrderObservation) {
        if let Some(change) = self.registry.apply(id, obs).await {
            self.settle_change(change).await;
        }
    }

    /// Convert an exchange snapshot into an observation and apply it.
    pub(crate) async fn apply_snapshot(&self, snapshot: OrderSnapshot) {
        let id = snapshot.client_order_id;
        let mut obs = OrderObservation::status(snapshot.status).with_fill(snapshot.filled);
        if let Some(eid) = snapshot.exchange_order_id {
            obs = obs.with_exchange_id(eid);
        }
        self.apply_observation(&id, obs).await;
    }

    /// Emit notifications and release reservations for what changed.
    async fn settle_change(&self, change: AppliedChange) {
        let order = change.order.clone();

        if change.entered_terminal() {
            // Any still-outstanding request deadlines are moot now.
            self.tracker.stop_for_order(&order.client_order_id).await;

            let unspent = order.unspent_reservation();
            if unspent > Decimal::ZERO {
                if let Some(entry) = self.ledger.release(&order.reserved_asset, unspent).await {
                    self.emit(ConnectorEvent::BalanceChanged(entry));
                }
            }

            if change.fill_delta > Decimal::ZERO && order.status != OrderStatus::Filled {
                self.emit(ConnectorEvent::OrderFilled {
                    order: order.clone(),
                    fill_delta: change.fill_delta,
                });
            }
            let event = match order.status {
                OrderStatus::Filled => ConnectorEvent::OrderFilled {
                    order,
                    fill_delta: change.fill_delta,
                },
                OrderStatus::Canceled => ConnectorEvent::OrderCanceled(order),
                OrderStatus::Failed => ConnectorEvent::OrderFailed(order),
                OrderStatus::Expired => ConnectorEvent::OrderExpired(order),
                _ => return,
            };
            self.emit(event);
            return;
        }

        if change.previous.rank() < OrderStatus::Open.rank()
            && change.current == OrderStatus::Open
        {
            self.emit(ConnectorEvent::OrderAccepted(order.clone()));
        }
        // A fill surfacing only after the order was already terminal was
        // absorbed for bookkeeping; its settlement already happened, so no
        // notification follows the terminal event.
        if change.fill_delta > Decimal::ZERO && !change.previous.is_terminal() {
            self.emit(ConnectorEvent::OrderFilled {
                order,
                fill_delta: change.fill_delta,
            });
        }
    }

    /// Drive a submit-timeout to Expired.
    pub(crate) async fn expire_order(&self, id: &ClientOrderId) {
        warn!(order_id = %id, "submit deadline passed with no acknowledgment, expiring");
        self.apply_observation(id, OrderObservation::status(OrderStatus::Expired))
            .await;
    }

    /// Fail an order locally (rejection or confirmed disappearance).
    pub(crate) async fn fail_order(&self, id: &ClientOrderId, reason: &str) {
        warn!(order_id = %id, reason = reason, "order failed");
        self.apply_observation(id, OrderObservation::status(OrderStatus::Failed))
            .await;
    }

    pub(crate) async fn apply_balance_snapshot(&self, snapshot: BalanceSnapshot) {
        if let Some(entry) = self
            .ledger
            .apply_snapshot(&snapshot.asset, snapshot.total, snapshot.available)
            .await
        {
            self.emit(ConnectorEvent::BalanceChanged(entry));
        }
    }

    pub(crate) async fn apply_balance_delta(
        &self,
        asset: &str,
        total_delta: Decimal,
        available_delta: Decimal,
    ) {
        let entry = self.ledger.apply_delta(asset, total_delta, available_delta).await;
        self.emit(ConnectorEvent::BalanceChanged(entry));
    }

    /// The submit request, run on the scheduler's consumer.
    async fn dispatch_submit(&self, request: OrderRequest) {
        let id = request.client_order_id.clone();
        self.apply_observation(&id, OrderObservation::status(OrderStatus::PendingAck))
            .await;

        // The order can have expired or failed while queued.
        match self.registry.get(&id).await {
            Some(order) if !order.is_terminal() => {}
            _ => {
                self.tracker.stop(id.as_str()).await;
                return;
            }
        }

        // Bound the call so a transport that never answers cannot pin its
        // scheduler permit; expiry is idempotent against the deadline sweep.
        match timeout(self.config.submit_timeout, self.transport.submit_order(&request)).await {
            Ok(Ok(exchange_id)) => {
                self.tracker.stop(id.as_str()).await;
                self.apply_observation(
                    &id,
                    OrderObservation::status(OrderStatus::Open).with_exchange_id(exchange_id),
                )
                .await;
            }
            Ok(Err(e)) => {
                if e.is_fatal() {
                    error!(order_id = %id, error = %e, "fatal transport error on submit");
                    self.initiate_shutdown();
                }
                self.tracker.stop(id.as_str()).await;
                warn!(order_id = %id, error = %e, "order submission failed");
                self.apply_observation(&id, OrderObservation::status(OrderStatus::Failed))
                    .await;
            }
            Err(_) => {
                self.tracker.stop(id.as_str()).await;
                self.expire_order(&id).await;
            }
        }
    }

    /// The cancel request, run on the scheduler's consumer.
    async fn dispatch_cancel(&self, id: ClientOrderId, tracking_id: String) {
        let Some(order) = self.registry.get(&id).await else {
            self.tracker.stop(&tracking_id).await;
            return;
        };
        if order.is_terminal() {
            self.tracker.stop(&tracking_id).await;
            return;
        }

        // The submit runs ahead of the cancel on the same queue, so the
        // exchange id is normally known by now; if it still is not, the
        // order was never acknowledged and there is nothing to cancel yet.
        let Some(exchange_id) = order.exchange_order_id else {
            warn!(order_id = %id, "cancel dispatched before exchange acknowledgment");
            self.tracker.stop(&tracking_id).await;
            self.registry.revert_cancel(&id).await;
            return;
        };

        match timeout(self.config.cancel_timeout, self.transport.cancel_order(&exchange_id)).await {
            Ok(Ok(())) => {
                self.tracker.stop(&tracking_id).await;
                self.apply_observation(&id, OrderObservation::status(OrderStatus::Canceled))
                    .await;
            }
            Ok(Err(e)) => {
                if e.is_fatal() {
                    error!(order_id = %id, error = %e, "fatal transport error on cancel");
                    self.initiate_shutdown();
                }
                warn!(order_id = %id, error = %e, "cancel request failed");
                self.tracker.stop(&tracking_id).await;
                self.registry.revert_cancel(&id).await;
            }
            Err(_) => {
                warn!(order_id = %id, "cancel request timed out, reverting");
                self.tracker.stop(&tracking_id).await;
                self.registry.revert_cancel(&id).await;
            }
        }
    }
}

/// The public connector.
///
/// # Example
///
/// ```ignore
/// let connector = Connector::new(transport, stream_source, ConnectorConfig::default());
/// connector.start().await?;
/// let id = connector
///     .place_order("BTC-USD", OrderSide::Buy, OrderKind::Limit, dec!(0.5), Some(dec!(43000)))
///     .await?;
/// ```
pub struct Connector {
    core: Arc<ConnectorCore>,
    scheduler: Arc<RequestScheduler>,
    stream_source: Arc<dyn StreamSource>,
    poll_trigger: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connector {
    #[must_use]
    pub fn new(
        transport: Arc<dyn ExchangeTransport>,
        stream_source: Arc<dyn StreamSource>,
        config: ConnectorConfig,
    ) -> Self {
        let scheduler = Arc::new(RequestScheduler::new(
            config.request_queue_depth,
            config.max_in_flight_requests,
        ));
        let core = Arc::new(ConnectorCore::new(transport, config));
        Self {
            core,
            scheduler,
            stream_source,
            poll_trigger: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Perform the initial state sync and spawn the background tasks.
    ///
    /// Only fatal transport errors (authentication) abort startup;
    /// transient failures are logged and retried by the polling loop.
    pub async fn start(&self) -> Result<(), ConnectorError> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            warn!("connector already started");
            return Ok(());
        }

        if let Err(e) = self.core.rules.refresh(self.core.transport.as_ref()).await {
            if e.is_fatal() {
                return Err(e.into());
            }
            warn!(error = %e, "initial trading-rule refresh failed, polling will retry");
        }
        match self.core.transport.fetch_balances().await {
            Ok(balances) => {
                for snapshot in balances {
                    self.core.apply_balance_snapshot(snapshot).await;
                }
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => warn!(error = %e, "initial balance fetch failed, polling will retry"),
        }
        match self.core.transport.fetch_open_orders().await {
            Ok(snapshots) => {
                // Nothing is tracked yet, so exchange-side orders from a
                // previous process cannot be adopted (snapshots lack the
                // full order parameters); they are logged by the registry
                // and left to the operator.
                for snapshot in snapshots {
                    self.core.apply_snapshot(snapshot).await;
                }
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => warn!(error = %e, "initial open-order fetch failed, polling will retry"),
        }

        tasks.push(self.scheduler.clone().spawn(self.core.stop_signal()));

        let polling = StatusPollingLoop::new(self.core.clone(), self.poll_trigger.clone());
        let poll_stop = self.core.stop_signal();
        tasks.push(tokio::spawn(async move { polling.run(poll_stop).await }));

        let listener = StreamListener::new(
            self.core.clone(),
            self.stream_source.clone(),
            self.poll_trigger.clone(),
        );
        let stream_stop = self.core.stop_signal();
        tasks.push(tokio::spawn(async move { listener.run(stream_stop).await }));

        info!("connector started");
        Ok(())
    }

    /// Signal all background tasks to stop and wait for them to finish.
    ///
    /// In-progress registry transitions complete before tasks exit, since
    /// every mutation is lock-scoped and await-free.
    pub async fn stop(&self) {
        self.core.initiate_shutdown();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        info!("connector stopped");
    }

    /// Validate, reserve, register, and enqueue a new order.
    ///
    /// Fails synchronously (no registry entry, no reservation) on
    /// precondition violations; everything after dispatch is reported
    /// through lifecycle events.
    pub async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        kind: OrderKind,
        amount: Decimal,
        price: Option<Decimal>,
    ) -> Result<ClientOrderId, ConnectorError> {
        let pair = TradingPair::new(symbol)?;
        if kind == OrderKind::Limit && price.is_none() {
            return Err(ConnectorError::PriceRequired);
        }
        if amount <= Decimal::ZERO {
            return Err(RuleViolation::InvalidOrderSize {
                symbol: symbol.to_string(),
                amount,
                min: Decimal::ZERO,
                increment: Decimal::ZERO,
            }
            .into());
        }
        self.core.rules.validate(symbol, amount, price).await?;

        let (reserved_asset, reserved_amount) = match (side, price) {
            (OrderSide::Sell, _) => (pair.base().to_string(), amount),
            (OrderSide::Buy, Some(price)) => (pair.quote().to_string(), amount * price),
            (OrderSide::Buy, None) => {
                // Market buy without a reference price: the quote-side cost
                // is unknowable locally, so the exchange-side check is the
                // only one available.
                warn!(symbol = symbol, "market buy without reference price, skipping reservation");
                (pair.quote().to_string(), Decimal::ZERO)
            }
        };
        if reserved_amount > Decimal::ZERO {
            self.core.ledger.reserve(&reserved_asset, reserved_amount).await?;
        }

        let id = self.core.next_client_order_id(side, &pair);
        let order = InFlightOrder::new(
            id.clone(),
            pair.clone(),
            side,
            kind,
            amount,
            price,
            reserved_asset,
            reserved_amount,
        );
        self.core.registry.insert(order.clone()).await;
        self.core.emit(ConnectorEvent::OrderCreated(order));

        let deadline = self.core.deadline_after(self.core.config.submit_timeout);
        self.core.tracker.track_submit(&id, deadline).await;

        let request = OrderRequest {
            client_order_id: id.clone(),
            pair,
            side,
            kind,
            amount,
            price,
        };
        let core = self.core.clone();
        if self
            .scheduler
            .submit(async move { core.dispatch_submit(request).await })
            .await
            .is_err()
        {
            self.core.fail_order(&id, "request scheduler closed").await;
            return Err(ConnectorError::Shutdown);
        }

        info!(order_id = %id, symbol = symbol, side = %side, kind = %kind, %amount, "order placed");
        Ok(id)
    }

    /// Request cancellation of a tracked, non-terminal order.
    pub async fn cancel_order(&self, id: &ClientOrderId) -> Result<(), ConnectorError> {
        self.core.registry.begin_cancel(id).await?;

        let deadline = self.core.deadline_after(self.core.config.cancel_timeout);
        let tracking_id = self.core.tracker.track_cancel(id, deadline).await;

        let core = self.core.clone();
        let cancel_id = id.clone();
        let dispatch_tracking = tracking_id.clone();
        if self
            .scheduler
            .submit(async move { core.dispatch_cancel(cancel_id, dispatch_tracking).await })
            .await
            .is_err()
        {
            self.core.tracker.stop(&tracking_id).await;
            self.core.registry.revert_cancel(id).await;
            return Err(ConnectorError::Shutdown);
        }
        Ok(())
    }

    /// Snapshot of one tracked order.
    pub async fn get_order(&self, id: &ClientOrderId) -> Option<InFlightOrder> {
        self.core.registry.get(id).await
    }

    /// Current balances for one asset.
    pub async fn get_balance(&self, asset: &str) -> Option<BalanceEntry> {
        self.core.ledger.get(asset).await
    }

    /// All known asset balances.
    pub async fn balances(&self) -> Vec<BalanceEntry> {
        self.core.ledger.all().await
    }

    /// All non-terminal orders.
    pub async fn open_orders(&self) -> Vec<InFlightOrder> {
        self.core.registry.active_orders().await
    }

    /// Number of non-terminal orders.
    pub async fn active_order_count(&self) -> usize {
        self.core.registry.active_order_count().await
    }

    /// Subscribe to lifecycle notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.core.subscribe_events()
    }

    /// Force a status poll before the next scheduled tick.
    pub fn trigger_poll(&self) {
        self.poll_trigger.notify_one();
    }
}
