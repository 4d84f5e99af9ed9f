// Paper exchange
// Keeps resting limit orders in memory and fills them against price sweeps

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::core::gateway::{
    CancelOutcome, ExchangeGateway, ExchangeOrder, ExchangeOrderStatus, GatewayError,
    OrderEvent, OrderEventKind, OrderRequest,
};
use crate::core::types::Side;

#[derive(Debug, Default)]
struct PaperBook {
    orders: BTreeMap<String, ExchangeOrder>, // Keyed by order id, ids sort by placement
    next_order: u64,
    next_seq: u64,
    last_price: BTreeMap<String, f64>,
    submit_failures: VecDeque<GatewayError>,
    cancel_failures: VecDeque<GatewayError>,
    submit_latency: Option<Duration>,
    submit_attempts: u64,
    closed_volume: BTreeMap<String, f64>,
}

/// In-process exchange used by the `paper` command and the test suite.
///
/// Buys fill when a price sweep trades at or below their limit, sells when it
/// trades at or above. Fills and housekeeping cancellations are pushed to the
/// event channel returned by [`PaperExchange::new`], in the order they happen.
pub struct PaperExchange {
    book: Mutex<PaperBook>,
    events: UnboundedSender<OrderEvent>,
}

impl PaperExchange {
    pub fn new() -> (Self, UnboundedReceiver<OrderEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let exchange = Self {
            book: Mutex::new(PaperBook::default()),
            events,
        };
        (exchange, rx)
    }

    fn lock(&self) -> MutexGuard<'_, PaperBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, book: &mut PaperBook, order_id: &str, symbol: &str, kind: OrderEventKind) {
        book.next_seq += 1;
        let event = OrderEvent {
            seq: book.next_seq,
            order_id: order_id.to_string(),
            symbol: symbol.to_string(),
            kind,
        };
        // Nobody listening is fine for one-off tools
        let _ = self.events.send(event);
    }

    /// Move the market for `symbol` to `price`, filling every resting order it
    /// crosses. Returns how many orders filled.
    pub fn on_price(&self, symbol: &str, price: f64) -> usize {
        let mut book = self.lock();
        book.last_price.insert(symbol.to_string(), price);

        let crossed: Vec<String> = book
            .orders
            .values()
            .filter(|o| o.symbol == symbol && o.status == ExchangeOrderStatus::Open)
            .filter(|o| match o.side {
                Side::Buy => price <= o.price,
                Side::Sell => price >= o.price,
            })
            .map(|o| o.order_id.clone())
            .collect();

        for order_id in &crossed {
            self.fill_locked(&mut book, order_id, true);
        }
        crossed.len()
    }

    /// Fill one order at its limit price and publish the event
    pub fn fill_order(&self, order_id: &str) -> bool {
        let mut book = self.lock();
        self.fill_locked(&mut book, order_id, true)
    }

    /// Fill one order without publishing anything, as if the notification was
    /// lost while the engine was down
    pub fn fill_silently(&self, order_id: &str) -> bool {
        let mut book = self.lock();
        self.fill_locked(&mut book, order_id, false)
    }

    fn fill_locked(&self, book: &mut PaperBook, order_id: &str, notify: bool) -> bool {
        let (symbol, price, size) = match book.orders.get_mut(order_id) {
            Some(order) if order.status == ExchangeOrderStatus::Open => {
                order.status = ExchangeOrderStatus::Filled { price: order.price };
                (order.symbol.clone(), order.price, order.size)
            }
            _ => return false,
        };
        debug!("📗 Paper fill {} {} {:.6} @ {:.8}", order_id, symbol, size, price);
        if notify {
            self.emit(book, order_id, &symbol, OrderEventKind::Filled { price, size });
        }
        true
    }

    /// Remove a resting order the way exchange housekeeping would
    pub fn cancel_externally(&self, order_id: &str) -> bool {
        let mut book = self.lock();
        let symbol = match book.orders.get_mut(order_id) {
            Some(order) if order.status == ExchangeOrderStatus::Open => {
                order.status = ExchangeOrderStatus::Cancelled;
                order.symbol.clone()
            }
            _ => return false,
        };
        self.emit(&mut book, order_id, &symbol, OrderEventKind::Cancelled);
        true
    }

    /// Queue `count` submission failures, returned before any order is recorded
    pub fn fail_next_submits(&self, count: usize, error: GatewayError) {
        let mut book = self.lock();
        book.submit_failures.extend(std::iter::repeat(error).take(count));
    }

    pub fn fail_next_cancels(&self, count: usize, error: GatewayError) {
        let mut book = self.lock();
        book.cancel_failures.extend(std::iter::repeat(error).take(count));
    }

    /// Delay every acknowledgement by `latency` after the order is recorded
    pub fn set_submit_latency(&self, latency: Option<Duration>) {
        self.lock().submit_latency = latency;
    }

    /// Orders ever recorded
    pub fn submitted_count(&self) -> usize {
        self.lock().orders.len()
    }

    /// Submission calls, including failed ones
    pub fn submit_attempts(&self) -> u64 {
        self.lock().submit_attempts
    }

    pub fn orders_with_client_id(&self, client_id: &str) -> usize {
        self.lock()
            .orders
            .values()
            .filter(|o| o.client_id == client_id)
            .count()
    }

    pub fn resting_orders(&self, symbol: &str) -> Vec<ExchangeOrder> {
        self.lock()
            .orders
            .values()
            .filter(|o| o.symbol == symbol && o.status == ExchangeOrderStatus::Open)
            .cloned()
            .collect()
    }

    /// Base quantity flattened at market for `symbol`
    pub fn closed_volume(&self, symbol: &str) -> f64 {
        self.lock().closed_volume.get(symbol).copied().unwrap_or(0.0)
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn submit_order(&self, request: &OrderRequest) -> Result<String, GatewayError> {
        let (order_id, latency) = {
            let mut book = self.lock();
            book.submit_attempts += 1;
            if let Some(err) = book.submit_failures.pop_front() {
                return Err(err);
            }
            if !(request.price > 0.0 && request.size > 0.0) {
                return Err(GatewayError::Rejected(format!(
                    "invalid order {:.8} x {:.8}",
                    request.price, request.size
                )));
            }

            book.next_order += 1;
            let order_id = format!("PX-{:010}", book.next_order);
            book.orders.insert(
                order_id.clone(),
                ExchangeOrder {
                    order_id: order_id.clone(),
                    client_id: request.client_id.clone(),
                    symbol: request.symbol.clone(),
                    side: request.side,
                    price: request.price,
                    size: request.size,
                    status: ExchangeOrderStatus::Open,
                },
            );
            (order_id, book.submit_latency)
        };

        // The order is live before the acknowledgement leaves
        if let Some(latency) = latency {
            sleep(latency).await;
        }
        Ok(order_id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<CancelOutcome, GatewayError> {
        let mut book = self.lock();
        if let Some(err) = book.cancel_failures.pop_front() {
            return Err(err);
        }
        match book.orders.get_mut(order_id) {
            Some(order) if order.status == ExchangeOrderStatus::Open => {
                order.status = ExchangeOrderStatus::Cancelled;
                Ok(CancelOutcome::Cancelled)
            }
            _ => Ok(CancelOutcome::NotFound),
        }
    }

    async fn order_status(&self, order_id: &str) -> Result<ExchangeOrder, GatewayError> {
        self.lock()
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(order_id.to_string()))
    }

    async fn find_by_client_id(&self, client_id: &str) -> Result<Option<ExchangeOrder>, GatewayError> {
        Ok(self
            .lock()
            .orders
            .values()
            .find(|o| o.client_id == client_id)
            .cloned())
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<ExchangeOrder>, GatewayError> {
        Ok(self.resting_orders(symbol))
    }

    async fn close_position(&self, symbol: &str, size: f64) -> Result<f64, GatewayError> {
        let mut book = self.lock();
        let price = book
            .last_price
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::Rejected(format!("no market price for {}", symbol)))?;
        *book.closed_volume.entry(symbol.to_string()).or_insert(0.0) += size;
        info!("📕 Paper market sell {} {:.6} @ {:.8}", symbol, size, price);
        Ok(price)
    }
}
