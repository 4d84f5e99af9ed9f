// Exchange gateway boundary consumed by the session state machine

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::Side;

/// A limit order the core wants on the book. `client_id` is generated and
/// persisted before submission so a timed-out request can be looked up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ExchangeOrderStatus {
    Open,
    Filled { price: f64 },
    Cancelled,
}

/// The exchange's authoritative view of one order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub order_id: String,
    pub client_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub status: ExchangeOrderStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderEventKind {
    Filled { price: f64, size: f64 },
    Cancelled, // Removed by the exchange, not by us
}

/// Asynchronous notification about a resting order, in exchange order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub seq: u64,
    pub order_id: String,
    pub symbol: String,
    pub kind: OrderEventKind,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("rate limited")]
    RateLimited,

    #[error("request timed out")]
    Timeout,

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("order not found: {0}")]
    NotFound(String),
}

impl GatewayError {
    /// Transient failures are retried with backoff; the rest are final
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Transport(_) | GatewayError::RateLimited | GatewayError::Timeout
        )
    }
}

/// Exchange trait - order placement, cancellation and status queries.
/// Fills arrive separately as `OrderEvent`s.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Place a limit order, returning the exchange order id
    async fn submit_order(&self, request: &OrderRequest) -> Result<String, GatewayError>;

    async fn cancel_order(&self, order_id: &str) -> Result<CancelOutcome, GatewayError>;

    async fn order_status(&self, order_id: &str) -> Result<ExchangeOrder, GatewayError>;

    async fn find_by_client_id(&self, client_id: &str) -> Result<Option<ExchangeOrder>, GatewayError>;

    async fn open_orders(&self, symbol: &str) -> Result<Vec<ExchangeOrder>, GatewayError>;

    /// Sell `size` at market, returning the average fill price
    async fn close_position(&self, symbol: &str, size: f64) -> Result<f64, GatewayError>;
}
