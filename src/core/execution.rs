// Order placement helpers: bounded timeouts, status lookup before resubmit,
// retry with backoff

use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::core::gateway::{CancelOutcome, ExchangeGateway, GatewayError, OrderRequest};
use crate::core::retry::RetryPolicy;
use crate::error::TradingResult;

/// Submit `request`, returning the exchange order id.
///
/// Each attempt is bounded by `order_timeout`. When an attempt times out the
/// exchange is asked whether an order with the same client id exists before
/// another attempt is made, so a lost acknowledgement never produces a
/// duplicate order.
pub async fn place_order(
    gateway: &dyn ExchangeGateway,
    request: &OrderRequest,
    policy: &RetryPolicy,
    order_timeout: Duration,
) -> TradingResult<String> {
    let what = format!(
        "submit {} {} {:.6} @ {:.8}",
        request.symbol,
        request.side.as_str(),
        request.size,
        request.price
    );

    policy
        .execute(&what, || async move {
            match timeout(order_timeout, gateway.submit_order(request)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        client_id = %request.client_id,
                        "⏱️  Order acknowledgement timed out, checking exchange before retrying"
                    );
                    match gateway.find_by_client_id(&request.client_id).await? {
                        Some(order) => {
                            debug!(order_id = %order.order_id, "Order had landed, adopting it");
                            Ok(order.order_id)
                        }
                        None => Err(GatewayError::Timeout),
                    }
                }
            }
        })
        .await
}

pub async fn cancel_order(
    gateway: &dyn ExchangeGateway,
    order_id: &str,
    policy: &RetryPolicy,
    order_timeout: Duration,
) -> TradingResult<CancelOutcome> {
    policy
        .execute(&format!("cancel {}", order_id), || async move {
            match timeout(order_timeout, gateway.cancel_order(order_id)).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout),
            }
        })
        .await
}

/// Flatten `size` of `symbol` at market, returning the fill price
pub async fn close_position(
    gateway: &dyn ExchangeGateway,
    symbol: &str,
    size: f64,
    policy: &RetryPolicy,
) -> TradingResult<f64> {
    policy
        .execute(&format!("close {} {:.6}", symbol, size), || {
            gateway.close_position(symbol, size)
        })
        .await
}
