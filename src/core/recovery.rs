// Restart reconciliation: bring a persisted session in line with the
// exchange before it is allowed to act again

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::core::gateway::{ExchangeOrder, ExchangeOrderStatus, GatewayError};
use crate::core::session::{ExitReason, GridSession, OrderStatus, SessionContext, SessionState};
use crate::error::TradingResult;

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub still_open: usize,
    pub fills_applied: usize,
    pub adopted: usize,   // Pending locally, found on the exchange
    pub replaced: usize,  // Gone from the exchange without a fill
    pub sells_placed: usize,
    pub unknown_resting: Vec<String>, // Exchange ids on the book for this symbol that no order claims
}

/// Reconcile `session` with the exchange's view of its orders.
///
/// The exchange is authoritative. Orders that filled while the process was
/// down are applied exactly once, orders that never landed are submitted,
/// and a filled level is never submitted again.
pub async fn reconcile(
    session: &mut GridSession,
    ctx: &SessionContext<'_>,
    now: DateTime<Utc>,
) -> TradingResult<ReconcileReport> {
    let mut report = ReconcileReport::default();
    if session.state.is_terminal() {
        return Ok(report);
    }

    if session.state == SessionState::Closing {
        warn!(session = %session.id, "🧹 Session was closing at shutdown, finishing the unwind");
        let reason = session.exit_reason.clone().unwrap_or(ExitReason::Manual);
        session.close(reason, ctx, now).await?;
        return Ok(report);
    }

    // One snapshot of the book; only orders missing from it are looked up
    let resting = ctx.gateway.open_orders(&session.symbol).await?;
    let by_client: HashMap<&str, &ExchangeOrder> =
        resting.iter().map(|o| (o.client_id.as_str(), o)).collect();

    for order in &resting {
        let claimed = session.orders.iter().any(|local| {
            local.client_id == order.client_id
                || local.exchange_id.as_deref() == Some(order.order_id.as_str())
        });
        if !claimed {
            warn!(
                symbol = %session.symbol,
                session = %session.id,
                "👻 Order {} ({}) is resting on the exchange but belongs to no grid order",
                order.order_id,
                order.client_id
            );
            report.unknown_resting.push(order.order_id.clone());
        }
    }

    // Follow-up orders appended below are placed fresh and need no lookup
    let known = session.orders.len();
    for idx in 0..known {
        if !session.state.is_live() {
            break;
        }
        let order = &session.orders[idx];
        let client_id = order.client_id.clone();
        let exchange_id = order.exchange_id.clone();
        let on_book = by_client.get(client_id.as_str()).copied();

        let remote_status = match (order.status, exchange_id) {
            (OrderStatus::Pending, _) => {
                let found = match on_book {
                    Some(found) => Some(found.clone()),
                    None => ctx.gateway.find_by_client_id(&client_id).await?,
                };
                match found {
                    Some(found) => {
                        session.orders[idx].exchange_id = Some(found.order_id);
                        session.orders[idx].status = OrderStatus::Open;
                        report.adopted += 1;
                        found.status
                    }
                    None => {
                        session.place_or_abort(idx, ctx, now).await?;
                        report.replaced += 1;
                        continue;
                    }
                }
            }
            (OrderStatus::Open, Some(order_id)) => match on_book {
                Some(found) if found.order_id == order_id => found.status,
                _ => match ctx.gateway.order_status(&order_id).await {
                    Ok(found) => found.status,
                    Err(GatewayError::NotFound(_)) => ExchangeOrderStatus::Cancelled,
                    Err(err) => return Err(err.into()),
                },
            },
            _ => continue,
        };

        match remote_status {
            ExchangeOrderStatus::Open => report.still_open += 1,
            ExchangeOrderStatus::Filled { price } => {
                session.apply_fill(idx, price, ctx, now).await?;
                report.fills_applied += 1;
            }
            ExchangeOrderStatus::Cancelled => {
                session.apply_external_cancel(idx, ctx, now).await?;
                report.replaced += 1;
            }
        }
    }

    // A crash between a buy fill and its take-profit leaves the buy unpaired
    for buy_idx in session.unpaired_buys() {
        if !session.state.is_live() {
            break;
        }
        if session.place_paired_sell(buy_idx, ctx, now).await? {
            report.sells_placed += 1;
        }
    }

    if session.state.is_live() {
        session.persist(ctx)?;
        if !session.poll_halt(ctx, now).await? {
            session.check_fill_exits(ctx, now).await?;
        }
    }

    info!(
        symbol = %session.symbol,
        session = %session.id,
        "🔁 Reconciled: {} open, {} offline fills, {} adopted, {} replaced, {} sells placed, {} unknown",
        report.still_open,
        report.fills_applied,
        report.adopted,
        report.replaced,
        report.sells_placed,
        report.unknown_resting.len()
    );
    Ok(report)
}
