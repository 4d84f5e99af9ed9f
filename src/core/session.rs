// Grid session lifecycle: deploys a plan, reacts to fills, evaluates exits
// and unwinds

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::core::execution;
use crate::core::gateway::{
    CancelOutcome, ExchangeGateway, ExchangeOrderStatus, OrderEvent, OrderEventKind, OrderRequest,
};
use crate::core::grid_planner::GridPlan;
use crate::core::retry::RetryPolicy;
use crate::core::risk::{Authorization, RiskController};
use crate::core::types::{MarketSnapshot, Side};
use crate::db::SessionStore;
use crate::error::{TradingError, TradingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Armed,
    Deployed,
    Active,
    Closing,
    Closed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Aborted)
    }

    /// Armed, Deployed and Active sessions hold the symbol
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SessionState::Armed | SessionState::Deployed | SessionState::Active
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Armed => "armed",
            SessionState::Deployed => "deployed",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    MaxDuration,
    GridCompleted,
    Manual,
    Halted,
    ExchangeRejection(String),
    RetriesExhausted(String),
}

impl ExitReason {
    /// Failure exits end in ABORTED, the rest in CLOSED
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ExitReason::Halted | ExitReason::ExchangeRejection(_) | ExitReason::RetriesExhausted(_)
        )
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "stop-loss"),
            ExitReason::TakeProfit => write!(f, "take-profit"),
            ExitReason::MaxDuration => write!(f, "max duration"),
            ExitReason::GridCompleted => write!(f, "grid completed"),
            ExitReason::Manual => write!(f, "manual"),
            ExitReason::Halted => write!(f, "global halt"),
            ExitReason::ExchangeRejection(msg) => write!(f, "exchange rejection: {}", msg),
            ExitReason::RetriesExhausted(msg) => write!(f, "retries exhausted: {}", msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending, // Client id assigned, not yet acknowledged
    Open,
    Filled,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridOrder {
    pub client_id: String,
    pub exchange_id: Option<String>,
    pub level: usize,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub status: OrderStatus,
    pub paired_with: Option<String>, // Client id of the other leg
    pub fill_price: Option<f64>,
    #[serde(default)]
    pub market: bool, // Synthetic leg for a market close-out
}

impl GridOrder {
    fn limit(level: usize, side: Side, price: f64, size: f64) -> Self {
        Self {
            client_id: Uuid::new_v4().to_string(),
            exchange_id: None,
            level,
            side,
            price,
            size,
            status: OrderStatus::Pending,
            paired_with: None,
            fill_price: None,
            market: false,
        }
    }

    pub fn is_working(&self) -> bool {
        matches!(self.status, OrderStatus::Pending | OrderStatus::Open)
    }

    pub fn notional(&self) -> f64 {
        self.size * self.fill_price.unwrap_or(self.price)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
    pub at: DateTime<Utc>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub symbol: String,
    pub state: SessionState,
    pub exit_reason: Option<ExitReason>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub round_trips: usize,
    pub working_orders: usize,
}

enum Unwind {
    Flat,
    Held,           // Market close failed, inventory remains
    Resting(usize), // Cancels failed, orders still on the book
}

/// Everything a session needs from the outside for one call
pub struct SessionContext<'a> {
    pub gateway: &'a dyn ExchangeGateway,
    pub risk: &'a RiskController,
    pub store: Option<&'a SessionStore>,
    pub config: &'a SessionConfig,
    pub retry: &'a RetryPolicy,
    pub order_timeout: Duration,
}

/// One deployed grid, owned by its symbol pipeline until it is terminal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSession {
    pub id: String,
    pub symbol: String,
    pub state: SessionState,
    pub plan: GridPlan,
    pub orders: Vec<GridOrder>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub exit_reason: Option<ExitReason>,
    pub history: Vec<Transition>,
    pub last_event_seq: u64,
    pub regime_ok: bool,
}

impl GridSession {
    pub fn new(plan: GridPlan, opened_at: DateTime<Utc>) -> Self {
        Self {
            id: plan.session_id.clone(),
            symbol: plan.symbol.clone(),
            state: SessionState::Armed,
            plan,
            orders: Vec::new(),
            opened_at,
            closed_at: None,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            exit_reason: None,
            history: Vec::new(),
            last_event_seq: 0,
            regime_ok: true,
        }
    }

    /// Ask the risk controller to accept `plan` and return the armed session
    pub fn arm(plan: GridPlan, risk: &RiskController, now: DateTime<Utc>) -> TradingResult<Self> {
        risk.open_session(plan.capital_committed, now).into_result()?;
        info!(
            symbol = %plan.symbol,
            session = %plan.session_id,
            "🔒 Session armed with {:.2} committed", plan.capital_committed
        );
        Ok(Self::new(plan, now))
    }

    /// Place the buy side of the grid. Any unrecoverable placement failure
    /// aborts the session and unwinds what was already placed.
    pub async fn deploy(&mut self, ctx: &SessionContext<'_>, now: DateTime<Utc>) -> TradingResult<()> {
        if self.state != SessionState::Armed {
            return Err(TradingError::Internal(format!(
                "session {} cannot deploy from {}",
                self.id, self.state
            )));
        }
        if self.poll_halt(ctx, now).await? {
            return Ok(());
        }

        for (level, &price) in self.plan.buy_levels().iter().enumerate() {
            let size = self.plan.quantity_at(level);
            self.orders.push(GridOrder::limit(level, Side::Buy, price, size));
        }
        // Client ids hit the store before anything reaches the exchange
        self.persist(ctx)?;

        for idx in 0..self.orders.len() {
            if !self.place_or_abort(idx, ctx, now).await? {
                return Ok(());
            }
        }

        self.transition(SessionState::Deployed, ctx, now, None)?;
        info!(
            symbol = %self.symbol,
            session = %self.id,
            "🚀 Grid deployed: {} buy orders resting", self.orders.len()
        );
        Ok(())
    }

    /// Apply one exchange notification. Duplicates and events for other
    /// sessions are ignored.
    pub async fn handle_event(
        &mut self,
        event: &OrderEvent,
        ctx: &SessionContext<'_>,
        now: DateTime<Utc>,
    ) -> TradingResult<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        if event.seq != 0 && event.seq <= self.last_event_seq {
            debug!(session = %self.id, "Ignoring replayed event #{}", event.seq);
            return Ok(());
        }
        let Some(idx) = self.index_of_exchange_id(&event.order_id) else {
            return Ok(());
        };
        if event.seq != 0 {
            self.last_event_seq = event.seq;
        }
        if self.state == SessionState::Closing {
            return self.handle_closing_event(idx, &event.kind, ctx, now).await;
        }

        match event.kind {
            OrderEventKind::Filled { price, .. } => {
                if self.orders[idx].status == OrderStatus::Filled {
                    debug!(session = %self.id, "Ignoring duplicate fill for {}", event.order_id);
                    return Ok(());
                }
                self.apply_fill(idx, price, ctx, now).await?;
            }
            OrderEventKind::Cancelled => {
                if self.orders[idx].status != OrderStatus::Open {
                    return Ok(());
                }
                self.apply_external_cancel(idx, ctx, now).await?;
            }
        }

        if self.state.is_live() {
            self.persist(ctx)?;
            if !self.poll_halt(ctx, now).await? {
                self.check_fill_exits(ctx, now).await?;
            }
        }
        Ok(())
    }

    /// Evaluate price driven exits. Also the point where a global halt is
    /// noticed between fills.
    pub async fn on_price(
        &mut self,
        price: f64,
        ctx: &SessionContext<'_>,
        now: DateTime<Utc>,
    ) -> TradingResult<()> {
        if self.state == SessionState::Closing {
            return self.resume_unwind(ctx, now).await;
        }
        if !self.state.is_live() {
            return Ok(());
        }
        self.mark_to_market(price);
        if self.poll_halt(ctx, now).await? {
            return Ok(());
        }

        let stop = self.plan.lower_bound * (1.0 - ctx.config.stop_margin);
        if price < stop {
            warn!(
                symbol = %self.symbol,
                session = %self.id,
                "📉 Price {:.4} broke stop {:.4}", price, stop
            );
            return self.close(ExitReason::StopLoss, ctx, now).await;
        }

        if now - self.opened_at >= ctx.config.max_duration() {
            return self.close(ExitReason::MaxDuration, ctx, now).await;
        }
        Ok(())
    }

    /// Record the regime seen on the latest snapshot, then run price exits
    pub async fn on_snapshot(
        &mut self,
        snapshot: &MarketSnapshot,
        regime_threshold: f64,
        ctx: &SessionContext<'_>,
    ) -> TradingResult<()> {
        self.regime_ok = snapshot.trend_strength < regime_threshold;
        self.on_price(snapshot.close, ctx, snapshot.timestamp).await
    }

    /// Normal exit: CLOSING, unwind, then CLOSED. An unwind that cannot
    /// flatten the position ends in ABORTED instead. While an order refuses
    /// to cancel the session stays CLOSING and the next price or event
    /// retries the unwind.
    pub async fn close(
        &mut self,
        reason: ExitReason,
        ctx: &SessionContext<'_>,
        now: DateTime<Utc>,
    ) -> TradingResult<()> {
        if reason.is_failure() {
            return self.abort(reason, ctx, now).await;
        }
        self.finish(reason, SessionState::Closed, ctx, now).await
    }

    /// Failure exit: CLOSING, best-effort unwind, then ABORTED
    pub async fn abort(
        &mut self,
        reason: ExitReason,
        ctx: &SessionContext<'_>,
        now: DateTime<Utc>,
    ) -> TradingResult<()> {
        self.finish(reason, SessionState::Aborted, ctx, now).await
    }

    async fn finish(
        &mut self,
        reason: ExitReason,
        target: SessionState,
        ctx: &SessionContext<'_>,
        now: DateTime<Utc>,
    ) -> TradingResult<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        if self.state != SessionState::Closing {
            self.exit_reason = Some(reason.clone());
            self.transition(SessionState::Closing, ctx, now, Some(reason.to_string()))?;
        }

        let (final_state, flat) = match self.unwind(ctx, now).await? {
            Unwind::Flat => (target, true),
            Unwind::Held => (SessionState::Aborted, false),
            Unwind::Resting(count) => {
                // The slot stays taken until every order is resolved
                warn!(
                    symbol = %self.symbol,
                    session = %self.id,
                    "⏳ {} orders still resting after cancel, staying in closing", count
                );
                return Ok(());
            }
        };

        self.unrealized_pnl = 0.0;
        self.closed_at = Some(now);
        ctx.risk.close_session();
        let note = if flat {
            None
        } else {
            Some("position could not be flattened".to_string())
        };
        self.transition(final_state, ctx, now, note)?;
        if let Some(store) = ctx.store {
            store.save_risk_snapshot(&ctx.risk.snapshot(), now)?;
        }

        let reason_text = self
            .exit_reason
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        if final_state == SessionState::Closed {
            info!(
                symbol = %self.symbol,
                session = %self.id,
                "🏁 Session closed ({}), realized P&L {:.4}", reason_text, self.realized_pnl
            );
        } else {
            error!(
                symbol = %self.symbol,
                session = %self.id,
                "💥 Session aborted ({}), realized P&L {:.4}", reason_text, self.realized_pnl
            );
        }
        Ok(())
    }

    /// Cancel everything, then sell held inventory at market. Inventory is
    /// left alone while any order is still resting, since a resting sell may
    /// yet take it.
    async fn unwind(&mut self, ctx: &SessionContext<'_>, now: DateTime<Utc>) -> TradingResult<Unwind> {
        for idx in 0..self.orders.len() {
            if !self.orders[idx].is_working() {
                continue;
            }
            if let Err(err) = self.cancel_one(idx, ctx, now).await {
                error!(
                    session = %self.id,
                    "❌ Cancel of {} failed during unwind: {}", self.orders[idx].client_id, err
                );
            }
        }

        let resting = self.working_orders().count();
        if resting > 0 {
            self.persist(ctx)?;
            return Ok(Unwind::Resting(resting));
        }

        let held = self.held_buys();
        let quantity: f64 = held.iter().map(|&i| self.orders[i].size).sum();
        if quantity <= 0.0 {
            self.persist(ctx)?;
            return Ok(Unwind::Flat);
        }

        info!(
            symbol = %self.symbol,
            session = %self.id,
            "🧹 Closing {:.6} held at market", quantity
        );
        let price = match execution::close_position(ctx.gateway, &self.symbol, quantity, ctx.retry).await {
            Ok(price) => price,
            Err(err) => {
                error!(
                    symbol = %self.symbol,
                    session = %self.id,
                    "❌ Market close failed, {:.6} still held: {}", quantity, err
                );
                self.persist(ctx)?;
                return Ok(Unwind::Held);
            }
        };

        for buy_idx in held {
            let buy = &self.orders[buy_idx];
            let mut leg = GridOrder::limit(buy.level, Side::Sell, price, buy.size);
            leg.status = OrderStatus::Filled;
            leg.fill_price = Some(price);
            leg.market = true;
            leg.paired_with = Some(buy.client_id.clone());
            let leg_id = leg.client_id.clone();
            self.orders.push(leg);
            self.orders[buy_idx].paired_with = Some(leg_id);

            let pnl = self.round_trip_pnl(buy_idx, price, ctx.config.fee_rate);
            self.realize(pnl, ctx, now);
        }
        self.persist(ctx)?;
        Ok(Unwind::Flat)
    }

    /// Retry an unwind that left orders resting
    async fn resume_unwind(&mut self, ctx: &SessionContext<'_>, now: DateTime<Utc>) -> TradingResult<()> {
        let reason = self.exit_reason.clone().unwrap_or(ExitReason::Manual);
        self.close(reason, ctx, now).await
    }

    /// Bookkeeping for an event that lands while the session is closing
    async fn handle_closing_event(
        &mut self,
        idx: usize,
        kind: &OrderEventKind,
        ctx: &SessionContext<'_>,
        now: DateTime<Utc>,
    ) -> TradingResult<()> {
        if !self.orders[idx].is_working() {
            return Ok(());
        }
        match kind {
            OrderEventKind::Filled { price, .. } => self.record_fill(idx, *price, ctx, now),
            OrderEventKind::Cancelled => self.orders[idx].status = OrderStatus::Cancelled,
        }
        self.persist(ctx)?;
        self.resume_unwind(ctx, now).await
    }

    /// Cancel one working order, accounting for a fill that beat the cancel
    async fn cancel_one(&mut self, idx: usize, ctx: &SessionContext<'_>, now: DateTime<Utc>) -> TradingResult<()> {
        let order_id = match self.orders[idx].exchange_id.clone() {
            Some(order_id) => order_id,
            None => {
                // Never acknowledged, so it may or may not be on the book
                let client_id = self.orders[idx].client_id.clone();
                match ctx.gateway.find_by_client_id(&client_id).await? {
                    Some(found) => {
                        self.orders[idx].exchange_id = Some(found.order_id.clone());
                        self.orders[idx].status = OrderStatus::Open;
                        found.order_id
                    }
                    None => {
                        self.orders[idx].status = OrderStatus::Cancelled;
                        return Ok(());
                    }
                }
            }
        };

        match execution::cancel_order(ctx.gateway, &order_id, ctx.retry, ctx.order_timeout).await? {
            CancelOutcome::Cancelled => {
                self.orders[idx].status = OrderStatus::Cancelled;
            }
            CancelOutcome::NotFound => match ctx.gateway.order_status(&order_id).await?.status {
                ExchangeOrderStatus::Filled { price } => {
                    debug!(session = %self.id, "Order {} filled before cancel", order_id);
                    self.record_fill(idx, price, ctx, now);
                }
                _ => self.orders[idx].status = OrderStatus::Cancelled,
            },
        }
        Ok(())
    }

    /// Mark an order filled and do the follow-up: a paired sell for a buy,
    /// realization and optional refill for a sell
    pub(crate) async fn apply_fill(
        &mut self,
        idx: usize,
        price: f64,
        ctx: &SessionContext<'_>,
        now: DateTime<Utc>,
    ) -> TradingResult<()> {
        self.record_fill(idx, price, ctx, now);

        if self.state == SessionState::Deployed {
            self.transition(SessionState::Active, ctx, now, None)?;
        }

        match self.orders[idx].side {
            Side::Buy => {
                self.place_paired_sell(idx, ctx, now).await?;
            }
            Side::Sell => {
                if let Some(buy_idx) = self.paired_index(idx) {
                    self.maybe_refill(buy_idx, ctx, now).await?;
                }
            }
        }
        Ok(())
    }

    /// Bookkeeping half of a fill, shared by live events, recovery and unwind
    fn record_fill(&mut self, idx: usize, price: f64, ctx: &SessionContext<'_>, now: DateTime<Utc>) {
        let order = &mut self.orders[idx];
        order.status = OrderStatus::Filled;
        order.fill_price = Some(price);
        let (side, level, size) = (order.side, order.level, order.size);

        info!(
            symbol = %self.symbol,
            session = %self.id,
            "✅ {} filled at level {}: {:.6} @ {:.8}", side.as_str(), level, size, price
        );

        if side == Side::Sell {
            if let Some(buy_idx) = self.paired_index(idx) {
                let pnl = self.round_trip_pnl(buy_idx, price, ctx.config.fee_rate);
                self.realize(pnl, ctx, now);
            }
        }
    }

    pub(crate) async fn place_paired_sell(
        &mut self,
        buy_idx: usize,
        ctx: &SessionContext<'_>,
        now: DateTime<Utc>,
    ) -> TradingResult<bool> {
        if let Some(sell_idx) = self.paired_index(buy_idx) {
            if self.orders[sell_idx].status != OrderStatus::Cancelled {
                return Ok(true);
            }
        }
        let buy = &self.orders[buy_idx];
        let Some(target) = self.plan.take_profit_price(buy.level) else {
            return Err(TradingError::Internal(format!(
                "level {} has no take-profit level",
                buy.level
            )));
        };
        let mut sell = GridOrder::limit(buy.level, Side::Sell, target, buy.size);
        sell.paired_with = Some(buy.client_id.clone());
        let sell_id = sell.client_id.clone();

        self.orders.push(sell);
        self.orders[buy_idx].paired_with = Some(sell_id);
        let idx = self.orders.len() - 1;
        self.place_or_abort(idx, ctx, now).await
    }

    /// Put a fresh buy back on a level whose round trip just completed
    async fn maybe_refill(&mut self, buy_idx: usize, ctx: &SessionContext<'_>, now: DateTime<Utc>) -> TradingResult<()> {
        if !ctx.config.refill_enabled || !self.state.is_live() {
            return Ok(());
        }
        if ctx.config.regime_gate_refills && !self.regime_ok {
            debug!(session = %self.id, "Refill skipped, regime gate is closed");
            return Ok(());
        }
        let level = self.orders[buy_idx].level;
        if self.level_has_working_buy(level) {
            return Ok(());
        }
        let price = self.plan.buy_levels()[level];
        let size = self.plan.quantity_at(level);

        match ctx.risk.authorize_at(price * size, now) {
            Authorization::Approved => {}
            Authorization::Denied(reason) => {
                info!(session = %self.id, "⏸️  Refill at level {} denied: {}", level, reason);
                return Ok(());
            }
        }

        self.orders.push(GridOrder::limit(level, Side::Buy, price, size));
        let idx = self.orders.len() - 1;
        if self.place_or_abort(idx, ctx, now).await? {
            debug!(session = %self.id, "🔄 Refilled level {} @ {:.8}", level, price);
        }
        Ok(())
    }

    /// A resting order vanished without a fill. The level is re-placed; a buy
    /// needs a fresh authorization first.
    pub(crate) async fn apply_external_cancel(
        &mut self,
        idx: usize,
        ctx: &SessionContext<'_>,
        now: DateTime<Utc>,
    ) -> TradingResult<()> {
        let order = &mut self.orders[idx];
        order.status = OrderStatus::Cancelled;
        let (side, level, price, size) = (order.side, order.level, order.price, order.size);
        warn!(
            symbol = %self.symbol,
            session = %self.id,
            "⚠️  {} at level {} was cancelled by the exchange", side.as_str(), level
        );

        if side == Side::Buy {
            if let Authorization::Denied(reason) = ctx.risk.authorize_at(price * size, now) {
                info!(session = %self.id, "⏸️  Not re-placing level {}: {}", level, reason);
                return Ok(());
            }
        }

        let mut replacement = GridOrder::limit(level, side, price, size);
        if side == Side::Sell {
            // Rewire the held buy to the replacement leg
            if let Some(buy_idx) = self.paired_index(idx) {
                replacement.paired_with = Some(self.orders[buy_idx].client_id.clone());
                self.orders[buy_idx].paired_with = Some(replacement.client_id.clone());
            }
        }
        self.orders.push(replacement);
        let new_idx = self.orders.len() - 1;
        self.place_or_abort(new_idx, ctx, now).await?;
        Ok(())
    }

    /// Submit order `idx`. Returns false when the failure aborted the session.
    pub(crate) async fn place_or_abort(
        &mut self,
        idx: usize,
        ctx: &SessionContext<'_>,
        now: DateTime<Utc>,
    ) -> TradingResult<bool> {
        match self.place(idx, ctx).await {
            Ok(()) => Ok(true),
            Err(err) => {
                let reason = match &err {
                    TradingError::ExchangeRejection(msg) => ExitReason::ExchangeRejection(msg.clone()),
                    TradingError::MaxRetriesExceeded { .. } | TradingError::ExchangeTransport(_) => {
                        ExitReason::RetriesExhausted(err.to_string())
                    }
                    _ => return Err(err),
                };
                error!(
                    symbol = %self.symbol,
                    session = %self.id,
                    category = err.category(),
                    "❌ Order placement failed: {}", err
                );
                // Left pending: the unwind looks it up by client id in case it landed
                self.abort(reason, ctx, now).await?;
                Ok(false)
            }
        }
    }

    async fn place(&mut self, idx: usize, ctx: &SessionContext<'_>) -> TradingResult<()> {
        let request = {
            let order = &self.orders[idx];
            OrderRequest {
                client_id: order.client_id.clone(),
                symbol: self.symbol.clone(),
                side: order.side,
                price: order.price,
                size: order.size,
            }
        };
        self.persist(ctx)?;

        let order_id = execution::place_order(ctx.gateway, &request, ctx.retry, ctx.order_timeout).await?;
        let order = &mut self.orders[idx];
        order.exchange_id = Some(order_id);
        order.status = OrderStatus::Open;
        debug!(
            session = %self.id,
            "📤 {} level {} resting @ {:.8}", request.side.as_str(), order.level, request.price
        );
        Ok(())
    }

    pub(crate) async fn check_fill_exits(&mut self, ctx: &SessionContext<'_>, now: DateTime<Utc>) -> TradingResult<()> {
        let target = self.plan.capital_committed * ctx.config.take_profit_fraction;
        if self.realized_pnl > target {
            info!(
                symbol = %self.symbol,
                session = %self.id,
                "💰 Take-profit reached: {:.4} > {:.4}", self.realized_pnl, target
            );
            return self.close(ExitReason::TakeProfit, ctx, now).await;
        }

        if !ctx.config.refill_enabled && self.state == SessionState::Active && self.grid_completed() {
            return self.close(ExitReason::GridCompleted, ctx, now).await;
        }
        Ok(())
    }

    /// Returns true when a halt was found and the session aborted
    pub(crate) async fn poll_halt(&mut self, ctx: &SessionContext<'_>, now: DateTime<Utc>) -> TradingResult<bool> {
        if !ctx.risk.is_halted() {
            return Ok(false);
        }
        warn!(symbol = %self.symbol, session = %self.id, "🛑 Global halt observed, unwinding");
        self.abort(ExitReason::Halted, ctx, now).await?;
        Ok(true)
    }

    fn transition(
        &mut self,
        to: SessionState,
        ctx: &SessionContext<'_>,
        at: DateTime<Utc>,
        note: Option<String>,
    ) -> TradingResult<()> {
        let from = self.state;
        self.state = to;
        info!(
            symbol = %self.symbol,
            session = %self.id,
            "🔀 {} → {}{}",
            from,
            to,
            note.as_deref().map(|n| format!(" ({})", n)).unwrap_or_default()
        );
        if let Some(store) = ctx.store {
            store.record_transition(&self.id, from, to, at, note.as_deref())?;
        }
        self.history.push(Transition { from, to, at, note });
        self.persist(ctx)
    }

    pub(crate) fn persist(&self, ctx: &SessionContext<'_>) -> TradingResult<()> {
        match ctx.store {
            Some(store) => store.save_session(self),
            None => Ok(()),
        }
    }

    fn realize(&mut self, pnl: f64, ctx: &SessionContext<'_>, now: DateTime<Utc>) {
        self.realized_pnl += pnl;
        ctx.risk.record_fill_at(pnl, now);
        if let Some(store) = ctx.store {
            if let Err(err) = store.save_risk_snapshot(&ctx.risk.snapshot(), now) {
                warn!("⚠️  Failed to persist risk snapshot: {}", err);
            }
        }
    }

    fn round_trip_pnl(&self, buy_idx: usize, sell_price: f64, fee_rate: f64) -> f64 {
        let buy = &self.orders[buy_idx];
        let buy_price = buy.fill_price.unwrap_or(buy.price);
        let size = buy.size;
        size * (sell_price - buy_price) - fee_rate * size * (buy_price + sell_price)
    }

    // Gross of fees; fees are charged when the round trip realizes
    fn mark_to_market(&mut self, price: f64) {
        self.unrealized_pnl = self
            .held_buys()
            .into_iter()
            .map(|i| self.round_trip_pnl(i, price, 0.0))
            .sum();
    }

    fn index_of_exchange_id(&self, order_id: &str) -> Option<usize> {
        self.orders
            .iter()
            .position(|o| o.exchange_id.as_deref() == Some(order_id))
    }

    fn index_of_client_id(&self, client_id: &str) -> Option<usize> {
        self.orders.iter().position(|o| o.client_id == client_id)
    }

    fn paired_index(&self, idx: usize) -> Option<usize> {
        self.orders[idx]
            .paired_with
            .as_deref()
            .and_then(|id| self.index_of_client_id(id))
    }

    fn level_has_working_buy(&self, level: usize) -> bool {
        self.orders
            .iter()
            .any(|o| o.side == Side::Buy && o.level == level && o.is_working())
    }

    /// Filled buys whose sell leg has not filled yet
    fn held_buys(&self) -> Vec<usize> {
        (0..self.orders.len())
            .filter(|&i| {
                let o = &self.orders[i];
                o.side == Side::Buy
                    && o.status == OrderStatus::Filled
                    && !self
                        .paired_index(i)
                        .map(|s| self.orders[s].status == OrderStatus::Filled)
                        .unwrap_or(false)
            })
            .collect()
    }

    /// Filled buys that still lack a sell leg on the exchange
    pub(crate) fn unpaired_buys(&self) -> Vec<usize> {
        (0..self.orders.len())
            .filter(|&i| {
                let o = &self.orders[i];
                o.side == Side::Buy
                    && o.status == OrderStatus::Filled
                    && self
                        .paired_index(i)
                        .map(|s| self.orders[s].status == OrderStatus::Cancelled)
                        .unwrap_or(true)
            })
            .collect()
    }

    fn grid_completed(&self) -> bool {
        !self.orders.iter().any(GridOrder::is_working) && self.held_buys().is_empty()
    }

    pub fn held_quantity(&self) -> f64 {
        self.held_buys().iter().map(|&i| self.orders[i].size).sum()
    }

    /// Quote capital tied up in open buys plus inventory awaiting its sell
    pub fn capital_in_use(&self) -> f64 {
        let open_buys: f64 = self
            .orders
            .iter()
            .filter(|o| o.side == Side::Buy && o.is_working())
            .map(GridOrder::notional)
            .sum();
        let held: f64 = self.held_buys().iter().map(|&i| self.orders[i].notional()).sum();
        open_buys + held
    }

    pub fn working_orders(&self) -> impl Iterator<Item = &GridOrder> {
        self.orders.iter().filter(|o| o.is_working())
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            symbol: self.symbol.clone(),
            state: self.state,
            exit_reason: self.exit_reason.clone(),
            opened_at: self.opened_at,
            closed_at: self.closed_at,
            realized_pnl: self.realized_pnl,
            unrealized_pnl: self.unrealized_pnl,
            round_trips: self
                .orders
                .iter()
                .filter(|o| o.side == Side::Sell && o.status == OrderStatus::Filled)
                .count(),
            working_orders: self.working_orders().count(),
        }
    }
}
