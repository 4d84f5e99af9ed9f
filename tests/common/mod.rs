// Common test utilities and helpers
#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

use grid_trading_engine::config::{GridConfig, RiskConfig, SessionConfig};
use grid_trading_engine::core::gateway::OrderEvent;
use grid_trading_engine::core::retry::RetryPolicy;
use grid_trading_engine::core::session::{GridOrder, OrderStatus, SessionContext};
use grid_trading_engine::core::types::{Direction, Side, SignalFactors};
use grid_trading_engine::{
    Bar, Database, EngineConfig, GridPlan, GridPlanner, GridSession, PaperExchange,
    RiskController, SessionStore, Signal,
};

pub const SYMBOL: &str = "SOLUSDT";

/// Fixed start of every test clock
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

pub fn minutes(n: i64) -> ChronoDuration {
    ChronoDuration::minutes(n)
}

/// Create a test configuration with fast retries
pub fn create_test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.symbols = vec![SYMBOL.to_string()];
    config.execution.order_timeout_ms = 200;
    config.execution.base_delay_ms = 1;
    config.execution.max_delay_ms = 4;
    config.execution.max_attempts = 3;
    config
}

/// Create a temporary directory for test databases
pub fn create_temp_db_dir() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let db_path = temp_dir.path().join("test.db");
    (temp_dir, db_path)
}

pub fn memory_store() -> SessionStore {
    let db = Database::new_in_memory().expect("Failed to open database");
    db.run_migrations().expect("Failed to migrate");
    SessionStore::new(&db)
}

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(4), 2.0)
}

pub fn long_signal(symbol: &str, at: DateTime<Utc>) -> Signal {
    Signal {
        symbol: symbol.to_string(),
        timestamp: at,
        direction: Direction::Long,
        confidence: 1.0,
        factors: SignalFactors {
            volatility_ok: true,
            volume_ok: true,
            price_range_ok: true,
            regime_ok: true,
        },
        regime_gated: false,
        session_blocked: false,
    }
}

/// A plan centred on 100 with one ATR of 1.0, so buys sit from 98 upwards
pub fn plan_with_levels(levels: usize, budget: f64) -> GridPlan {
    let config = GridConfig {
        levels,
        ..GridConfig::default()
    };
    GridPlanner::new(config)
        .plan(&long_signal(SYMBOL, t0()), 100.0, 1.0, budget)
        .expect("valid plan")
}

/// Everything a session needs, backed by a paper exchange
pub struct Harness {
    pub exchange: PaperExchange,
    pub risk: RiskController,
    pub session_config: SessionConfig,
    pub retry: RetryPolicy,
    pub store: Option<SessionStore>,
    pub order_timeout: Duration,
}

impl Harness {
    pub fn new(session_config: SessionConfig) -> (Self, UnboundedReceiver<OrderEvent>) {
        let (exchange, events) = PaperExchange::new();
        let harness = Self {
            exchange,
            risk: RiskController::new(RiskConfig::default(), 1000.0),
            session_config,
            retry: fast_retry(3),
            store: None,
            order_timeout: Duration::from_millis(200),
        };
        (harness, events)
    }

    pub fn with_store(mut self, store: SessionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn ctx(&self) -> SessionContext<'_> {
        SessionContext {
            gateway: &self.exchange,
            risk: &self.risk,
            store: self.store.as_ref(),
            config: &self.session_config,
            retry: &self.retry,
            order_timeout: self.order_timeout,
        }
    }

    pub fn arm(&self, plan: GridPlan) -> GridSession {
        GridSession::arm(plan, &self.risk, t0()).expect("plan within budget")
    }
}

pub fn no_refill() -> SessionConfig {
    SessionConfig {
        refill_enabled: false,
        ..SessionConfig::default()
    }
}

/// Deliver every queued exchange event to the session
pub async fn pump(
    events: &mut UnboundedReceiver<OrderEvent>,
    session: &mut GridSession,
    ctx: &SessionContext<'_>,
    now: DateTime<Utc>,
) -> usize {
    let mut delivered = 0;
    while let Ok(event) = events.try_recv() {
        session
            .handle_event(&event, ctx, now)
            .await
            .expect("event handled");
        delivered += 1;
    }
    delivered
}

pub fn open_orders(session: &GridSession, side: Side) -> Vec<GridOrder> {
    session
        .orders
        .iter()
        .filter(|o| o.side == side && o.status == OrderStatus::Open)
        .cloned()
        .collect()
}

pub fn exchange_id(order: &GridOrder) -> String {
    order.exchange_id.clone().expect("order acknowledged")
}

/// Choppy bars with constant highs and lows, then a wide high-volume bar
/// that passes every entry filter
pub fn entry_bars(symbol: &str, calm: usize) -> Vec<Bar> {
    let mut bars = Vec::with_capacity(calm + 1);
    for i in 0..calm {
        let (open, close) = if i % 2 == 0 { (100.0, 101.0) } else { (101.0, 100.0) };
        bars.push(Bar {
            symbol: symbol.to_string(),
            open_time: t0() + minutes(i as i64),
            open,
            high: 101.5,
            low: 99.5,
            close,
            volume: 100.0,
            gap: false,
        });
    }
    bars.push(Bar {
        symbol: symbol.to_string(),
        open_time: t0() + minutes(calm as i64),
        open: 100.5,
        high: 103.0,
        low: 98.0,
        close: 100.5,
        volume: 500.0,
        gap: false,
    });
    bars
}
