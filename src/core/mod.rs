// Core trading logic modules

pub mod types;
pub mod indicators;
pub mod signal;
pub mod grid_planner;
pub mod risk;
pub mod gateway;
pub mod retry;
pub mod execution;
pub mod session;
pub mod recovery;
pub mod engine;

// Re-export commonly used types
pub use types::{Bar, Direction, MarketSnapshot, Side, Signal, SignalFactors};
pub use indicators::IndicatorEngine;
pub use signal::SignalEvaluator;
pub use grid_planner::{GridPlan, GridPlanner};
pub use risk::{Authorization, DenyReason, RiskController, RiskState};
pub use gateway::{ExchangeGateway, GatewayError, OrderEvent, OrderEventKind, OrderRequest};
pub use retry::RetryPolicy;
pub use session::{ExitReason, GridOrder, GridSession, OrderStatus, SessionContext, SessionState, SessionSummary};
pub use recovery::{reconcile, ReconcileReport};
pub use engine::{EngineReport, PipelineInput, PipelineReport, SymbolPipeline, TradingEngine};
