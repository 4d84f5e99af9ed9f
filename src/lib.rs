// Grid Trading Engine Library
//
// Volatility-sized grid sessions gated by a trend-strength regime filter,
// with one shared risk controller across all symbols

pub mod core;
pub mod config;
pub mod db;          // SQLite persistence for sessions and risk state
pub mod error;       // Unified error handling
pub mod simulation;  // In-process paper exchange

// Re-export core trading types
pub use core::{
    Authorization, Bar, DenyReason, Direction, EngineReport, ExitReason, GridPlan, GridPlanner,
    GridSession, IndicatorEngine, MarketSnapshot, RiskController, RiskState, SessionState,
    Signal, SignalEvaluator, SymbolPipeline, TradingEngine,
};

// Re-export error types
pub use error::{DataQualityError, PlanningError, TradingError, TradingResult};

// Re-export configuration
pub use config::{ConfigError, EngineConfig};

// Re-export database types
pub use db::{Database, SessionStore};

pub use simulation::PaperExchange;
