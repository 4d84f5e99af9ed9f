//! Unified error handling for the grid trading engine
//!
//! Every failure the core can produce maps onto one `TradingError` variant so
//! callers can decide between local recovery (drop a bar, retry an order) and
//! surfacing the failure to session or controller state.

use std::io;
use thiserror::Error;

use crate::config::ConfigError;
use crate::core::gateway::GatewayError;
use crate::core::risk::DenyReason;

/// A bar that failed basic consistency checks. The snapshot is dropped and the
/// pipeline keeps running.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataQualityError {
    #[error("{symbol}: non-positive price in bar at {open_time}")]
    NonPositivePrice { symbol: String, open_time: String },

    #[error("{symbol}: inconsistent OHLC (o={open}, h={high}, l={low}, c={close})")]
    InconsistentOhlc {
        symbol: String,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },

    #[error("{symbol}: negative volume {volume}")]
    NegativeVolume { symbol: String, volume: f64 },

    #[error("{symbol}: bar at {got} does not follow previous bar at {last}")]
    OutOfOrder {
        symbol: String,
        last: String,
        got: String,
    },
}

/// Grid parameters that cannot produce a usable plan. The signal is dropped
/// and no session is created.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanningError {
    #[error("signal for {0} did not fire")]
    SignalNotFired(String),

    #[error("short grids are not supported on a spot account")]
    UnsupportedDirection,

    #[error("insufficient budget: {available:.4} per level, minimum order value is {required:.4}")]
    InsufficientBudget { available: f64, required: f64 },

    #[error("degenerate grid: {0}")]
    DegenerateGrid(String),
}

/// Main error type for the grid trading engine
#[derive(Debug, Error)]
pub enum TradingError {
    #[error("Data quality error: {0}")]
    DataQuality(#[from] DataQualityError),

    #[error("Planning error: {0}")]
    Planning(#[from] PlanningError),

    #[error("Exchange transport error: {0}")]
    ExchangeTransport(String),

    #[error("Exchange rejected request: {0}")]
    ExchangeRejection(String),

    #[error("Risk violation: {0}")]
    RiskViolation(DenyReason),

    #[error("Maximum retries exceeded after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TradingError {
    /// Get a user-friendly error message with helpful context
    pub fn user_message(&self) -> String {
        match self {
            TradingError::Config(err) => {
                format!(
                    "{}\n\n\
                    💡 Check config.toml for:\n\
                    - Fractions inside (0, 1]\n\
                    - An even grid level count\n\
                    - A fast EMA period shorter than the slow one",
                    err
                )
            }
            TradingError::RiskViolation(DenyReason::Halted { reason }) => {
                format!(
                    "Trading is halted: {}\n\n\
                    💡 The halt is sticky. Review open positions, then run:\n\
                    grid-engine reset-halt",
                    reason
                )
            }
            TradingError::ExchangeRejection(msg) => {
                format!(
                    "Exchange rejected the request: {}\n\n\
                    💡 Check account permissions and instrument filters",
                    msg
                )
            }
            _ => self.to_string(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, TradingError::ExchangeTransport(_))
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            TradingError::DataQuality(_) => "data_quality",
            TradingError::Planning(_) => "planning",
            TradingError::ExchangeTransport(_) | TradingError::MaxRetriesExceeded { .. } => {
                "exchange_transport"
            }
            TradingError::ExchangeRejection(_) => "exchange_rejection",
            TradingError::RiskViolation(_) => "risk",
            TradingError::Config(_) => "config",
            TradingError::Database(_) => "database",
            TradingError::Io(_) => "io",
            TradingError::Internal(_) => "internal",
        }
    }
}

// Conversion implementations for common error types

impl From<GatewayError> for TradingError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Rejected(reason) => TradingError::ExchangeRejection(reason),
            other => TradingError::ExchangeTransport(other.to_string()),
        }
    }
}

impl From<io::Error> for TradingError {
    fn from(err: io::Error) -> Self {
        TradingError::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for TradingError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => {
                TradingError::Database("Query returned no rows".to_string())
            }
            _ => TradingError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for TradingError {
    fn from(err: serde_json::Error) -> Self {
        TradingError::Database(format!("JSON payload error: {}", err))
    }
}

impl From<toml::de::Error> for TradingError {
    fn from(err: toml::de::Error) -> Self {
        TradingError::Config(ConfigError::Parse(err.to_string()))
    }
}

/// Result type alias using TradingError
pub type TradingResult<T> = Result<T, TradingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        let err = TradingError::ExchangeTransport("reset by peer".to_string());
        assert_eq!(err.category(), "exchange_transport");

        let err: TradingError = PlanningError::UnsupportedDirection.into();
        assert_eq!(err.category(), "planning");

        let err = TradingError::Database("locked".to_string());
        assert_eq!(err.category(), "database");
    }

    #[test]
    fn test_retryable() {
        assert!(TradingError::ExchangeTransport("timeout".to_string()).is_retryable());
        assert!(!TradingError::ExchangeRejection("insufficient balance".to_string()).is_retryable());
    }

    #[test]
    fn test_gateway_conversion() {
        let err: TradingError = GatewayError::Rejected("account restricted".to_string()).into();
        assert!(matches!(err, TradingError::ExchangeRejection(_)));

        let err: TradingError = GatewayError::RateLimited.into();
        assert!(matches!(err, TradingError::ExchangeTransport(_)));
    }

    #[test]
    fn test_user_message_for_halt() {
        let err = TradingError::RiskViolation(DenyReason::Halted {
            reason: "drawdown 25.00% >= limit 25.00%".to_string(),
        });
        let msg = err.user_message();
        assert!(msg.contains("reset-halt"));
        assert!(msg.contains("💡"));
    }
}
