// Common market and signal types used across the pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A closed OHLCV bar as delivered by the market data feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Set by the feed when bars are missing before this one
    #[serde(default)]
    pub gap: bool,
}

/// Indicator output for one closed bar. Produced once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub atr: f64,
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub trend_strength: f64, // ADX proxy, 0-100
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
    Flat, // No entry
}

/// Which of the entry filters passed for a snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalFactors {
    pub volatility_ok: bool,
    pub volume_ok: bool,
    pub price_range_ok: bool,
    pub regime_ok: bool,
}

impl SignalFactors {
    pub fn all_pass(&self) -> bool {
        self.volatility_ok && self.volume_ok && self.price_range_ok && self.regime_ok
    }

    pub fn passing(&self) -> usize {
        [self.volatility_ok, self.volume_ok, self.price_range_ok, self.regime_ok]
            .iter()
            .filter(|&&ok| ok)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub confidence: f64, // Advisory only, in [0, 1]
    pub factors: SignalFactors,
    pub regime_gated: bool,
    pub session_blocked: bool,
}

impl Signal {
    pub fn fired(&self) -> bool {
        self.direction != Direction::Flat
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// Round a price to the instrument tick
pub fn round_to_decimals(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Floor a quantity to the instrument step
pub fn floor_to_decimals(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    // Nudge by a relative epsilon so 0.3/0.1-style float noise does not lose a step
    ((value * factor) * (1.0 + 1e-12)).floor() / factor
}
