// Entry signal evaluation: a conjunctive gate over volatility, volume,
// price range and trend regime

use tracing::{debug, info};

use crate::config::SignalConfig;
use crate::core::types::{Direction, MarketSnapshot, Signal, SignalFactors};

#[derive(Debug, Clone)]
pub struct SignalEvaluator {
    config: SignalConfig,
}

impl SignalEvaluator {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    /// Decide whether `snapshot` justifies opening a grid.
    ///
    /// `recent` holds the snapshots preceding this one, oldest first. Rolling
    /// averages use its last `lookback` entries and stay failed until that many
    /// exist. `session_active` blocks entries while a grid on the same symbol
    /// is still live.
    pub fn evaluate(
        &self,
        snapshot: &MarketSnapshot,
        recent: &[MarketSnapshot],
        session_active: bool,
    ) -> Signal {
        let lookback = self.config.lookback;
        let window = &recent[recent.len().saturating_sub(lookback)..];
        let warmed_up = window.len() >= lookback;

        let volatility_ok = warmed_up && {
            let avg_atr = mean(window.iter().map(|s| s.atr));
            snapshot.atr > avg_atr * self.config.volatility_multiplier
        };

        let volume_ok = warmed_up && {
            let avg_volume = mean(window.iter().map(|s| s.volume));
            snapshot.volume > avg_volume * self.config.volume_multiplier
        };

        let high = window.iter().map(|s| s.high).fold(snapshot.high, f64::max);
        let low = window.iter().map(|s| s.low).fold(snapshot.low, f64::min);
        let price_range_ok =
            snapshot.atr > 0.0 && (high - low) >= snapshot.atr * self.config.min_range_atr_ratio;

        // High trend strength disables entries; it never triggers them
        let regime_ok = snapshot.trend_strength < self.config.regime_threshold;

        let factors = SignalFactors {
            volatility_ok,
            volume_ok,
            price_range_ok,
            regime_ok,
        };

        let fired = factors.all_pass() && !session_active;
        let direction = if !fired {
            Direction::Flat
        } else if self.config.allow_short && snapshot.ema_fast < snapshot.ema_slow {
            Direction::Short
        } else {
            Direction::Long
        };

        let signal = Signal {
            symbol: snapshot.symbol.clone(),
            timestamp: snapshot.timestamp,
            direction,
            confidence: factors.passing() as f64 / 4.0,
            factors,
            regime_gated: !regime_ok,
            session_blocked: session_active,
        };

        if signal.fired() {
            info!(
                symbol = %signal.symbol,
                confidence = signal.confidence,
                "📡 ENTRY SIGNAL {:?} (ATR {:.4}, ADX {:.1}, volume {:.2})",
                signal.direction, snapshot.atr, snapshot.trend_strength, snapshot.volume
            );
        } else {
            debug!(
                symbol = %signal.symbol,
                ?factors,
                regime_gated = signal.regime_gated,
                session_blocked = session_active,
                "No entry"
            );
        }

        signal
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}
