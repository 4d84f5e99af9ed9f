// Rolling technical indicators computed per symbol from closed bars

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::IndicatorConfig;
use crate::core::types::{Bar, MarketSnapshot};
use crate::error::DataQualityError;

/// Rolling state for one symbol. Only bars up to the latest close are ever seen.
#[derive(Debug, Clone, Default)]
struct SymbolWindow {
    last_bar: Option<Bar>,
    last_open_time: Option<DateTime<Utc>>,
    true_ranges: VecDeque<f64>,
    plus_dm: VecDeque<f64>,
    minus_dm: VecDeque<f64>,
    dx: VecDeque<f64>,
    ema_fast: Option<f64>,
    ema_slow: Option<f64>,
    bars_seen: usize,
}

impl SymbolWindow {
    // Clears indicator history but keeps the ordering watermark
    fn reset(&mut self) {
        let last_open_time = self.last_open_time;
        *self = SymbolWindow {
            last_open_time,
            ..SymbolWindow::default()
        };
    }
}

#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    config: IndicatorConfig,
    windows: HashMap<String, SymbolWindow>,
}

impl IndicatorEngine {
    pub fn new(config: IndicatorConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
        }
    }

    /// Feed one closed bar.
    ///
    /// Returns `Ok(None)` while the symbol is still warming up and
    /// `Err` (with the bar discarded) when it fails consistency checks.
    pub fn update(&mut self, bar: &Bar) -> Result<Option<MarketSnapshot>, DataQualityError> {
        validate_bar(bar)?;

        let window = self.windows.entry(bar.symbol.clone()).or_default();

        if let Some(last) = window.last_open_time {
            if bar.open_time <= last {
                return Err(DataQualityError::OutOfOrder {
                    symbol: bar.symbol.clone(),
                    last: last.to_rfc3339(),
                    got: bar.open_time.to_rfc3339(),
                });
            }
        }

        if bar.gap && window.bars_seen > 0 {
            warn!(
                symbol = %bar.symbol,
                "⏭️  Feed reported a gap before {}, restarting indicator warm-up",
                bar.open_time
            );
            window.reset();
        }

        let cap = self.config.window_size;

        let true_range = match &window.last_bar {
            Some(prev) => (bar.high - bar.low)
                .max((bar.high - prev.close).abs())
                .max((bar.low - prev.close).abs()),
            None => bar.high - bar.low,
        };
        push_capped(&mut window.true_ranges, true_range, cap);

        if let Some(prev) = &window.last_bar {
            let up_move = (bar.high - prev.high).max(0.0);
            let down_move = (prev.low - bar.low).max(0.0);
            let plus = if up_move > down_move { up_move } else { 0.0 };
            let minus = if down_move > up_move { down_move } else { 0.0 };
            push_capped(&mut window.plus_dm, plus, cap);
            push_capped(&mut window.minus_dm, minus, cap);

            let n = self.config.adx_period;
            if window.plus_dm.len() >= n {
                let atr = tail_mean(&window.true_ranges, n).max(1e-9);
                let plus_di = tail_mean(&window.plus_dm, n) / atr * 100.0;
                let minus_di = tail_mean(&window.minus_dm, n) / atr * 100.0;
                let denom = (plus_di + minus_di).max(1e-9);
                let dx = (plus_di - minus_di).abs() / denom * 100.0;
                push_capped(&mut window.dx, dx, cap);
            }
        }

        window.ema_fast = Some(next_ema(window.ema_fast, bar.close, self.config.ema_fast));
        window.ema_slow = Some(next_ema(window.ema_slow, bar.close, self.config.ema_slow));

        window.bars_seen += 1;
        window.last_open_time = Some(bar.open_time);
        window.last_bar = Some(bar.clone());

        let ready = window.true_ranges.len() >= self.config.atr_period
            && window.dx.len() >= self.config.adx_period
            && window.bars_seen >= self.config.ema_slow;

        if !ready {
            debug!(symbol = %bar.symbol, bars = window.bars_seen, "Indicators warming up");
            return Ok(None);
        }

        let (ema_fast, ema_slow) = match (window.ema_fast, window.ema_slow) {
            (Some(fast), Some(slow)) => (fast, slow),
            _ => return Ok(None),
        };

        Ok(Some(MarketSnapshot {
            symbol: bar.symbol.clone(),
            timestamp: bar.open_time,
            close: bar.close,
            high: bar.high,
            low: bar.low,
            volume: bar.volume,
            atr: tail_mean(&window.true_ranges, self.config.atr_period),
            ema_fast,
            ema_slow,
            trend_strength: tail_mean(&window.dx, self.config.adx_period),
        }))
    }

    /// Drop all history for a symbol, including its ordering watermark
    pub fn reset(&mut self, symbol: &str) {
        self.windows.remove(symbol);
    }

    pub fn bars_seen(&self, symbol: &str) -> usize {
        self.windows.get(symbol).map(|w| w.bars_seen).unwrap_or(0)
    }
}

fn validate_bar(bar: &Bar) -> Result<(), DataQualityError> {
    let prices = [bar.open, bar.high, bar.low, bar.close];
    if prices.iter().any(|p| !(p.is_finite() && *p > 0.0)) {
        return Err(DataQualityError::NonPositivePrice {
            symbol: bar.symbol.clone(),
            open_time: bar.open_time.to_rfc3339(),
        });
    }

    if bar.low > bar.open.min(bar.close) || bar.high < bar.open.max(bar.close) || bar.low > bar.high {
        return Err(DataQualityError::InconsistentOhlc {
            symbol: bar.symbol.clone(),
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
        });
    }

    if !(bar.volume >= 0.0) {
        return Err(DataQualityError::NegativeVolume {
            symbol: bar.symbol.clone(),
            volume: bar.volume,
        });
    }

    Ok(())
}

fn push_capped(buf: &mut VecDeque<f64>, value: f64, cap: usize) {
    buf.push_back(value);
    while buf.len() > cap {
        buf.pop_front();
    }
}

fn tail_mean(buf: &VecDeque<f64>, period: usize) -> f64 {
    let n = period.min(buf.len());
    if n == 0 {
        return 0.0;
    }
    buf.iter().rev().take(n).sum::<f64>() / n as f64
}

fn next_ema(previous: Option<f64>, price: f64, period: usize) -> f64 {
    let alpha = 2.0 / (period as f64 + 1.0);
    match previous {
        Some(ema) => alpha * price + (1.0 - alpha) * ema,
        None => price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn config() -> IndicatorConfig {
        IndicatorConfig {
            atr_period: 3,
            adx_period: 3,
            ema_fast: 2,
            ema_slow: 4,
            window_size: 20,
        }
    }

    fn bar(i: i64, o: f64, h: f64, l: f64, c: f64) -> Bar {
        Bar {
            symbol: "TEST".to_string(),
            open_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(i),
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 10.0,
            gap: false,
        }
    }

    #[test]
    fn test_warm_up_then_snapshot() {
        let mut engine = IndicatorEngine::new(config());
        let mut produced = Vec::new();
        for i in 0..8 {
            let base = 100.0 + i as f64;
            produced.push(engine.update(&bar(i, base, base + 2.0, base - 1.0, base + 1.0)).unwrap());
        }
        // ADX needs 2 * period bars before the first value
        assert!(produced[..5].iter().all(|s| s.is_none()));
        assert!(produced[5..].iter().all(|s| s.is_some()));
    }

    #[test]
    fn test_atr_is_mean_true_range() {
        let mut engine = IndicatorEngine::new(config());
        let mut last = None;
        // Constant 2.0 range bars with unchanged closes give TR == 2.0 every bar
        for i in 0..6 {
            last = engine.update(&bar(i, 100.0, 101.0, 99.0, 100.0)).unwrap();
        }
        let snap = last.unwrap();
        assert!((snap.atr - 2.0).abs() < 1e-12);
        // No directional movement at all
        assert!(snap.trend_strength.abs() < 1e-9);
    }

    #[test]
    fn test_strong_trend_has_high_strength() {
        let mut engine = IndicatorEngine::new(config());
        let mut last = None;
        for i in 0..10 {
            let base = 100.0 + 5.0 * i as f64;
            last = engine.update(&bar(i, base, base + 1.0, base - 0.5, base + 0.8)).unwrap();
        }
        assert!(last.unwrap().trend_strength > 90.0);
    }

    #[test]
    fn test_rejects_inconsistent_bar() {
        let mut engine = IndicatorEngine::new(config());
        let err = engine.update(&bar(0, 100.0, 99.0, 98.0, 99.5)).unwrap_err();
        assert!(matches!(err, DataQualityError::InconsistentOhlc { .. }));
        assert_eq!(engine.bars_seen("TEST"), 0);
    }

    #[test]
    fn test_rejects_out_of_order_bar() {
        let mut engine = IndicatorEngine::new(config());
        engine.update(&bar(5, 100.0, 101.0, 99.0, 100.0)).unwrap();
        let err = engine.update(&bar(5, 100.0, 101.0, 99.0, 100.0)).unwrap_err();
        assert!(matches!(err, DataQualityError::OutOfOrder { .. }));
        let err = engine.update(&bar(4, 100.0, 101.0, 99.0, 100.0)).unwrap_err();
        assert!(matches!(err, DataQualityError::OutOfOrder { .. }));
        assert_eq!(engine.bars_seen("TEST"), 1);
    }

    #[test]
    fn test_gap_restarts_warm_up() {
        let mut engine = IndicatorEngine::new(config());
        for i in 0..6 {
            engine.update(&bar(i, 100.0, 101.0, 99.0, 100.0)).unwrap();
        }
        let mut gapped = bar(20, 100.0, 101.0, 99.0, 100.0);
        gapped.gap = true;
        assert!(engine.update(&gapped).unwrap().is_none());
        assert_eq!(engine.bars_seen("TEST"), 1);
    }
}
