// Grid planning: turns an entry signal plus live volatility into a concrete
// ladder of limit order levels

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::GridConfig;
use crate::core::types::{floor_to_decimals, round_to_decimals, Direction, Signal};
use crate::error::PlanningError;

/// An immutable grid layout. A new signal always yields a new plan.
///
/// `ladder` holds `level_count + 1` evenly spaced prices from `lower_bound` to
/// `upper_bound`. The middle entry is the entry price itself and carries no
/// order. Entries below it are buy levels; entries above it are take-profit
/// levels, each one step above its paired buy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridPlan {
    pub symbol: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub entry_price: f64,
    pub upper_bound: f64,
    pub lower_bound: f64,
    pub level_count: usize,
    pub spacing: f64,
    pub ladder: Vec<f64>,
    pub level_capital: f64,   // Quote currency per buy level
    pub quantities: Vec<f64>, // Base quantity per buy level
    pub capital_committed: f64,
}

impl GridPlan {
    pub fn center_index(&self) -> usize {
        self.level_count / 2
    }

    pub fn buy_levels(&self) -> &[f64] {
        &self.ladder[..self.center_index()]
    }

    pub fn sell_levels(&self) -> &[f64] {
        &self.ladder[self.center_index() + 1..]
    }

    /// Price of the take-profit paired with the buy at `level`
    pub fn take_profit_price(&self, level: usize) -> Option<f64> {
        self.ladder.get(level + 1).copied()
    }

    pub fn quantity_at(&self, level: usize) -> f64 {
        self.quantities.get(level).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone)]
pub struct GridPlanner {
    config: GridConfig,
}

impl GridPlanner {
    pub fn new(config: GridConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// Build a plan. Pure: identical inputs always give an identical plan.
    pub fn plan(
        &self,
        signal: &Signal,
        current_price: f64,
        atr: f64,
        risk_budget: f64,
    ) -> Result<GridPlan, PlanningError> {
        match signal.direction {
            Direction::Flat => return Err(PlanningError::SignalNotFired(signal.symbol.clone())),
            Direction::Short => return Err(PlanningError::UnsupportedDirection),
            Direction::Long => {}
        }

        if !(current_price.is_finite() && current_price > 0.0) {
            return Err(PlanningError::DegenerateGrid(format!(
                "current price {} is not positive",
                current_price
            )));
        }
        if !(atr.is_finite() && atr > 0.0) {
            return Err(PlanningError::DegenerateGrid(format!("ATR {} is not positive", atr)));
        }

        let levels = self.config.levels;
        let decimals = self.config.price_decimals;
        let tick = 10f64.powi(-(decimals as i32));

        let half_range = atr * self.config.range_multiplier;
        let lower = current_price - half_range;
        let upper = current_price + half_range;
        if lower <= 0.0 {
            return Err(PlanningError::DegenerateGrid(format!(
                "lower bound {:.8} is not positive",
                lower
            )));
        }

        let spacing = (upper - lower) / levels as f64;
        if spacing < tick {
            return Err(PlanningError::DegenerateGrid(format!(
                "spacing {:.10} is below the price tick {}",
                spacing, tick
            )));
        }

        let ladder: Vec<f64> = (0..=levels)
            .map(|i| round_to_decimals(lower + i as f64 * spacing, decimals))
            .collect();

        if ladder.windows(2).any(|w| w[1] <= w[0]) {
            return Err(PlanningError::DegenerateGrid(
                "levels collide after rounding to price precision".to_string(),
            ));
        }

        let center = levels / 2;
        if ladder[..center].iter().any(|&p| p >= current_price)
            || ladder[center + 1..].iter().any(|&p| p <= current_price)
        {
            return Err(PlanningError::DegenerateGrid(
                "rounded levels do not straddle the entry price".to_string(),
            ));
        }

        let buy_count = center;
        let level_capital = risk_budget / buy_count as f64;
        if !(level_capital.is_finite() && level_capital >= self.config.min_order_value) || level_capital <= 0.0 {
            return Err(PlanningError::InsufficientBudget {
                available: level_capital.max(0.0),
                required: self.config.min_order_value,
            });
        }

        let mut quantities = Vec::with_capacity(buy_count);
        for &price in &ladder[..center] {
            let quantity = floor_to_decimals(level_capital / price, self.config.quantity_decimals);
            if quantity <= 0.0 || quantity * price < self.config.min_order_value {
                return Err(PlanningError::InsufficientBudget {
                    available: quantity * price,
                    required: self.config.min_order_value,
                });
            }
            quantities.push(quantity);
        }
        // Floored notionals, so the sum only exceeds the budget by float error
        let capital_committed = ladder[..center]
            .iter()
            .zip(&quantities)
            .map(|(price, quantity)| price * quantity)
            .sum::<f64>()
            .min(risk_budget);

        let plan = GridPlan {
            symbol: signal.symbol.clone(),
            session_id: format!("{}-{}", signal.symbol, signal.timestamp.format("%Y%m%dT%H%M%S")),
            created_at: signal.timestamp,
            entry_price: current_price,
            upper_bound: ladder[levels],
            lower_bound: ladder[0],
            level_count: levels,
            spacing,
            ladder,
            level_capital,
            quantities,
            capital_committed,
        };

        info!(
            symbol = %plan.symbol,
            session = %plan.session_id,
            "🎯 Grid planned: {:.4} - {:.4}, {} levels, spacing {:.4}, {:.2} per buy level",
            plan.lower_bound, plan.upper_bound, plan.level_count, plan.spacing, plan.level_capital
        );

        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;
    use crate::core::risk::RiskController;
    use crate::core::types::SignalFactors;
    use chrono::TimeZone;

    fn long_signal() -> Signal {
        Signal {
            symbol: "SOLUSDT".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
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

    #[test]
    fn test_plan_shape() {
        let planner = GridPlanner::new(GridConfig::default());
        let plan = planner.plan(&long_signal(), 100.0, 1.0, 40.0).unwrap();

        assert_eq!(plan.ladder.len(), 9);
        assert_eq!(plan.lower_bound, 98.0);
        assert_eq!(plan.upper_bound, 102.0);
        assert_eq!(plan.buy_levels(), &[98.0, 98.5, 99.0, 99.5]);
        assert_eq!(plan.sell_levels(), &[100.5, 101.0, 101.5, 102.0]);
        assert_eq!(plan.level_capital, 10.0);
        assert_eq!(plan.take_profit_price(3), Some(100.0));
        assert_eq!(plan.session_id, "SOLUSDT-20240301T120000");
    }

    #[test]
    fn test_committed_capital_never_exceeds_budget() {
        let planner = GridPlanner::new(GridConfig {
            levels: 6,
            ..GridConfig::default()
        });
        // 1% of 1200.06 split over three buy levels
        let budget = 1200.06 * 0.01;
        let plan = planner.plan(&long_signal(), 100.0, 1.0, budget).unwrap();
        assert!(plan.capital_committed <= budget);

        let risk = RiskController::new(RiskConfig::default(), 1200.06);
        assert_eq!(risk.session_budget(), budget);
        assert!(risk.open_session(plan.capital_committed, Utc::now()).is_approved());
    }

    #[test]
    fn test_insufficient_budget() {
        let planner = GridPlanner::new(GridConfig::default());
        let err = planner.plan(&long_signal(), 100.0, 1.0, 2.0).unwrap_err();
        assert!(matches!(err, PlanningError::InsufficientBudget { .. }));
    }

    #[test]
    fn test_rejects_zero_spacing() {
        let planner = GridPlanner::new(GridConfig::default());
        let err = planner.plan(&long_signal(), 100.0, 0.001, 40.0).unwrap_err();
        assert!(matches!(err, PlanningError::DegenerateGrid(_)));
    }

    #[test]
    fn test_rejects_unfired_and_short_signals() {
        let planner = GridPlanner::new(GridConfig::default());

        let mut flat = long_signal();
        flat.direction = Direction::Flat;
        assert!(matches!(
            planner.plan(&flat, 100.0, 1.0, 40.0),
            Err(PlanningError::SignalNotFired(_))
        ));

        let mut short = long_signal();
        short.direction = Direction::Short;
        assert_eq!(
            planner.plan(&short, 100.0, 1.0, 40.0),
            Err(PlanningError::UnsupportedDirection)
        );
    }
}
