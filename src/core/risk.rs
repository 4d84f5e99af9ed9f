// Account-level risk control shared by every symbol pipeline

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::RiskConfig;
use crate::error::{TradingError, TradingResult};

/// The single source of truth for whether more capital may be committed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub initial_balance: f64,
    pub current_balance: f64,
    pub peak_balance: f64,
    pub daily_realized_pnl: f64,
    pub trading_day: NaiveDate,
    pub active_sessions: usize,
    pub halted: bool,
    pub halt_reason: Option<String>,
    pub fills_recorded: u64,
}

impl RiskState {
    pub fn new(initial_balance: f64, trading_day: NaiveDate) -> Self {
        Self {
            initial_balance,
            current_balance: initial_balance,
            peak_balance: initial_balance,
            daily_realized_pnl: 0.0,
            trading_day,
            active_sessions: 0,
            halted: false,
            halt_reason: None,
            fills_recorded: 0,
        }
    }

    /// Fractional decline from the peak balance
    pub fn drawdown(&self) -> f64 {
        if self.peak_balance <= 0.0 {
            return 0.0;
        }
        (self.peak_balance - self.current_balance) / self.peak_balance
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DenyReason {
    Halted { reason: String },
    PositionLimit { proposed: f64, limit: f64 },
    DrawdownBreached { drawdown: f64, limit: f64 },
    DailyLossLimit { loss: f64, limit: f64 },
    TooManySessions { active: usize, limit: usize },
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::Halted { reason } => write!(f, "trading halted ({})", reason),
            DenyReason::PositionLimit { proposed, limit } => {
                write!(f, "proposed capital {:.4} exceeds per-session limit {:.4}", proposed, limit)
            }
            DenyReason::DrawdownBreached { drawdown, limit } => write!(
                f,
                "drawdown {:.2}% reached limit {:.2}%",
                drawdown * 100.0,
                limit * 100.0
            ),
            DenyReason::DailyLossLimit { loss, limit } => {
                write!(f, "daily loss {:.2} reached limit {:.2}", loss, limit)
            }
            DenyReason::TooManySessions { active, limit } => {
                write!(f, "{} active sessions, limit is {}", active, limit)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Authorization {
    Approved,
    Denied(DenyReason),
}

impl Authorization {
    pub fn is_approved(&self) -> bool {
        matches!(self, Authorization::Approved)
    }

    pub fn into_result(self) -> TradingResult<()> {
        match self {
            Authorization::Approved => Ok(()),
            Authorization::Denied(reason) => Err(TradingError::RiskViolation(reason)),
        }
    }
}

/// Serializes every read and mutation of `RiskState` behind one lock
#[derive(Debug)]
pub struct RiskController {
    config: RiskConfig,
    state: Mutex<RiskState>,
}

impl RiskController {
    pub fn new(config: RiskConfig, initial_balance: f64) -> Self {
        let day = trading_day(Utc::now(), config.day_boundary_hour_utc);
        Self::restore(config, RiskState::new(initial_balance, day))
    }

    /// Resume from a persisted snapshot. A persisted halt stays in force.
    pub fn restore(config: RiskConfig, state: RiskState) -> Self {
        if state.halted {
            warn!(
                "🛑 Restored risk state is halted: {}",
                state.halt_reason.as_deref().unwrap_or("unknown reason")
            );
        }
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    // The guarded state is plain data, so a panic elsewhere cannot leave it torn
    fn lock(&self) -> MutexGuard<'_, RiskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn authorize(&self, proposed_capital: f64) -> Authorization {
        self.authorize_at(proposed_capital, Utc::now())
    }

    /// Run the ordered checks for committing `proposed_capital`, stopping at
    /// the first failure. A drawdown breach also sets the sticky halt flag.
    pub fn authorize_at(&self, proposed_capital: f64, now: DateTime<Utc>) -> Authorization {
        let mut state = self.lock();
        self.check_locked(&mut state, proposed_capital, now)
    }

    /// Authorize a new session and count it as active in the same critical section
    pub fn open_session(&self, proposed_capital: f64, now: DateTime<Utc>) -> Authorization {
        let mut state = self.lock();
        let decision = self.check_locked(&mut state, proposed_capital, now);
        if !decision.is_approved() {
            return decision;
        }
        if state.active_sessions >= self.config.max_active_sessions {
            let reason = DenyReason::TooManySessions {
                active: state.active_sessions,
                limit: self.config.max_active_sessions,
            };
            warn!("🚫 New session denied: {}", reason);
            return Authorization::Denied(reason);
        }
        state.active_sessions += 1;
        decision
    }

    /// Align the session count with what recovery actually resumed
    pub fn restore_active_sessions(&self, count: usize) {
        self.lock().active_sessions = count;
    }

    pub fn close_session(&self) {
        let mut state = self.lock();
        state.active_sessions = state.active_sessions.saturating_sub(1);
    }

    pub fn record_fill(&self, realized_pnl: f64) {
        self.record_fill_at(realized_pnl, Utc::now())
    }

    /// Apply one fill's realized P&L. Balances are updated before the lock is
    /// released, so the next reader always sees them.
    pub fn record_fill_at(&self, realized_pnl: f64, now: DateTime<Utc>) {
        let mut state = self.lock();
        self.roll_day(&mut state, now);
        state.current_balance += realized_pnl;
        state.daily_realized_pnl += realized_pnl;
        state.peak_balance = state.peak_balance.max(state.current_balance);
        state.fills_recorded += 1;
    }

    /// Capital a new session may commit right now
    pub fn session_budget(&self) -> f64 {
        let state = self.lock();
        state.current_balance * self.config.max_position_fraction
    }

    pub fn is_halted(&self) -> bool {
        self.lock().halted
    }

    pub fn halt(&self, reason: &str) {
        let mut state = self.lock();
        Self::halt_locked(&mut state, reason.to_string());
    }

    /// Manual reset of the halt flag. The peak is rebased to the current
    /// balance so drawdown is measured from the point of the reset.
    pub fn reset_halt(&self) {
        let mut state = self.lock();
        if state.halted {
            info!(
                "✅ Halt cleared manually (was: {})",
                state.halt_reason.as_deref().unwrap_or("unknown reason")
            );
        }
        state.halted = false;
        state.halt_reason = None;
        state.peak_balance = state.current_balance;
    }

    pub fn snapshot(&self) -> RiskState {
        self.lock().clone()
    }

    fn check_locked(&self, state: &mut RiskState, proposed: f64, now: DateTime<Utc>) -> Authorization {
        self.roll_day(state, now);

        if state.halted {
            return Authorization::Denied(DenyReason::Halted {
                reason: state.halt_reason.clone().unwrap_or_default(),
            });
        }

        let limit = state.current_balance * self.config.max_position_fraction;
        if proposed > limit {
            let reason = DenyReason::PositionLimit { proposed, limit };
            warn!("🚫 Authorization denied: {}", reason);
            return Authorization::Denied(reason);
        }

        let drawdown = state.drawdown();
        if drawdown >= self.config.max_drawdown {
            let reason = DenyReason::DrawdownBreached {
                drawdown,
                limit: self.config.max_drawdown,
            };
            Self::halt_locked(state, reason.to_string());
            return Authorization::Denied(reason);
        }

        let loss = -state.daily_realized_pnl;
        if loss >= self.config.max_daily_loss {
            let reason = DenyReason::DailyLossLimit {
                loss,
                limit: self.config.max_daily_loss,
            };
            warn!("🚫 Authorization denied until next trading day: {}", reason);
            return Authorization::Denied(reason);
        }

        Authorization::Approved
    }

    fn roll_day(&self, state: &mut RiskState, now: DateTime<Utc>) {
        let day = trading_day(now, self.config.day_boundary_hour_utc);
        if day > state.trading_day {
            info!(
                "📅 New trading day {} (previous day P&L {:.2})",
                day, state.daily_realized_pnl
            );
            state.trading_day = day;
            state.daily_realized_pnl = 0.0;
        }
    }

    fn halt_locked(state: &mut RiskState, reason: String) {
        if !state.halted {
            error!("🛑 GLOBAL HALT: {}", reason);
        }
        state.halted = true;
        state.halt_reason = Some(reason);
    }
}

/// The trading day a timestamp belongs to, given the configured boundary hour
pub fn trading_day(now: DateTime<Utc>, boundary_hour_utc: u32) -> NaiveDate {
    (now - Duration::hours(boundary_hour_utc as i64)).date_naive()
}
