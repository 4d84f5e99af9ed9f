// Configuration management for the grid trading engine

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorConfig {
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
    #[serde(default = "default_adx_period")]
    pub adx_period: usize,
    #[serde(default = "default_ema_fast")]
    pub ema_fast: usize,
    #[serde(default = "default_ema_slow")]
    pub ema_slow: usize,
    #[serde(default = "default_window_size")]
    pub window_size: usize, // Bars retained per symbol
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    #[serde(default = "default_volatility_multiplier")]
    pub volatility_multiplier: f64, // ATR must exceed its rolling mean by this factor
    #[serde(default = "default_volume_multiplier")]
    pub volume_multiplier: f64,
    #[serde(default = "default_min_range_atr_ratio")]
    pub min_range_atr_ratio: f64, // Recent high-low range as a multiple of ATR
    #[serde(default = "default_regime_threshold")]
    pub regime_threshold: f64,
    #[serde(default = "default_lookback")]
    pub lookback: usize, // Snapshots used for rolling averages
    #[serde(default)]
    pub allow_short: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    #[serde(default = "default_range_multiplier")]
    pub range_multiplier: f64,
    #[serde(default = "default_levels")]
    pub levels: usize,
    #[serde(default = "default_price_decimals")]
    pub price_decimals: u32,
    #[serde(default = "default_quantity_decimals")]
    pub quantity_decimals: u32,
    #[serde(default = "default_min_order_value")]
    pub min_order_value: f64, // Exchange minimum notional per order
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_stop_margin")]
    pub stop_margin: f64,
    #[serde(default = "default_take_profit_fraction")]
    pub take_profit_fraction: f64, // Of committed capital
    #[serde(default = "default_max_duration_hours")]
    pub max_duration_hours: f64,
    #[serde(default = "default_true")]
    pub refill_enabled: bool,
    #[serde(default)]
    pub regime_gate_refills: bool,
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64, // Used only when no persisted risk state exists
    #[serde(default = "default_max_position_fraction")]
    pub max_position_fraction: f64,
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown: f64,
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,
    #[serde(default)]
    pub day_boundary_hour_utc: u32,
    #[serde(default = "default_max_active_sessions")]
    pub max_active_sessions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_order_timeout_ms")]
    pub order_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub log_rejected_bars: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub symbols: Vec<String>,
    #[serde(default)]
    pub indicators: IndicatorConfig,
    #[serde(default)]
    pub signal: SignalConfig,
    #[serde(default)]
    pub grid: GridConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// Default value functions
fn default_atr_period() -> usize { 14 }
fn default_adx_period() -> usize { 14 }
fn default_ema_fast() -> usize { 10 }
fn default_ema_slow() -> usize { 20 }
fn default_window_size() -> usize { 50 }
fn default_volatility_multiplier() -> f64 { 1.0 }
fn default_volume_multiplier() -> f64 { 1.2 }
fn default_min_range_atr_ratio() -> f64 { 1.0 }
fn default_regime_threshold() -> f64 { 20.0 }
fn default_lookback() -> usize { 20 }
fn default_range_multiplier() -> f64 { 2.0 }
fn default_levels() -> usize { 8 }
fn default_price_decimals() -> u32 { 2 }
fn default_quantity_decimals() -> u32 { 6 }
fn default_min_order_value() -> f64 { 1.0 }
fn default_stop_margin() -> f64 { 0.02 }
fn default_take_profit_fraction() -> f64 { 0.05 }
fn default_max_duration_hours() -> f64 { 24.0 }
fn default_fee_rate() -> f64 { 0.001 }
fn default_initial_balance() -> f64 { 1000.0 }
fn default_max_position_fraction() -> f64 { 0.01 }
fn default_max_drawdown() -> f64 { 0.25 }
fn default_max_daily_loss() -> f64 { 50.0 }
fn default_max_active_sessions() -> usize { 5 }
fn default_order_timeout_ms() -> u64 { 5_000 }
fn default_max_attempts() -> u32 { 4 }
fn default_base_delay_ms() -> u64 { 250 }
fn default_max_delay_ms() -> u64 { 5_000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_db_path() -> String { "data/grid_engine.db".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            atr_period: default_atr_period(),
            adx_period: default_adx_period(),
            ema_fast: default_ema_fast(),
            ema_slow: default_ema_slow(),
            window_size: default_window_size(),
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            volatility_multiplier: default_volatility_multiplier(),
            volume_multiplier: default_volume_multiplier(),
            min_range_atr_ratio: default_min_range_atr_ratio(),
            regime_threshold: default_regime_threshold(),
            lookback: default_lookback(),
            allow_short: false,
        }
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            range_multiplier: default_range_multiplier(),
            levels: default_levels(),
            price_decimals: default_price_decimals(),
            quantity_decimals: default_quantity_decimals(),
            min_order_value: default_min_order_value(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stop_margin: default_stop_margin(),
            take_profit_fraction: default_take_profit_fraction(),
            max_duration_hours: default_max_duration_hours(),
            refill_enabled: true,
            regime_gate_refills: false,
            fee_rate: default_fee_rate(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            initial_balance: default_initial_balance(),
            max_position_fraction: default_max_position_fraction(),
            max_drawdown: default_max_drawdown(),
            max_daily_loss: default_max_daily_loss(),
            day_boundary_hour_utc: 0,
            max_active_sessions: default_max_active_sessions(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            order_timeout_ms: default_order_timeout_ms(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { db_path: default_db_path() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_rejected_bars: true,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["SOLUSDT".to_string(), "LINKUSDT".to_string()],
            indicators: IndicatorConfig::default(),
            signal: SignalConfig::default(),
            grid: GridConfig::default(),
            session: SessionConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            persistence: PersistenceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn max_duration(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.max_duration_hours * 3_600_000.0) as i64)
    }
}

impl ExecutionConfig {
    pub fn order_timeout(&self) -> Duration {
        Duration::from_millis(self.order_timeout_ms)
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(e.to_string()))?;

        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| ConfigError::FileWrite(e.to_string()))?;
            }
        }

        fs::write(path, content)
            .map_err(|e| ConfigError::FileWrite(e.to_string()))?;

        Ok(())
    }

    /// Load configuration from file, or create default if file doesn't exist
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            let config = Self::default();
            config.to_file(&path)?;
            info!("📁 Created default config file: {}", path.as_ref().display());
            Ok(config)
        }
    }

    /// Validate configuration values. Out-of-range values are rejected, never clamped.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return invalid("at least one symbol must be configured");
        }
        let mut seen = HashSet::new();
        for symbol in &self.symbols {
            if symbol.trim().is_empty() {
                return invalid("symbols must not be empty strings");
            }
            if !seen.insert(symbol.as_str()) {
                return invalid(&format!("symbol {} is listed twice", symbol));
            }
        }

        let ind = &self.indicators;
        if ind.atr_period == 0 || ind.adx_period == 0 || ind.ema_fast == 0 || ind.ema_slow == 0 {
            return invalid("indicator periods must be greater than 0");
        }
        if ind.ema_fast >= ind.ema_slow {
            return invalid("indicators.ema_fast must be shorter than indicators.ema_slow");
        }
        let needed = (ind.atr_period + 1).max(2 * ind.adx_period).max(ind.ema_slow);
        if ind.window_size < needed {
            return invalid(&format!(
                "indicators.window_size must be at least {} for the configured periods",
                needed
            ));
        }

        let sig = &self.signal;
        if !positive(sig.volatility_multiplier) || !positive(sig.volume_multiplier) {
            return invalid("signal multipliers must be positive");
        }
        if !non_negative(sig.min_range_atr_ratio) {
            return invalid("signal.min_range_atr_ratio must be non-negative");
        }
        if !(sig.regime_threshold > 0.0 && sig.regime_threshold <= 100.0) {
            return invalid("signal.regime_threshold must be in (0, 100]");
        }
        if sig.lookback < 2 {
            return invalid("signal.lookback must be at least 2");
        }

        let grid = &self.grid;
        if grid.levels < 2 || grid.levels % 2 != 0 {
            return invalid("grid.levels must be an even number of at least 2");
        }
        if !positive(grid.range_multiplier) {
            return invalid("grid.range_multiplier must be positive");
        }
        if grid.price_decimals > 12 || grid.quantity_decimals > 12 {
            return invalid("grid precision must be at most 12 decimals");
        }
        if !non_negative(grid.min_order_value) {
            return invalid("grid.min_order_value must be non-negative");
        }

        let session = &self.session;
        if !(0.0..1.0).contains(&session.stop_margin) {
            return invalid("session.stop_margin must be in [0, 1)");
        }
        if !(0.0..1.0).contains(&session.fee_rate) {
            return invalid("session.fee_rate must be in [0, 1)");
        }
        if !positive(session.take_profit_fraction) {
            return invalid("session.take_profit_fraction must be positive");
        }
        if !positive(session.max_duration_hours) {
            return invalid("session.max_duration_hours must be positive");
        }

        let risk = &self.risk;
        if !positive(risk.initial_balance) {
            return invalid("risk.initial_balance must be positive");
        }
        if !(risk.max_position_fraction > 0.0 && risk.max_position_fraction <= 1.0) {
            return invalid("risk.max_position_fraction must be in (0, 1]");
        }
        if !(risk.max_drawdown > 0.0 && risk.max_drawdown <= 1.0) {
            return invalid("risk.max_drawdown must be in (0, 1]");
        }
        if !positive(risk.max_daily_loss) {
            return invalid("risk.max_daily_loss must be positive");
        }
        if risk.day_boundary_hour_utc > 23 {
            return invalid("risk.day_boundary_hour_utc must be in 0..=23");
        }
        if risk.max_active_sessions == 0 {
            return invalid("risk.max_active_sessions must be greater than 0");
        }

        let exec = &self.execution;
        if exec.max_attempts == 0 {
            return invalid("execution.max_attempts must be at least 1");
        }
        if exec.order_timeout_ms == 0 || exec.base_delay_ms == 0 {
            return invalid("execution timeouts and delays must be positive");
        }
        if exec.max_delay_ms < exec.base_delay_ms {
            return invalid("execution.max_delay_ms must not be below base_delay_ms");
        }
        if !(exec.backoff_multiplier.is_finite() && exec.backoff_multiplier >= 1.0) {
            return invalid("execution.backoff_multiplier must be at least 1.0");
        }

        if self.persistence.db_path.trim().is_empty() {
            return invalid("persistence.db_path must not be empty");
        }

        Ok(())
    }
}

// NaN and infinities fail both
fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn non_negative(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

fn invalid(msg: &str) -> Result<(), ConfigError> {
    Err(ConfigError::Validation(msg.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(String),

    #[error("Failed to write config file: {0}")]
    FileWrite(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config = EngineConfig::from_toml_str("symbols = [\"BTCUSDT\"]").unwrap();
        assert_eq!(config.grid.levels, 8);
        assert_eq!(config.signal.regime_threshold, 20.0);
        assert_eq!(config.risk.max_position_fraction, 0.01);
        assert_eq!(config.risk.max_drawdown, 0.25);
    }

    #[test]
    fn test_odd_levels_rejected() {
        let mut config = EngineConfig::default();
        config.grid.levels = 7;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_fraction_out_of_range_not_clamped() {
        let mut config = EngineConfig::default();
        config.risk.max_position_fraction = 1.5;
        assert!(config.validate().is_err());
        assert_eq!(config.risk.max_position_fraction, 1.5);

        config.risk.max_position_fraction = 1.0;
        assert!(config.validate().is_ok());
    }
}
