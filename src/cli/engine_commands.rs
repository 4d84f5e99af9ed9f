// Engine command implementations

use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::{info, warn};

use grid_trading_engine::core::gateway::ExchangeGateway;
use grid_trading_engine::{
    Bar, Database, EngineConfig, PaperExchange, RiskController, SessionStore, TradingEngine,
    TradingError, TradingResult,
};

pub fn init(config_path: &str, force: bool) -> TradingResult<()> {
    info!("🔧 Initializing configuration...");
    if force {
        EngineConfig::default().to_file(config_path)?;
        info!("✅ Wrote default config to {}", config_path);
    } else if Path::new(config_path).exists() {
        info!("⏭️  {} already exists (use --force to overwrite)", config_path);
    } else {
        EngineConfig::load_or_create(config_path)?;
    }
    info!("💡 Next: grid-engine paper");
    Ok(())
}

fn open_store(config: &EngineConfig) -> TradingResult<SessionStore> {
    let db = Database::new(&config.persistence.db_path)?;
    db.run_migrations()?;
    Ok(SessionStore::new(&db))
}

pub async fn paper(
    config: EngineConfig,
    bars_path: Option<&str>,
    steps: usize,
    seed: u64,
    no_db: bool,
) -> TradingResult<()> {
    let store = if no_db {
        None
    } else {
        Some(Arc::new(open_store(&config)?))
    };

    let risk = match store.as_ref().map(|s| s.load_latest_risk_state()).transpose()?.flatten() {
        Some(state) => {
            info!("💾 Restored risk state: balance {:.2}", state.current_balance);
            RiskController::restore(config.risk.clone(), state)
        }
        None => RiskController::new(config.risk.clone(), config.risk.initial_balance),
    };
    let risk = Arc::new(risk);

    let bars = match bars_path {
        Some(path) => load_bars(path)?,
        None => random_walk(&config.symbols, steps, seed),
    };
    info!("📊 {} bars queued across {} symbol(s)", bars.len(), config.symbols.len());

    let (exchange, events) = PaperExchange::new();
    let exchange = Arc::new(exchange);
    let gateway: Arc<dyn ExchangeGateway> = exchange.clone();

    let mut engine = TradingEngine::new(config, Arc::clone(&risk), gateway, store);
    let resumed = engine.recover().await?;
    if resumed > 0 {
        warn!("♻️  {} session(s) resumed; paper orders from a previous run are gone", resumed);
    }

    let (bar_tx, bar_rx) = mpsc::channel(64);
    let feed = tokio::spawn(async move {
        for bar in bars {
            // Sweep the book through the bar's path before it closes
            for price in [bar.open, bar.low, bar.high, bar.close] {
                exchange.on_price(&bar.symbol, price);
            }
            if bar_tx.send(bar).await.is_err() {
                break;
            }
            tokio::task::yield_now().await;
        }
    });

    let report = engine.run(bar_rx, events).await?;
    feed.await
        .map_err(|e| TradingError::Internal(format!("feed task failed: {}", e)))?;

    info!("📊 Paper run summary:");
    for pipeline in &report.pipelines {
        info!(
            "   {} | bars {} (rejected {}) | signals {} | sessions {}",
            pipeline.symbol,
            pipeline.bars_processed,
            pipeline.bars_rejected,
            pipeline.signals_fired,
            pipeline.sessions.len()
        );
        for session in pipeline.sessions.iter().chain(pipeline.open_session.iter()) {
            info!(
                "      {} {} | {} | P&L {:.4} | round trips {}",
                session.id,
                session.state,
                session
                    .exit_reason
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "-".to_string()),
                session.realized_pnl,
                session.round_trips
            );
        }
    }
    info!("   💰 Balance: {:.2} (peak {:.2})", report.risk.current_balance, report.risk.peak_balance);
    info!("   📈 Realized P&L: {:.4}", report.total_realized_pnl());
    if report.risk.halted {
        warn!(
            "   🛑 HALTED: {}",
            report.risk.halt_reason.as_deref().unwrap_or("unknown reason")
        );
    }
    Ok(())
}

fn load_bars(path: &str) -> TradingResult<Vec<Bar>> {
    let content = fs::read_to_string(path)?;
    let mut bars: Vec<Bar> = serde_json::from_str(&content)
        .map_err(|e| TradingError::Io(format!("{}: {}", path, e)))?;
    bars.sort_by_key(|b| b.open_time);
    Ok(bars)
}

/// One-minute bars for every symbol, interleaved by time
fn random_walk(symbols: &[String], steps: usize, seed: u64) -> Vec<Bar> {
    let mut rng = StdRng::seed_from_u64(seed);
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_else(Utc::now);
    let mut prices: Vec<f64> = (0..symbols.len()).map(|i| 100.0 * (i + 1) as f64).collect();
    let mut bars = Vec::with_capacity(steps * symbols.len());

    for step in 0..steps {
        let open_time = start + ChronoDuration::minutes(step as i64);
        // Calm and busy stretches alternate so the filters have something to find
        let busy = (step / 60) % 3 == 2;
        let vol = if busy { 0.006 } else { 0.002 };

        for (i, symbol) in symbols.iter().enumerate() {
            let open = prices[i];
            let close = (open * (1.0 + rng.gen_range(-vol..vol))).max(0.01);
            let high = open.max(close) * (1.0 + rng.gen_range(0.0..vol / 2.0));
            let low = open.min(close) * (1.0 - rng.gen_range(0.0..vol / 2.0));
            let base_volume: f64 = rng.gen_range(80.0..120.0);
            let volume = if busy { base_volume * 2.0 } else { base_volume };

            bars.push(Bar {
                symbol: symbol.clone(),
                open_time,
                open,
                high,
                low,
                close,
                volume,
                gap: false,
            });
            prices[i] = close;
        }
    }
    bars
}

pub fn status(config: &EngineConfig, limit: usize) -> TradingResult<()> {
    let store = open_store(config)?;

    match store.load_latest_risk_state()? {
        Some(state) => {
            info!("💰 Balance: {:.2} (initial {:.2}, peak {:.2})", state.current_balance, state.initial_balance, state.peak_balance);
            info!("📅 Day {}: realized {:.2}", state.trading_day, state.daily_realized_pnl);
            info!("🔢 Active sessions: {}", state.active_sessions);
            if state.halted {
                warn!("🛑 HALTED: {}", state.halt_reason.as_deref().unwrap_or("unknown reason"));
                warn!("💡 Run: grid-engine reset-halt");
            } else {
                info!("✅ Not halted");
            }
        }
        None => info!("ℹ️  No risk state recorded yet"),
    }

    let live = store.load_active_sessions()?;
    info!("📂 {} live session(s)", live.len());
    for session in &live {
        info!(
            "   {} {} | {} working orders | held {:.6} | P&L {:.4}",
            session.id,
            session.state,
            session.working_orders().count(),
            session.held_quantity(),
            session.realized_pnl
        );
    }

    let recent = store.list_sessions(limit)?;
    if !recent.is_empty() {
        info!("🕘 Recent sessions:");
        for record in recent {
            info!(
                "   {} {} | {} | P&L {:.4}",
                record.id,
                record.state,
                record.exit_reason.unwrap_or_else(|| "-".to_string()),
                record.realized_pnl
            );
        }
    }
    Ok(())
}

pub fn reset_halt(config: &EngineConfig) -> TradingResult<()> {
    let store = open_store(config)?;
    let Some(state) = store.load_latest_risk_state()? else {
        info!("ℹ️  No risk state recorded, nothing to reset");
        return Ok(());
    };
    if !state.halted {
        info!("✅ Not halted, nothing to reset");
        return Ok(());
    }

    let risk = RiskController::restore(config.risk.clone(), state);
    risk.reset_halt();
    store.save_risk_snapshot(&risk.snapshot(), Utc::now())?;
    info!("✅ Halt cleared; new sessions may open on the next run");
    Ok(())
}
