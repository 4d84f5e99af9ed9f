// Trading engine: one pipeline per symbol, sharing only the risk controller

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TryRecvError, Receiver, Sender, UnboundedReceiver};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::core::gateway::{ExchangeGateway, OrderEvent};
use crate::core::grid_planner::GridPlanner;
use crate::core::indicators::IndicatorEngine;
use crate::core::recovery::{reconcile, ReconcileReport};
use crate::core::retry::RetryPolicy;
use crate::core::risk::{DenyReason, RiskController, RiskState};
use crate::core::session::{GridSession, SessionContext, SessionSummary};
use crate::core::signal::SignalEvaluator;
use crate::core::types::{Bar, MarketSnapshot};
use crate::db::SessionStore;
use crate::error::{TradingError, TradingResult};

const PIPELINE_QUEUE: usize = 256;

/// Input for one symbol's pipeline, kept in arrival order
#[derive(Debug, Clone)]
pub enum PipelineInput {
    Bar(Bar),
    Event(OrderEvent),
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub symbol: String,
    pub bars_processed: u64,
    pub bars_rejected: u64,
    pub signals_fired: u64,
    pub sessions: Vec<SessionSummary>,
    pub open_session: Option<SessionSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineReport {
    pub pipelines: Vec<PipelineReport>,
    pub risk: RiskState,
}

impl EngineReport {
    pub fn total_realized_pnl(&self) -> f64 {
        self.pipelines
            .iter()
            .flat_map(|p| p.sessions.iter().chain(p.open_session.iter()))
            .map(|s| s.realized_pnl)
            .sum()
    }
}

/// Handles shared by every pipeline
#[derive(Clone)]
struct Shared {
    config: Arc<EngineConfig>,
    risk: Arc<RiskController>,
    gateway: Arc<dyn ExchangeGateway>,
    store: Option<Arc<SessionStore>>,
    retry: RetryPolicy,
}

impl Shared {
    fn context(&self) -> SessionContext<'_> {
        SessionContext {
            gateway: self.gateway.as_ref(),
            risk: self.risk.as_ref(),
            store: self.store.as_deref(),
            config: &self.config.session,
            retry: &self.retry,
            order_timeout: self.config.execution.order_timeout(),
        }
    }
}

/// Indicator → signal → planner → session for one symbol
pub struct SymbolPipeline {
    symbol: String,
    shared: Shared,
    indicators: IndicatorEngine,
    evaluator: SignalEvaluator,
    planner: GridPlanner,
    recent: VecDeque<MarketSnapshot>,
    session: Option<GridSession>,
    clock: Option<DateTime<Utc>>,
    finished: Vec<SessionSummary>,
    bars_processed: u64,
    bars_rejected: u64,
    signals_fired: u64,
}

impl SymbolPipeline {
    pub fn new(
        symbol: &str,
        config: Arc<EngineConfig>,
        risk: Arc<RiskController>,
        gateway: Arc<dyn ExchangeGateway>,
        store: Option<Arc<SessionStore>>,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config.execution);
        Self {
            symbol: symbol.to_string(),
            indicators: IndicatorEngine::new(config.indicators.clone()),
            evaluator: SignalEvaluator::new(config.signal.clone()),
            planner: GridPlanner::new(config.grid.clone()),
            recent: VecDeque::with_capacity(config.signal.lookback + 1),
            session: None,
            clock: None,
            finished: Vec::new(),
            bars_processed: 0,
            bars_rejected: 0,
            signals_fired: 0,
            shared: Shared {
                config,
                risk,
                gateway,
                store,
                retry,
            },
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// The live session, if any
    pub fn session(&self) -> Option<&GridSession> {
        self.session.as_ref()
    }

    pub fn finished(&self) -> &[SessionSummary] {
        &self.finished
    }

    /// Take over a persisted session after a restart, reconciling it first
    pub async fn resume(&mut self, mut session: GridSession) -> TradingResult<ReconcileReport> {
        let now = session
            .history
            .last()
            .map(|t| t.at)
            .unwrap_or(session.opened_at);
        self.clock = Some(now);
        let report = {
            let ctx = self.shared.context();
            reconcile(&mut session, &ctx, now).await?
        };
        self.session = Some(session);
        self.archive_if_done();
        Ok(report)
    }

    pub async fn on_bar(&mut self, bar: &Bar) -> TradingResult<()> {
        self.clock = Some(bar.open_time);

        let snapshot = match self.indicators.update(bar) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                // Warming up; exits still track price
                if let Some(session) = self.session.as_mut() {
                    let ctx = self.shared.context();
                    session.on_price(bar.close, &ctx, bar.open_time).await?;
                }
                self.archive_if_done();
                return Ok(());
            }
            Err(err) => {
                self.bars_rejected += 1;
                if self.shared.config.logging.log_rejected_bars {
                    warn!(symbol = %self.symbol, category = "data_quality", "🚫 Bar rejected: {}", err);
                }
                return Ok(());
            }
        };
        self.bars_processed += 1;

        if let Some(session) = self.session.as_mut() {
            let ctx = self.shared.context();
            let threshold = self.shared.config.signal.regime_threshold;
            session.on_snapshot(&snapshot, threshold, &ctx).await?;
        }
        self.archive_if_done();

        let session_active = self.session.is_some();
        let signal = self
            .evaluator
            .evaluate(&snapshot, self.recent.make_contiguous(), session_active);

        self.recent.push_back(snapshot.clone());
        while self.recent.len() > self.shared.config.signal.lookback {
            self.recent.pop_front();
        }

        if !signal.fired() {
            return Ok(());
        }
        self.signals_fired += 1;
        if let Some(store) = &self.shared.store {
            if let Err(err) = store.record_signal(&signal, &snapshot) {
                warn!(symbol = %self.symbol, "⚠️  Failed to audit signal: {}", err);
            }
        }

        let budget = self.shared.risk.session_budget();
        let plan = match self.planner.plan(&signal, snapshot.close, snapshot.atr, budget) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(symbol = %self.symbol, category = "planning", "🚫 Signal dropped: {}", err);
                return Ok(());
            }
        };

        let mut session = match GridSession::arm(plan, &self.shared.risk, snapshot.timestamp) {
            Ok(session) => session,
            Err(TradingError::RiskViolation(reason @ DenyReason::DrawdownBreached { .. })) => {
                error!(symbol = %self.symbol, category = "risk", "🛑 Global halt tripped: {}", reason);
                // The halt must outlive a crash before the next snapshot
                if let Some(store) = &self.shared.store {
                    store.save_risk_snapshot(&self.shared.risk.snapshot(), snapshot.timestamp)?;
                }
                return Ok(());
            }
            Err(TradingError::RiskViolation(reason)) => {
                info!(symbol = %self.symbol, category = "risk", "🚫 Entry not authorized: {}", reason);
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let deployed = {
            let ctx = self.shared.context();
            session.deploy(&ctx, snapshot.timestamp).await
        };
        self.session = Some(session);
        self.archive_if_done();
        deployed
    }

    pub async fn on_order_event(&mut self, event: &OrderEvent) -> TradingResult<()> {
        let now = self.clock.unwrap_or_else(Utc::now);
        if let Some(session) = self.session.as_mut() {
            let ctx = self.shared.context();
            session.handle_event(event, &ctx, now).await?;
        } else {
            debug!(symbol = %self.symbol, "No live session for order {}", event.order_id);
        }
        self.archive_if_done();
        Ok(())
    }

    fn archive_if_done(&mut self) {
        if self.session.as_ref().map(|s| s.state.is_terminal()).unwrap_or(false) {
            if let Some(session) = self.session.take() {
                self.finished.push(session.summary());
            }
        }
    }

    pub fn report(&self) -> PipelineReport {
        PipelineReport {
            symbol: self.symbol.clone(),
            bars_processed: self.bars_processed,
            bars_rejected: self.bars_rejected,
            signals_fired: self.signals_fired,
            sessions: self.finished.clone(),
            open_session: self.session.as_ref().map(GridSession::summary),
        }
    }

    async fn run(mut self, mut inputs: Receiver<PipelineInput>) -> PipelineReport {
        while let Some(input) = inputs.recv().await {
            let result = match &input {
                PipelineInput::Bar(bar) => self.on_bar(bar).await,
                PipelineInput::Event(event) => self.on_order_event(event).await,
            };
            if let Err(err) = result {
                error!(
                    symbol = %self.symbol,
                    category = err.category(),
                    "❌ Pipeline error: {}", err
                );
            }
        }
        self.report()
    }
}

pub struct TradingEngine {
    config: Arc<EngineConfig>,
    risk: Arc<RiskController>,
    store: Option<Arc<SessionStore>>,
    pipelines: BTreeMap<String, SymbolPipeline>,
}

impl TradingEngine {
    pub fn new(
        config: EngineConfig,
        risk: Arc<RiskController>,
        gateway: Arc<dyn ExchangeGateway>,
        store: Option<Arc<SessionStore>>,
    ) -> Self {
        let config = Arc::new(config);
        let pipelines = config
            .symbols
            .iter()
            .map(|symbol| {
                let pipeline = SymbolPipeline::new(
                    symbol,
                    Arc::clone(&config),
                    Arc::clone(&risk),
                    Arc::clone(&gateway),
                    store.clone(),
                );
                (symbol.clone(), pipeline)
            })
            .collect();

        Self {
            config,
            risk,
            store,
            pipelines,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn risk(&self) -> &Arc<RiskController> {
        &self.risk
    }

    pub fn pipeline(&self, symbol: &str) -> Option<&SymbolPipeline> {
        self.pipelines.get(symbol)
    }

    pub fn pipeline_mut(&mut self, symbol: &str) -> Option<&mut SymbolPipeline> {
        self.pipelines.get_mut(symbol)
    }

    /// Resume every non-terminal persisted session. Returns how many are
    /// still live afterwards.
    pub async fn recover(&mut self) -> TradingResult<usize> {
        let Some(store) = self.store.clone() else {
            return Ok(0);
        };
        let sessions = store.load_active_sessions()?;
        if sessions.is_empty() {
            return Ok(0);
        }
        info!("♻️  Recovering {} persisted session(s)", sessions.len());

        let (known, unknown): (Vec<_>, Vec<_>) = sessions
            .into_iter()
            .partition(|s| self.pipelines.contains_key(&s.symbol));
        for session in &unknown {
            warn!(
                symbol = %session.symbol,
                session = %session.id,
                "⚠️  Persisted session's symbol is not configured, leaving it untouched"
            );
        }

        self.risk.restore_active_sessions(known.len());
        let mut live = 0;
        for session in known {
            let symbol = session.symbol.clone();
            if let Some(pipeline) = self.pipelines.get_mut(&symbol) {
                if pipeline.session().is_some() {
                    warn!(symbol = %symbol, session = %session.id, "⚠️  Second live session for symbol, skipping");
                    continue;
                }
                pipeline.resume(session).await?;
                if pipeline.session().is_some() {
                    live += 1;
                }
            }
        }
        self.risk.restore_active_sessions(live);
        Ok(live)
    }

    /// Drive every pipeline until the bar feed ends.
    ///
    /// Order events are routed ahead of bars so a pipeline always sees the
    /// fills a price move produced before the bar that reports the move.
    pub async fn run(
        self,
        mut bars: Receiver<Bar>,
        mut events: UnboundedReceiver<OrderEvent>,
    ) -> TradingResult<EngineReport> {
        info!(
            "🚀 Engine running for {} symbol(s): {}",
            self.pipelines.len(),
            self.config.symbols.join(", ")
        );

        let mut senders: HashMap<String, Sender<PipelineInput>> = HashMap::new();
        let mut handles = Vec::with_capacity(self.pipelines.len());
        for (symbol, pipeline) in self.pipelines {
            let (tx, rx) = mpsc::channel(PIPELINE_QUEUE);
            senders.insert(symbol, tx);
            handles.push(tokio::spawn(pipeline.run(rx)));
        }

        loop {
            tokio::select! {
                biased;
                Some(event) = events.recv() => {
                    route(&senders, &event.symbol.clone(), PipelineInput::Event(event)).await;
                }
                bar = bars.recv() => match bar {
                    Some(bar) => {
                        drain_events(&senders, &mut events).await;
                        route(&senders, &bar.symbol.clone(), PipelineInput::Bar(bar)).await;
                    }
                    None => break,
                },
            }
        }

        drain_events(&senders, &mut events).await;
        drop(senders);

        let mut pipelines = Vec::with_capacity(handles.len());
        for joined in join_all(handles).await {
            match joined {
                Ok(report) => pipelines.push(report),
                Err(err) => return Err(TradingError::Internal(format!("pipeline task failed: {}", err))),
            }
        }

        let risk = self.risk.snapshot();
        if let Some(store) = &self.store {
            store.save_risk_snapshot(&risk, Utc::now())?;
        }
        info!(
            "🏁 Feed finished: balance {:.2} (peak {:.2}), halted: {}",
            risk.current_balance, risk.peak_balance, risk.halted
        );

        Ok(EngineReport { pipelines, risk })
    }
}

async fn drain_events(senders: &HashMap<String, Sender<PipelineInput>>, events: &mut UnboundedReceiver<OrderEvent>) {
    loop {
        match events.try_recv() {
            Ok(event) => {
                let symbol = event.symbol.clone();
                route(senders, &symbol, PipelineInput::Event(event)).await;
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
    }
}

async fn route(senders: &HashMap<String, Sender<PipelineInput>>, symbol: &str, input: PipelineInput) {
    match senders.get(symbol) {
        Some(tx) => {
            if tx.send(input).await.is_err() {
                warn!(symbol = %symbol, "⚠️  Pipeline stopped, input dropped");
            }
        }
        None => debug!(symbol = %symbol, "Input for unconfigured symbol dropped"),
    }
}
