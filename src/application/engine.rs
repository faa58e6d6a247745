//! Live trading session
//!
//! `TradingEngine` owns at most one session. A session is a `Run`, the
//! decision pipeline serving it and the tick loop driving both. Ticks never
//! overlap: the session mutex is held for the whole tick and the loop only
//! schedules the next tick after the previous one returned. Start and stop are
//! serialized by the lifecycle mutex, so a start issued while a stop is in
//! flight waits for the old Run to be sealed.

use crate::application::backtester::{BacktestReport, Backtester};
use crate::application::event_bus::{topics, EventBus, EventEnvelope};
use crate::config::TradingConfig;
use crate::domain::entities::account::Account;
use crate::domain::entities::candle::{validate_instrument, Timeframe};
use crate::domain::entities::position::{ExitReason, Position};
use crate::domain::entities::run::{Run, RunMode, RunStatus};
use crate::domain::entities::signal::{Direction, Signal};
use crate::domain::errors::{ConfigError, DataError, EngineError};
use crate::domain::repositories::broker::{Broker, BrokerKind};
use crate::domain::repositories::candle_source::CandleSource;
use crate::domain::services::features::FeatureCalculator;
use crate::domain::services::ledger::PaperLedger;
use crate::domain::services::news_filter::{NoBlock, TradingBlock};
use crate::domain::services::pipeline::{
    Decision, DecisionInput, DecisionPipeline, DecisionRecord, ForcedSignal,
};
use crate::domain::services::risk_manager::RiskManager;
use crate::domain::services::strategies::create_strategy;
use crate::persistence::repository::RunRepository;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Stopped,
    Running,
    Error,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Stopped => "stopped",
            EngineState::Running => "running",
            EngineState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageState {
    Idle,
    Ok,
    Blocked,
    Error,
}

/// Pipeline stages reported in the status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Data,
    Features,
    Risk,
    Order,
    Broker,
    Position,
    Pnl,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Data,
        Stage::Features,
        Stage::Risk,
        Stage::Order,
        Stage::Broker,
        Stage::Position,
        Stage::Pnl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Data => "data",
            Stage::Features => "features",
            Stage::Risk => "risk",
            Stage::Order => "order",
            Stage::Broker => "broker",
            Stage::Position => "position",
            Stage::Pnl => "pnl",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageStatus {
    pub state: StageState,
    pub reason: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl StageStatus {
    fn idle() -> Self {
        StageStatus {
            state: StageState::Idle,
            reason: None,
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub run: Option<Run>,
    pub stages: BTreeMap<Stage, StageStatus>,
    pub open_trades: usize,
    pub unrealized_pnl: f64,
    pub account: Option<Account>,
    pub last_signal: Option<Signal>,
    pub last_decision: Option<DecisionRecord>,
    /// Running with open positions or an actionable signal from the last tick.
    pub active: bool,
    pub idle_reason: Option<String>,
    pub last_error: Option<String>,
    pub ticks: u64,
}

impl EngineStatus {
    fn new(state: EngineState, run: Option<Run>) -> Self {
        EngineStatus {
            state,
            run,
            stages: Stage::ALL.iter().map(|s| (*s, StageStatus::idle())).collect(),
            open_trades: 0,
            unrealized_pnl: 0.0,
            account: None,
            last_signal: None,
            last_decision: None,
            active: false,
            idle_reason: Some(state.as_str().to_string()),
            last_error: None,
            ticks: 0,
        }
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageStatus> {
        self.stages.get(&stage)
    }
}

struct Session {
    run: Run,
    pipeline: DecisionPipeline,
    last_processed: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Lifecycle {
    cancel: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

pub struct TradingEngine {
    config: TradingConfig,
    candles: Arc<dyn CandleSource>,
    broker: Arc<dyn Broker>,
    bus: EventBus,
    runs: Option<RunRepository>,
    news: Arc<dyn TradingBlock>,
    lifecycle: Mutex<Lifecycle>,
    session: Mutex<Option<Session>>,
    forced: Mutex<Option<ForcedSignal>>,
    status: RwLock<EngineStatus>,
}

impl TradingEngine {
    pub fn new(
        config: TradingConfig,
        candles: Arc<dyn CandleSource>,
        broker: Arc<dyn Broker>,
        bus: EventBus,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(TradingEngine {
            config,
            candles,
            broker,
            bus,
            runs: None,
            news: Arc::new(NoBlock),
            lifecycle: Mutex::new(Lifecycle::default()),
            session: Mutex::new(None),
            forced: Mutex::new(None),
            status: RwLock::new(EngineStatus::new(EngineState::Stopped, None)),
        })
    }

    pub fn with_runs(mut self, runs: RunRepository) -> Self {
        self.runs = Some(runs);
        self
    }

    pub fn with_news(mut self, news: Arc<dyn TradingBlock>) -> Self {
        self.news = news;
        self
    }

    pub fn config(&self) -> &TradingConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Starts a session, or returns the current Run when one is active.
    ///
    /// Everything that can be rejected is checked before the Run exists.
    pub async fn start(
        self: &Arc<Self>,
        instrument: &str,
        timeframe: Timeframe,
        mode: RunMode,
    ) -> Result<Run, EngineError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(run) = self.active_run().await {
            info!("Session {} already running", run.id);
            return Ok(run);
        }
        // A loop that died on a broker failure leaves its handle behind.
        if let Some(handle) = lifecycle.handle.take() {
            if let Err(e) = handle.await {
                error!("Previous tick loop ended abnormally: {}", e);
            }
        }
        lifecycle.cancel = None;

        validate_instrument(instrument)?;
        self.check_mode(mode)?;
        let pipeline = self.build_pipeline()?;
        let pipeline_strategy = pipeline.strategy_name().to_string();

        let run = Run::start(instrument, timeframe, mode);
        if let Some(runs) = &self.runs {
            runs.create(&run).await?;
        }

        *self.forced.lock().await = None;
        *self.session.lock().await = Some(Session {
            run: run.clone(),
            pipeline,
            last_processed: None,
        });
        let mut status = EngineStatus::new(EngineState::Running, Some(run.clone()));
        status.idle_reason = Some("awaiting_candle".to_string());
        *self.status.write().await = status;
        self.publish_state(&run, EngineState::Running, None);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let period = self.config.tick_interval();
        let engine = Arc::clone(self);
        lifecycle.handle = Some(tokio::spawn(async move {
            engine.run_loop(cancel_rx, period).await;
        }));
        lifecycle.cancel = Some(cancel_tx);

        info!(
            "Started {} session {} on {} {} with {} (tick every {:?})",
            mode,
            run.id,
            run.instrument,
            run.timeframe,
            pipeline_strategy,
            period
        );
        Ok(run)
    }

    /// Stops the session and seals its Run. A second call is a no-op and
    /// returns `None`.
    pub async fn stop(&self) -> Result<Option<Run>, EngineError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(cancel) = lifecycle.cancel.take() else {
            debug!("Stop requested with no active session");
            return Ok(None);
        };
        // The receiver is gone when the loop already exited on an error.
        let _ = cancel.send(true);
        if let Some(handle) = lifecycle.handle.take() {
            if let Err(e) = handle.await {
                error!("Tick loop ended abnormally: {}", e);
            }
        }

        let Some(mut session) = self.session.lock().await.take() else {
            return Ok(None);
        };
        session.run.seal(RunStatus::Stopped);
        self.finish(&session.run, EngineState::Stopped, None).await;
        self.persist_seal(&session.run).await?;
        info!("Stopped session {}", session.run.id);
        Ok(Some(session.run))
    }

    /// Queues a manual signal for the next tick that reaches signal
    /// generation. It still goes through risk sizing and is dropped after
    /// that tick whatever the outcome.
    pub async fn force_signal(&self, direction: Direction, confidence: f64) -> Result<(), EngineError> {
        if direction == Direction::Flat {
            return Err(EngineError::InvalidInput(
                "forced signal must be long or short".to_string(),
            ));
        }
        if !(confidence.is_finite() && (0.0..=1.0).contains(&confidence)) {
            return Err(EngineError::InvalidInput(format!(
                "confidence {} is outside [0, 1]",
                confidence
            )));
        }

        let session = self.session.lock().await;
        let Some(session) = session.as_ref() else {
            return Err(EngineError::NotRunning);
        };
        *self.forced.lock().await = Some(ForcedSignal {
            direction,
            confidence,
        });
        info!(
            "Forced {} signal ({:.2}) queued for run {}",
            direction, confidence, session.run.id
        );
        Ok(())
    }

    pub async fn status(&self) -> EngineStatus {
        self.status.read().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Replays `[start, end]` of the configured timeframe on a fresh pipeline
    /// and ledger. Shares nothing with a running session.
    pub async fn run_backtest(
        &self,
        instrument: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BacktestReport, EngineError> {
        validate_instrument(instrument)?;
        if end <= start {
            return Err(EngineError::InvalidInput(format!(
                "backtest end {} is not after start {}",
                end, start
            )));
        }

        let timeframe = self.config.timeframe;
        let candles = self.candles.range(instrument, timeframe, start, end).await?;
        if candles.is_empty() {
            return Err(DataError::NoData {
                instrument: instrument.to_string(),
                timeframe: timeframe.to_string(),
            }
            .into());
        }
        let higher = match self.config.higher_timeframe {
            Some(htf) => Some(self.candles.range(instrument, htf, start, end).await?),
            None => None,
        };

        let backtester = Backtester::new(
            self.build_pipeline()?,
            PaperLedger::new(self.config.paper_initial_balance, self.config.paper_margin_rate),
            self.config.window_size,
        )
        .with_news(Arc::clone(&self.news));

        info!(
            "Backtesting {} {} over {} candles ({} to {})",
            instrument,
            timeframe,
            candles.len(),
            start,
            end
        );
        let report = tokio::task::spawn_blocking(move || backtester.run(&candles, higher.as_deref()))
            .await
            .map_err(|e| EngineError::Internal(format!("backtest task failed: {}", e)))??;
        Ok(report)
    }

    /// Runs one pass of the pipeline. The loop calls this on every timer
    /// tick; tests drive it directly.
    pub async fn tick(&self) -> Result<(), EngineError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(EngineError::NotRunning)?;
        let run_id = session.run.id.clone();

        let result = self.run_tick(session).await;
        if let Err(e) = &result {
            let reason = e.to_string();
            self.set_stage(&run_id, Stage::Broker, StageState::Error, Some(&reason))
                .await;
        }
        result
    }

    async fn run_loop(self: Arc<Self>, mut cancel: watch::Receiver<bool>, period: Duration) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        self.fail(e).await;
                        break;
                    }
                }
            }
        }
        debug!("Tick loop exited");
    }

    async fn run_tick(&self, session: &mut Session) -> Result<(), EngineError> {
        let run_id = session.run.id.clone();
        let instrument = session.run.instrument.clone();
        let timeframe = session.run.timeframe;
        let window = self.config.window_size;

        // 1. data
        let candles = match self.candles.latest(&instrument, timeframe, window).await {
            Ok(candles) => candles,
            Err(e) => {
                warn!("Candle fetch for {} {} failed: {}", instrument, timeframe, e);
                Vec::new()
            }
        };
        let Some(last) = candles.last().cloned() else {
            self.set_stage(&run_id, Stage::Data, StageState::Blocked, Some("no_data"))
                .await;
            self.note_idle("no_data").await;
            return Ok(());
        };
        if session
            .last_processed
            .is_some_and(|ts| last.timestamp <= ts)
        {
            self.set_stage(&run_id, Stage::Data, StageState::Idle, Some("awaiting_candle"))
                .await;
            self.note_idle("awaiting_candle").await;
            return Ok(());
        }
        session.last_processed = Some(last.timestamp);
        self.set_stage(&run_id, Stage::Data, StageState::Ok, None).await;

        let higher = match self.config.higher_timeframe {
            Some(htf) => match self.candles.latest(&instrument, htf, window).await {
                Ok(candles) => Some(candles),
                Err(e) => {
                    debug!("No {} context for {}: {}", htf, instrument, e);
                    None
                }
            },
            None => None,
        };

        // 2-4. features, signal, risk
        let equity = self.broker.account_summary().await?.equity;
        // Positions outlive the run that opened them; they keep counting
        // against the exposure cap.
        session
            .pipeline
            .sync_exposure(&self.broker.list_all_open_positions().await?);
        let forced = if candles.len() >= session.pipeline.min_history() {
            self.forced.lock().await.take()
        } else {
            None
        };
        let news_blocked = self.news.is_blocked(&instrument, last.timestamp);
        let outcome = session.pipeline.decide(DecisionInput {
            run_id: &run_id,
            candles: &candles,
            higher_timeframe: higher.as_deref(),
            equity,
            forced,
            news_blocked,
        });
        let record = DecisionRecord::new(last.timestamp, &outcome.decision);

        match &outcome.decision {
            Decision::InsufficientHistory { have, need } => {
                debug!("Waiting for history: {}/{} candles", have, need);
                self.set_stage(&run_id, Stage::Features, StageState::Blocked, Some("insufficient_history"))
                    .await;
                return self.refresh_status(&run_id, record, None).await;
            }
            Decision::SignalRejected { reason } => {
                self.set_stage(&run_id, Stage::Features, StageState::Ok, None).await;
                self.set_stage(&run_id, Stage::Risk, StageState::Blocked, Some(reason.reason()))
                    .await;
            }
            Decision::RiskRejected { rejection } => {
                info!("Risk rejected signal at {}: {}", last.timestamp, rejection.reason());
                self.set_stage(&run_id, Stage::Features, StageState::Ok, None).await;
                self.set_stage(&run_id, Stage::Risk, StageState::Blocked, Some(rejection.reason()))
                    .await;
            }
            // 5. order
            Decision::Accepted { plan, intent } => {
                self.set_stage(&run_id, Stage::Features, StageState::Ok, None).await;
                self.set_stage(&run_id, Stage::Risk, StageState::Ok, None).await;
                let position = self.broker.place_order(intent).await?;
                session.pipeline.on_opened(&position);
                self.set_stage(&run_id, Stage::Order, StageState::Ok, None).await;
                info!(
                    "Opened {} {} {} @ {:.5} (stop {:.5}, target {:.5}, leverage {:.2})",
                    position.id,
                    position.side,
                    position.units,
                    position.entry_price,
                    plan.stop_loss,
                    plan.take_profit,
                    plan.leverage
                );
                self.bus.publish(
                    EventEnvelope::new(topics::TRADE_EXECUTED, Some(&run_id)).with_payload(&json!({
                        "position": position,
                        "plan": plan,
                        "reason_codes": intent.reason_codes,
                    })),
                );
            }
        }

        // 6. mark to market and exits
        let settled = self
            .broker
            .refresh_mark_to_market(&instrument, last.close, last.timestamp)
            .await?;
        self.set_stage(&run_id, Stage::Broker, StageState::Ok, None).await;
        for closed in settled {
            session.pipeline.on_closed(&closed);
            self.announce_close(&run_id, &closed);
        }

        let open = self.broker.list_all_open_positions().await?;
        for position in open.iter().filter(|p| p.instrument == instrument) {
            let Some(reason) =
                session
                    .pipeline
                    .exit_reason(position, last.close, outcome.signal.as_ref())
            else {
                continue;
            };
            let closed = self.broker.close_position(&position.id, reason).await?;
            session.pipeline.on_closed(&closed);
            self.announce_close(&run_id, &closed);
        }
        self.set_stage(&run_id, Stage::Position, StageState::Ok, None).await;

        // 7. status
        self.refresh_status(&run_id, record, outcome.signal).await
    }

    fn announce_close(&self, run_id: &str, closed: &Position) {
        let reason = closed.exit_reason.unwrap_or(ExitReason::Manual);
        info!(
            "Closed {} (run {}) on {} @ {:.5}, realized {:.2}",
            closed.id,
            closed.run_id,
            reason,
            closed.exit_price.unwrap_or_default(),
            closed.realized_pnl
        );
        self.bus.publish(
            EventEnvelope::new(topics::POSITION_CLOSED, Some(run_id))
                .with_reason(Some(reason.as_str()))
                .with_payload(closed),
        );
    }

    async fn refresh_status(
        &self,
        run_id: &str,
        record: DecisionRecord,
        signal: Option<Signal>,
    ) -> Result<(), EngineError> {
        let account = self.broker.account_summary().await?;
        let open = self.broker.list_all_open_positions().await?;
        let unrealized: f64 = open.iter().map(|p| p.unrealized_pnl).sum();
        let fresh_signal = signal
            .as_ref()
            .is_some_and(|s| s.is_actionable(self.config.min_confidence_threshold));
        let active = !open.is_empty() || fresh_signal;

        self.set_stage(run_id, Stage::Pnl, StageState::Ok, None).await;
        let snapshot = {
            let mut status = self.status.write().await;
            status.open_trades = open.len();
            status.unrealized_pnl = unrealized;
            status.account = Some(account);
            if signal.is_some() {
                status.last_signal = signal;
            }
            status.idle_reason = if active {
                None
            } else if open.is_empty() && record.outcome == "accepted" {
                Some("no_open_positions".to_string())
            } else {
                Some(record.outcome.clone())
            };
            status.last_decision = Some(record);
            status.active = active;
            status.ticks += 1;
            status.clone()
        };
        self.bus
            .publish(EventEnvelope::new(topics::ENGINE_STATUS, Some(run_id)).with_payload(&snapshot));
        Ok(())
    }

    /// Bookkeeping for ticks that end before the pipeline runs.
    async fn note_idle(&self, reason: &str) {
        let mut status = self.status.write().await;
        status.ticks += 1;
        if status.open_trades == 0 {
            status.active = false;
            status.idle_reason = Some(reason.to_string());
        }
    }

    async fn fail(&self, err: EngineError) {
        error!("Session failed: {}", err);
        let Some(mut session) = self.session.lock().await.take() else {
            return;
        };
        session.run.seal(RunStatus::Error);
        self.finish(&session.run, EngineState::Error, Some(err.to_string()))
            .await;
        if let Err(e) = self.persist_seal(&session.run).await {
            error!("Failed to record failed run {}: {}", session.run.id, e);
        }
    }

    async fn finish(&self, run: &Run, state: EngineState, error: Option<String>) {
        {
            let mut status = self.status.write().await;
            status.state = state;
            status.run = Some(run.clone());
            status.active = false;
            status.idle_reason = Some(state.as_str().to_string());
            status.last_error = error.clone();
        }
        self.publish_state(run, state, error.as_deref());
    }

    async fn persist_seal(&self, run: &Run) -> Result<(), EngineError> {
        let (Some(runs), Some(stopped_at)) = (&self.runs, run.stopped_at) else {
            return Ok(());
        };
        if !runs.seal(&run.id, run.status, stopped_at).await? {
            warn!("Run {} was already sealed in storage", run.id);
        }
        Ok(())
    }

    /// Updates one stage and publishes `engine.stage` when it changed.
    async fn set_stage(&self, run_id: &str, stage: Stage, state: StageState, reason: Option<&str>) {
        let changed = {
            let mut status = self.status.write().await;
            let entry = status.stages.entry(stage).or_insert_with(StageStatus::idle);
            let changed = entry.state != state || entry.reason.as_deref() != reason;
            entry.state = state;
            entry.reason = reason.map(str::to_string);
            entry.updated_at = Some(Utc::now());
            changed
        };
        if changed {
            debug!("Stage {} -> {:?} {:?}", stage.as_str(), state, reason);
            self.bus.publish(
                EventEnvelope::new(topics::ENGINE_STAGE, Some(run_id))
                    .with_stage(stage.as_str())
                    .with_reason(reason)
                    .with_payload(&json!({ "state": state })),
            );
        }
    }

    fn publish_state(&self, run: &Run, state: EngineState, reason: Option<&str>) {
        self.bus.publish(
            EventEnvelope::new(topics::ENGINE_STATE, Some(&run.id))
                .with_reason(reason)
                .with_payload(&json!({ "state": state, "run": run })),
        );
    }

    async fn active_run(&self) -> Option<Run> {
        self.session.lock().await.as_ref().map(|s| s.run.clone())
    }

    fn check_mode(&self, mode: RunMode) -> Result<(), ConfigError> {
        let kind = self.broker.kind();
        match (mode, kind) {
            (RunMode::Backtest, _) => Err(ConfigError::InvalidMode(
                "backtests run through run_backtest, not a live session".to_string(),
            )),
            (RunMode::Live, BrokerKind::Paper) | (RunMode::Paper, BrokerKind::Oanda) => {
                Err(ConfigError::ModeMismatch {
                    mode: mode.to_string(),
                    broker: kind.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Fresh strategy state and exposure book for every session and backtest.
    fn build_pipeline(&self) -> Result<DecisionPipeline, ConfigError> {
        let strategy = create_strategy(&self.config.strategy)?;
        Ok(DecisionPipeline::new(
            FeatureCalculator::default(),
            strategy,
            RiskManager::new(self.config.risk.clone()),
            self.config.pipeline_config(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::candle::Candle;
    use crate::domain::errors::BrokerError;
    use crate::domain::repositories::broker::BrokerResult;
    use crate::domain::entities::order::OrderIntent;
    use crate::domain::entities::position::{ExitReason, Position};
    use crate::domain::services::risk_manager::RiskConfig;
    use crate::infrastructure::candle_feed::{ReplayCandleSource, SyntheticCandles};
    use crate::infrastructure::paper_broker::PaperBroker;
    use crate::persistence::init_database;
    use async_trait::async_trait;

    fn config() -> TradingConfig {
        TradingConfig {
            tick_interval_seconds: 3_600,
            ..TradingConfig::default()
        }
    }

    fn candles(n: usize) -> Vec<Candle> {
        SyntheticCandles::new("EUR_USD", Timeframe::M5, 9).generate(n)
    }

    fn engine_with(source: ReplayCandleSource, broker: Arc<dyn Broker>) -> Arc<TradingEngine> {
        Arc::new(TradingEngine::new(config(), Arc::new(source), broker, EventBus::new()).unwrap())
    }

    fn paper() -> Arc<dyn Broker> {
        Arc::new(PaperBroker::new(PaperLedger::new(100_000.0, 0.02)))
    }

    /// Fails every call; used to exercise the error path.
    struct DownBroker;

    #[async_trait]
    impl Broker for DownBroker {
        fn kind(&self) -> BrokerKind {
            BrokerKind::Paper
        }

        async fn place_order(&self, _intent: &OrderIntent) -> BrokerResult<Position> {
            Err(BrokerError::Transport("down".to_string()))
        }

        async fn refresh_mark_to_market(
            &self,
            _instrument: &str,
            _price: f64,
            _at: DateTime<Utc>,
        ) -> BrokerResult<Vec<Position>> {
            Err(BrokerError::Transport("down".to_string()))
        }

        async fn close_position(&self, _id: &str, _reason: ExitReason) -> BrokerResult<Position> {
            Err(BrokerError::Transport("down".to_string()))
        }

        async fn list_open_positions(&self, _run_id: &str) -> BrokerResult<Vec<Position>> {
            Err(BrokerError::Transport("down".to_string()))
        }

        async fn list_all_open_positions(&self) -> BrokerResult<Vec<Position>> {
            Err(BrokerError::Transport("down".to_string()))
        }

        async fn account_summary(&self) -> BrokerResult<Account> {
            Err(BrokerError::Unavailable {
                status: 503,
                attempts: 3,
            })
        }
    }

    #[tokio::test]
    async fn test_start_twice_reuses_run_and_stop_twice_is_noop() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let runs = RunRepository::new(pool);
        let engine = Arc::new(
            TradingEngine::new(
                config(),
                Arc::new(ReplayCandleSource::new(candles(10))),
                paper(),
                EventBus::new(),
            )
            .unwrap()
            .with_runs(runs.clone()),
        );

        let first = engine.start("EUR_USD", Timeframe::M5, RunMode::Paper).await.unwrap();
        let second = engine.start("EUR_USD", Timeframe::M5, RunMode::Paper).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(runs.list_recent(10).await.unwrap().len(), 1);

        let stopped = engine.stop().await.unwrap().unwrap();
        assert_eq!(stopped.status, RunStatus::Stopped);
        assert!(engine.stop().await.unwrap().is_none());

        let stored = runs.get(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Stopped);
        assert_eq!(engine.status().await.state, EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_rejections_happen_before_a_run_exists() {
        let engine = engine_with(ReplayCandleSource::new(candles(10)), paper());
        assert!(matches!(
            engine.start("EURUSD", Timeframe::M5, RunMode::Paper).await,
            Err(EngineError::Config(ConfigError::InvalidInstrument(_)))
        ));
        assert!(matches!(
            engine.start("EUR_USD", Timeframe::M5, RunMode::Live).await,
            Err(EngineError::Config(ConfigError::ModeMismatch { .. }))
        ));
        assert!(!engine.is_running().await);

        let mut bad = config();
        bad.strategy = "martingale".to_string();
        assert!(TradingEngine::new(
            bad,
            Arc::new(ReplayCandleSource::new(candles(10))),
            paper(),
            EventBus::new()
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_data_gaps_block_without_failing() {
        let engine = engine_with(ReplayCandleSource::new(Vec::new()), paper());
        engine.start("EUR_USD", Timeframe::M5, RunMode::Paper).await.unwrap();
        engine.tick().await.unwrap();

        let status = engine.status().await;
        assert_eq!(status.state, EngineState::Running);
        let data = status.stage(Stage::Data).unwrap();
        assert_eq!(data.state, StageState::Blocked);
        assert_eq!(data.reason.as_deref(), Some("no_data"));
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_short_history_blocks_features() {
        let engine = engine_with(ReplayCandleSource::new(candles(5)), paper());
        engine.start("EUR_USD", Timeframe::M5, RunMode::Paper).await.unwrap();
        engine.tick().await.unwrap();

        let status = engine.status().await;
        let features = status.stage(Stage::Features).unwrap();
        assert_eq!(features.reason.as_deref(), Some("insufficient_history"));
        assert_eq!(
            status.last_decision.unwrap().outcome,
            "insufficient_history"
        );
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_processed_candle_is_not_reprocessed() {
        let source = ReplayCandleSource::new(candles(60)).with_revealed(60);
        let engine = engine_with(source, paper());
        engine.start("EUR_USD", Timeframe::M5, RunMode::Paper).await.unwrap();

        engine.tick().await.unwrap();
        let first = engine.status().await.last_decision;
        engine.tick().await.unwrap();

        let status = engine.status().await;
        let data = status.stage(Stage::Data).unwrap();
        assert_eq!(data.state, StageState::Idle);
        assert_eq!(data.reason.as_deref(), Some("awaiting_candle"));
        assert_eq!(status.last_decision, first);
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_forced_signal_is_consumed_once() {
        let source = ReplayCandleSource::new(candles(80)).with_revealed(60);
        let broker = paper();
        let engine = engine_with(source, Arc::clone(&broker));
        let mut trades = engine.bus().subscribe(topics::TRADE_EXECUTED);

        assert!(matches!(
            engine.force_signal(Direction::Long, 0.9).await,
            Err(EngineError::NotRunning)
        ));
        let run = engine.start("EUR_USD", Timeframe::M5, RunMode::Paper).await.unwrap();
        assert!(matches!(
            engine.force_signal(Direction::Flat, 0.9).await,
            Err(EngineError::InvalidInput(_))
        ));

        engine.force_signal(Direction::Short, 0.95).await.unwrap();
        engine.tick().await.unwrap();
        let event = trades.recv().await.unwrap();
        assert_eq!(event.run_id.as_deref(), Some(run.id.as_str()));
        assert_eq!(event.payload["position"]["side"], "short");

        let open = broker.list_open_positions(&run.id).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(engine.status().await.last_signal.unwrap().reason, "forced");

        engine.tick().await.unwrap();
        assert_ne!(
            engine.status().await.last_signal.map(|s| s.reason),
            Some("forced".to_string())
        );
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restarted_sessions_respect_exposure_of_earlier_runs() {
        let source = ReplayCandleSource::new(candles(60)).with_revealed(60);
        let broker = paper();
        let engine = engine_with(source, Arc::clone(&broker));

        let mut outcomes = Vec::new();
        for _ in 0..8 {
            engine.start("EUR_USD", Timeframe::M5, RunMode::Paper).await.unwrap();
            engine.force_signal(Direction::Long, 0.95).await.unwrap();
            engine.tick().await.unwrap();
            let status = engine.status().await;
            outcomes.push(status.last_decision.unwrap().outcome);
            assert_eq!(status.open_trades, broker.list_all_open_positions().await.unwrap().len());
            engine.stop().await.unwrap();
        }

        let open = broker.list_all_open_positions().await.unwrap();
        let at_risk: f64 = open.iter().map(|p| p.risk_fraction).sum();
        assert_eq!(open.len(), 5);
        assert!(at_risk <= RiskConfig::default().max_exposure);
        assert_eq!(outcomes.iter().filter(|o| *o == "accepted").count(), 5);
        assert!(outcomes[5..].iter().all(|o| o == "exposure_cap"));
    }

    #[tokio::test]
    async fn test_exits_cover_positions_of_earlier_runs() {
        let bars = candles(60);
        let last = bars[59].clone();
        let broker = paper();
        let earlier = OrderIntent {
            run_id: "run-before-restart".to_string(),
            instrument: "EUR_USD".to_string(),
            side: Direction::Long,
            units: 1_000,
            price: last.close + 0.01,
            stop_loss: Some(last.close + 0.005),
            take_profit: Some(last.close + 0.03),
            reason_codes: vec!["forced".to_string()],
            risk_fraction: 0.001,
            submitted_at: last.timestamp,
        };
        let stale = broker.place_order(&earlier).await.unwrap();
        let engine = engine_with(ReplayCandleSource::new(bars).with_revealed(60), Arc::clone(&broker));
        let mut closes = engine.bus().subscribe(topics::POSITION_CLOSED);

        engine.start("EUR_USD", Timeframe::M5, RunMode::Paper).await.unwrap();
        engine.tick().await.unwrap();

        let event = closes.recv().await.unwrap();
        assert_eq!(event.payload["id"], stale.id.as_str());
        assert_eq!(event.reason.as_deref(), Some("stop_loss"));
        let open = broker.list_all_open_positions().await.unwrap();
        assert!(open.iter().all(|p| p.id != stale.id));
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_broker_failure_is_fatal_to_the_session() {
        let source = ReplayCandleSource::new(candles(60)).with_revealed(60);
        let engine = engine_with(source, Arc::new(DownBroker));
        let mut states = engine.bus().subscribe(topics::ENGINE_STATE);
        engine.start("EUR_USD", Timeframe::M5, RunMode::Paper).await.unwrap();
        let _running = states.recv().await.unwrap();

        let err = engine.tick().await.unwrap_err();
        assert!(matches!(err, EngineError::Broker(_)));
        engine.fail(err).await;

        let status = engine.status().await;
        assert_eq!(status.state, EngineState::Error);
        assert_eq!(status.run.unwrap().status, RunStatus::Error);
        assert!(status.last_error.is_some());
        assert_eq!(states.recv().await.unwrap().payload["state"], "error");

        // The dead loop is reaped by the next stop.
        assert!(engine.stop().await.unwrap().is_none());
        assert!(!engine.is_running().await);
    }
}
