//! Offline replay of the decision pipeline
//!
//! Each candle goes through the same steps as a live tick: decide on the
//! trailing window, fill an accepted intent at the close, mark open positions
//! at the close and apply the exit rule. No network, no wall clock.

use crate::domain::entities::candle::{Candle, Timeframe};
use crate::domain::entities::position::{ExitReason, Position};
use crate::domain::entities::run::EquityPoint;
use crate::domain::errors::BrokerError;
use crate::domain::services::ledger::PaperLedger;
use crate::domain::services::metrics::PerformanceMetrics;
use crate::domain::services::news_filter::{NoBlock, TradingBlock};
use crate::domain::services::pipeline::{Decision, DecisionInput, DecisionPipeline, DecisionRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

pub const BACKTEST_RUN_ID: &str = "backtest";

#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub run_id: String,
    pub instrument: Option<String>,
    pub timeframe: Option<Timeframe>,
    pub initial_equity: f64,
    pub final_equity: f64,
    pub trades: Vec<Position>,
    pub equity_curve: Vec<EquityPoint>,
    pub decisions: Vec<DecisionRecord>,
    pub metrics: PerformanceMetrics,
}

pub struct Backtester {
    pipeline: DecisionPipeline,
    ledger: PaperLedger,
    window: usize,
    news: Arc<dyn TradingBlock>,
    run_id: String,
}

impl Backtester {
    /// `window` must match the live session's window size for the two to
    /// agree; smoothed indicators depend on where the window starts.
    pub fn new(pipeline: DecisionPipeline, ledger: PaperLedger, window: usize) -> Self {
        Backtester {
            pipeline,
            ledger,
            window: window.max(1),
            news: Arc::new(NoBlock),
            run_id: BACKTEST_RUN_ID.to_string(),
        }
    }

    pub fn with_news(mut self, news: Arc<dyn TradingBlock>) -> Self {
        self.news = news;
        self
    }

    pub fn run(
        mut self,
        candles: &[Candle],
        higher_timeframe: Option<&[Candle]>,
    ) -> Result<BacktestReport, BrokerError> {
        let initial_equity = self.ledger.account().equity;
        let mut equity_curve = Vec::with_capacity(candles.len());
        let mut decisions = Vec::with_capacity(candles.len());
        let mut exposed_bars = 0usize;
        let mut last_processed: Option<DateTime<Utc>> = None;

        for (i, candle) in candles.iter().enumerate() {
            if last_processed.is_some_and(|ts| candle.timestamp <= ts) {
                debug!("Skipping out-of-order candle at {}", candle.timestamp);
                continue;
            }
            last_processed = Some(candle.timestamp);

            let window = &candles[(i + 1).saturating_sub(self.window)..=i];
            let higher = higher_timeframe.map(|h| {
                let end = h.partition_point(|c| c.timestamp <= candle.timestamp);
                &h[end.saturating_sub(self.window)..end]
            });
            let record = self.step(window, higher)?;
            decisions.push(record);

            if !self.ledger.open_positions(None).is_empty() {
                exposed_bars += 1;
            }
            equity_curve.push(EquityPoint {
                timestamp: candle.timestamp,
                equity: self.ledger.account().equity,
            });
        }

        for position in self.ledger.open_positions(None) {
            let closed = self.ledger.close(&position.id, ExitReason::EndOfData)?;
            self.pipeline.on_closed(&closed);
        }

        let trades = self.ledger.closed_positions();
        let timeframe = candles.first().map(|c| c.timeframe);
        let metrics = PerformanceMetrics::compute(
            &equity_curve,
            &trades,
            initial_equity,
            timeframe.unwrap_or(Timeframe::D),
            exposed_bars,
        );
        let final_equity = self.ledger.account().equity;
        info!(
            "Backtest over {} candles: {} trades, return {:.4}, max drawdown {:.4}",
            candles.len(),
            trades.len(),
            metrics.total_return,
            metrics.max_drawdown
        );

        Ok(BacktestReport {
            run_id: self.run_id,
            instrument: candles.first().map(|c| c.instrument.clone()),
            timeframe,
            initial_equity,
            final_equity,
            trades,
            equity_curve,
            decisions,
            metrics,
        })
    }

    fn step(
        &mut self,
        window: &[Candle],
        higher: Option<&[Candle]>,
    ) -> Result<DecisionRecord, BrokerError> {
        let Some(last) = window.last() else {
            return Err(BrokerError::InvalidOrder("empty candle window".to_string()));
        };

        let equity = self.ledger.account().equity;
        let news_blocked = self.news.is_blocked(&last.instrument, last.timestamp);
        let outcome = self.pipeline.decide(DecisionInput {
            run_id: &self.run_id,
            candles: window,
            higher_timeframe: higher,
            equity,
            forced: None,
            news_blocked,
        });
        let record = DecisionRecord::new(last.timestamp, &outcome.decision);

        match &outcome.decision {
            Decision::InsufficientHistory { .. } => return Ok(record),
            Decision::Accepted { intent, .. } => {
                let position = self.ledger.open(intent, intent.price, intent.submitted_at)?;
                self.pipeline.on_opened(&position);
            }
            Decision::SignalRejected { .. } | Decision::RiskRejected { .. } => {}
        }

        self.ledger.mark(&last.instrument, last.close, last.timestamp);
        for position in self.ledger.open_positions(Some(&self.run_id)) {
            if let Some(reason) =
                self.pipeline
                    .exit_reason(&position, last.close, outcome.signal.as_ref())
            {
                let closed = self.ledger.close(&position.id, reason)?;
                self.pipeline.on_closed(&closed);
            }
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::signal::{Direction, Signal};
    use crate::domain::services::features::FeatureCalculator;
    use crate::domain::services::pipeline::PipelineConfig;
    use crate::domain::services::risk_manager::{RiskConfig, RiskManager};
    use crate::domain::services::strategies::{create_strategy, SignalContext, SignalGenerator};
    use crate::infrastructure::candle_feed::SyntheticCandles;
    use approx::assert_relative_eq;

    /// Always long with protective levels far outside the walk's range.
    struct AlwaysLong;

    impl SignalGenerator for AlwaysLong {
        fn name(&self) -> &str {
            "always_long"
        }

        fn generate(&mut self, ctx: &SignalContext<'_>) -> Signal {
            let close = ctx.features.close;
            Signal::new(Direction::Long, 0.9, "test", ctx.timestamp())
                .with_entry(close)
                .with_stops(Some(close - 0.5), Some(close + 0.5))
        }
    }

    fn backtester(strategy: Box<dyn SignalGenerator>) -> Backtester {
        backtester_with_risk(strategy, RiskConfig::default())
    }

    fn backtester_with_risk(strategy: Box<dyn SignalGenerator>, risk: RiskConfig) -> Backtester {
        let pipeline = DecisionPipeline::new(
            FeatureCalculator::default(),
            strategy,
            RiskManager::new(risk),
            PipelineConfig::default(),
        );
        Backtester::new(pipeline, PaperLedger::new(100_000.0, 0.02), 200)
    }

    #[test]
    fn test_one_record_and_equity_point_per_candle() {
        let candles = SyntheticCandles::new("EUR_USD", Timeframe::M5, 3).generate(120);
        let report = backtester(create_strategy("sma_crossover").unwrap())
            .run(&candles, None)
            .unwrap();

        assert_eq!(report.run_id, BACKTEST_RUN_ID);
        assert_eq!(report.equity_curve.len(), 120);
        assert_eq!(report.decisions.len(), 120);
        assert_eq!(report.decisions[0].outcome, "insufficient_history");
        assert_eq!(report.metrics.trade_count, report.trades.len());
        assert!(report.trades.iter().all(|t| !t.is_open()));
        assert_relative_eq!(
            report.final_equity,
            report.equity_curve.last().unwrap().equity,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_replay_is_deterministic() {
        let candles = SyntheticCandles::new("EUR_USD", Timeframe::M5, 11)
            .with_volatility(0.001)
            .generate(300);
        let first = backtester(create_strategy("regime_adaptive").unwrap())
            .run(&candles, None)
            .unwrap();
        let second = backtester(create_strategy("regime_adaptive").unwrap())
            .run(&candles, None)
            .unwrap();

        assert_eq!(first.decisions, second.decisions);
        assert_eq!(first.trades, second.trades);
        assert_eq!(first.final_equity, second.final_equity);
    }

    #[test]
    fn test_open_positions_close_at_end_of_data() {
        let candles = SyntheticCandles::new("EUR_USD", Timeframe::M5, 5).generate(60);
        let risk = RiskConfig {
            max_exposure: 0.045,
            ..RiskConfig::default()
        };
        let report = backtester_with_risk(Box::new(AlwaysLong), risk)
            .run(&candles, None)
            .unwrap();

        // Roughly 1% risk per trade against a 4.5% exposure cap.
        assert_eq!(report.trades.len(), 4);
        assert!(report
            .trades
            .iter()
            .all(|t| t.exit_reason == Some(ExitReason::EndOfData)));
        assert!(report.decisions.iter().any(|d| d.outcome == "exposure_cap"));

        let first_entry = report
            .decisions
            .iter()
            .position(|d| d.outcome == "accepted")
            .unwrap();
        let exposed = (candles.len() - first_entry) as f64 / candles.len() as f64;
        assert_relative_eq!(report.metrics.exposure, exposed, epsilon = 1e-12);
    }

    #[test]
    fn test_empty_input_yields_empty_report() {
        let report = backtester(create_strategy("sma_crossover").unwrap())
            .run(&[], None)
            .unwrap();
        assert!(report.trades.is_empty());
        assert!(report.equity_curve.is_empty());
        assert_eq!(report.final_equity, 100_000.0);
        assert_eq!(report.metrics.trade_count, 0);
    }
}
