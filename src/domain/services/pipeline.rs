//! Candle-to-order decision path shared by the live engine and the backtester.
//!
//! Both drivers feed the same inputs through [`DecisionPipeline::decide`] and
//! [`DecisionPipeline::exit_reason`], so accept/reject sequences match as long
//! as the candle windows and equity readings match.

use crate::domain::entities::candle::Candle;
use crate::domain::entities::order::OrderIntent;
use crate::domain::entities::position::{ExitReason, Position};
use crate::domain::entities::signal::{Direction, Signal};
use crate::domain::services::features::{FeatureCalculator, FeatureSnapshot};
use crate::domain::services::risk_manager::{
    PositionPlan, RiskManager, RiskRejection, SizingRequest,
};
use crate::domain::services::strategies::{SignalContext, SignalGenerator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub min_confidence: f64,
    /// Extra confidence over `min_confidence` an opposing signal needs to
    /// close a position.
    pub flip_margin: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            min_confidence: 0.6,
            flip_margin: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalRejection {
    FlatSignal,
    LowConfidence,
    NewsBlocked,
}

impl SignalRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            SignalRejection::FlatSignal => "flat_signal",
            SignalRejection::LowConfidence => "low_confidence",
            SignalRejection::NewsBlocked => "news_blocked",
        }
    }
}

/// Outcome of one pass through features, signal and risk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    InsufficientHistory { have: usize, need: usize },
    SignalRejected { reason: SignalRejection },
    RiskRejected { rejection: RiskRejection },
    Accepted { plan: PositionPlan, intent: OrderIntent },
}

impl Decision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Decision::Accepted { .. })
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Decision::InsufficientHistory { .. } => "insufficient_history",
            Decision::SignalRejected { reason } => reason.reason(),
            Decision::RiskRejected { rejection } => rejection.reason(),
            Decision::Accepted { .. } => "accepted",
        }
    }
}

/// Accept/reject outcome for one candle, as reported by both drivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub timestamp: DateTime<Utc>,
    pub outcome: String,
}

impl DecisionRecord {
    pub fn new(timestamp: DateTime<Utc>, decision: &Decision) -> Self {
        DecisionRecord {
            timestamp,
            outcome: decision.reason().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForcedSignal {
    pub direction: Direction,
    pub confidence: f64,
}

pub struct DecisionInput<'a> {
    pub run_id: &'a str,
    pub candles: &'a [Candle],
    pub higher_timeframe: Option<&'a [Candle]>,
    pub equity: f64,
    pub forced: Option<ForcedSignal>,
    pub news_blocked: bool,
}

#[derive(Debug, Clone)]
pub struct TickDecision {
    pub decision: Decision,
    pub signal: Option<Signal>,
    pub features: Option<FeatureSnapshot>,
}

pub struct DecisionPipeline {
    features: FeatureCalculator,
    strategy: Box<dyn SignalGenerator>,
    risk: RiskManager,
    config: PipelineConfig,
}

impl DecisionPipeline {
    pub fn new(
        features: FeatureCalculator,
        strategy: Box<dyn SignalGenerator>,
        risk: RiskManager,
        config: PipelineConfig,
    ) -> Self {
        DecisionPipeline {
            features,
            strategy,
            risk,
            config,
        }
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    pub fn min_history(&self) -> usize {
        self.features.min_history().max(self.strategy.min_history())
    }

    pub fn decide(&mut self, input: DecisionInput<'_>) -> TickDecision {
        self.risk.observe_equity(input.equity);

        let need = self.min_history();
        let features = if input.candles.len() >= need {
            self.features.compute(input.candles)
        } else {
            None
        };
        let (Some(last), Some(features)) = (input.candles.last(), features) else {
            return TickDecision {
                decision: Decision::InsufficientHistory {
                    have: input.candles.len(),
                    need,
                },
                signal: None,
                features: None,
            };
        };

        let signal = match input.forced {
            Some(forced) => Signal::forced(forced.direction, forced.confidence, last.timestamp)
                .with_entry(last.close),
            None => {
                let ctx = SignalContext {
                    candles: input.candles,
                    features: &features,
                    higher_timeframe: input.higher_timeframe,
                };
                self.strategy.generate(&ctx)
            }
        };

        let rejection = if input.news_blocked {
            Some(SignalRejection::NewsBlocked)
        } else if signal.direction == Direction::Flat {
            Some(SignalRejection::FlatSignal)
        } else if signal.confidence < self.config.min_confidence {
            Some(SignalRejection::LowConfidence)
        } else {
            None
        };
        if let Some(reason) = rejection {
            return TickDecision {
                decision: Decision::SignalRejected { reason },
                signal: Some(signal),
                features: Some(features),
            };
        }

        let request = SizingRequest {
            equity: input.equity,
            price: last.close,
            direction: signal.direction,
            atr: features.atr,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
        };
        let decision = match self.risk.size(&request) {
            Ok(plan) => {
                let intent = OrderIntent {
                    run_id: input.run_id.to_string(),
                    instrument: last.instrument.clone(),
                    side: signal.direction,
                    units: plan.units,
                    price: last.close,
                    stop_loss: Some(plan.stop_loss),
                    take_profit: Some(plan.take_profit),
                    reason_codes: vec![self.strategy.name().to_string(), signal.reason.clone()],
                    risk_fraction: plan.risk_fraction,
                    submitted_at: last.timestamp,
                };
                Decision::Accepted { plan, intent }
            }
            Err(rejection) => {
                debug!(
                    "Risk rejected {} signal at {}: {}",
                    signal.direction,
                    last.timestamp,
                    rejection.reason()
                );
                Decision::RiskRejected { rejection }
            }
        };

        TickDecision {
            decision,
            signal: Some(signal),
            features: Some(features),
        }
    }

    /// Exit rule in priority order: stop, target, then opposing signal.
    pub fn exit_reason(
        &self,
        position: &Position,
        price: f64,
        signal: Option<&Signal>,
    ) -> Option<ExitReason> {
        if !position.is_open() {
            return None;
        }
        if position.stop_crossed(price) {
            return Some(ExitReason::StopLoss);
        }
        if position.target_crossed(price) {
            return Some(ExitReason::TakeProfit);
        }
        let flip_threshold = self.config.min_confidence + self.config.flip_margin;
        match signal {
            Some(s) if s.direction.opposes(position.side) && s.confidence >= flip_threshold => {
                Some(ExitReason::SignalFlip)
            }
            _ => None,
        }
    }

    pub fn on_opened(&mut self, position: &Position) {
        self.risk.register(&position.id, position.risk_fraction);
    }

    pub fn on_closed(&mut self, position: &Position) {
        self.risk.release(&position.id);
    }

    /// Rebuilds the exposure book from what the broker holds open, whichever
    /// run opened it.
    pub fn sync_exposure(&mut self, open: &[Position]) {
        self.risk.reset_exposure(
            open.iter()
                .filter(|p| p.is_open())
                .map(|p| (p.id.as_str(), p.risk_fraction)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::candle::Timeframe;
    use crate::domain::entities::position::PositionStatus;
    use crate::domain::services::risk_manager::RiskConfig;
    use crate::domain::services::strategies::create_strategy;
    use crate::infrastructure::candle_feed::SyntheticCandles;
    use chrono::Utc;

    fn pipeline() -> DecisionPipeline {
        DecisionPipeline::new(
            FeatureCalculator::default(),
            create_strategy("sma_crossover").unwrap(),
            RiskManager::new(RiskConfig::default()),
            PipelineConfig::default(),
        )
    }

    fn input<'a>(candles: &'a [Candle], forced: Option<ForcedSignal>) -> DecisionInput<'a> {
        DecisionInput {
            run_id: "run",
            candles,
            higher_timeframe: None,
            equity: 100_000.0,
            forced,
            news_blocked: false,
        }
    }

    fn open_long() -> Position {
        Position {
            id: "pos-000001".to_string(),
            run_id: "run".to_string(),
            order_id: "ord-000001".to_string(),
            instrument: "EUR_USD".to_string(),
            side: Direction::Long,
            entry_price: 1.10,
            units: 1_000,
            stop_loss: Some(1.09),
            take_profit: Some(1.12),
            status: PositionStatus::Open,
            exit_price: None,
            exit_reason: None,
            opened_at: Utc::now(),
            closed_at: None,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            risk_fraction: 0.01,
        }
    }

    #[test]
    fn test_short_window_is_insufficient_history() {
        let candles = SyntheticCandles::new("EUR_USD", Timeframe::M5, 1).generate(10);
        let mut p = pipeline();
        let out = p.decide(input(&candles, None));
        assert_eq!(out.decision, Decision::InsufficientHistory { have: 10, need: 35 });
        assert!(out.signal.is_none());
    }

    #[test]
    fn test_forced_signal_goes_through_risk() {
        let candles = SyntheticCandles::new("EUR_USD", Timeframe::M5, 1).generate(60);
        let mut p = pipeline();
        let forced = ForcedSignal {
            direction: Direction::Short,
            confidence: 0.95,
        };
        let out = p.decide(input(&candles, Some(forced)));
        assert!(out.decision.is_accepted());
        let signal = out.signal.unwrap();
        assert_eq!(signal.reason, "forced");
        match out.decision {
            Decision::Accepted { plan, intent } => {
                assert!(plan.units < 0);
                assert_eq!(intent.side, Direction::Short);
                assert_eq!(intent.submitted_at, candles[59].timestamp);
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_low_confidence_and_news_rejections() {
        let candles = SyntheticCandles::new("EUR_USD", Timeframe::M5, 1).generate(60);
        let mut p = pipeline();
        let weak = ForcedSignal {
            direction: Direction::Long,
            confidence: 0.3,
        };
        let out = p.decide(input(&candles, Some(weak)));
        assert!(!out.decision.is_accepted());
        assert_eq!(out.decision.reason(), "low_confidence");

        let mut blocked = input(&candles, Some(weak));
        blocked.news_blocked = true;
        assert_eq!(p.decide(blocked).decision.reason(), "news_blocked");
    }

    #[test]
    fn test_exit_priority() {
        let p = pipeline();
        let pos = open_long();
        let now = Utc::now();
        let strong_short = Signal::new(Direction::Short, 0.95, "x", now);
        let weak_short = Signal::new(Direction::Short, 0.8, "x", now);

        assert_eq!(p.exit_reason(&pos, 1.08, Some(&strong_short)), Some(ExitReason::StopLoss));
        assert_eq!(p.exit_reason(&pos, 1.125, None), Some(ExitReason::TakeProfit));
        assert_eq!(p.exit_reason(&pos, 1.10, Some(&strong_short)), Some(ExitReason::SignalFlip));
        assert_eq!(p.exit_reason(&pos, 1.10, Some(&weak_short)), None);
    }

    #[test]
    fn test_exposure_follows_open_and_close() {
        let mut p = pipeline();
        let pos = open_long();
        p.on_opened(&pos);
        assert!((p.risk().current_exposure() - 0.01).abs() < 1e-12);
        p.on_closed(&pos);
        assert_eq!(p.risk().current_exposure(), 0.0);

        let mut earlier = open_long();
        earlier.id = "pos-000007".to_string();
        earlier.run_id = "previous-run".to_string();
        p.sync_exposure(&[pos.clone(), earlier]);
        assert_eq!(p.risk().open_risk_count(), 2);
        assert!((p.risk().current_exposure() - 0.02).abs() < 1e-12);
    }
}
