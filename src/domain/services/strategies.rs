use crate::domain::entities::candle::Candle;
use crate::domain::entities::signal::{Direction, Regime, Signal};
use crate::domain::errors::ConfigError;
use crate::domain::services::features::FeatureSnapshot;
use crate::domain::services::indicators::SMA;
use chrono::{DateTime, Utc};

pub const STRATEGY_NAMES: [&str; 3] = ["sma_crossover", "rsi_mean_revert", "regime_adaptive"];

/// Inputs available to a strategy for one candle.
pub struct SignalContext<'a> {
    pub candles: &'a [Candle],
    pub features: &'a FeatureSnapshot,
    pub higher_timeframe: Option<&'a [Candle]>,
}

impl<'a> SignalContext<'a> {
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.candles
            .last()
            .map(|c| c.timestamp)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Pluggable signal source.
///
/// Implementations may remember what they emitted before; a fresh
/// instance is created for every session and every backtest.
pub trait SignalGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// Candles needed beyond what the feature snapshot already requires.
    fn min_history(&self) -> usize {
        0
    }

    fn generate(&mut self, ctx: &SignalContext<'_>) -> Signal;
}

/// Builds a strategy by its registry name.
pub fn create_strategy(name: &str) -> Result<Box<dyn SignalGenerator>, ConfigError> {
    match name.trim().to_lowercase().as_str() {
        "sma_crossover" | "sma" => Ok(Box::new(SmaCrossover::default())),
        "rsi_mean_revert" | "rsi" => Ok(Box::new(RsiMeanRevert::default())),
        "regime_adaptive" | "regime" => Ok(Box::new(RegimeAdaptive::default())),
        _ => Err(ConfigError::UnknownStrategy(name.to_string())),
    }
}

/// Emits once when the fast SMA moves to the other side of the slow SMA.
pub struct SmaCrossover {
    pub base_confidence: f64,
    pub trend_bonus: f64,
    pub adx_trend_threshold: f64,
    last_emitted: Option<Direction>,
}

impl Default for SmaCrossover {
    fn default() -> Self {
        SmaCrossover {
            base_confidence: 0.7,
            trend_bonus: 0.2,
            adx_trend_threshold: 25.0,
            last_emitted: None,
        }
    }
}

impl SignalGenerator for SmaCrossover {
    fn name(&self) -> &str {
        "sma_crossover"
    }

    fn generate(&mut self, ctx: &SignalContext<'_>) -> Signal {
        let f = ctx.features;
        let ts = ctx.timestamp();
        let (direction, reason) = if f.sma_fast > f.sma_slow {
            (Direction::Long, "fast_above_slow")
        } else if f.sma_fast < f.sma_slow {
            (Direction::Short, "fast_below_slow")
        } else {
            return Signal::flat("no_crossover", ts);
        };

        if self.last_emitted == Some(direction) {
            return Signal::flat("no_crossover", ts);
        }
        self.last_emitted = Some(direction);

        let mut confidence = self.base_confidence;
        if f.adx > self.adx_trend_threshold {
            confidence += self.trend_bonus;
        }
        Signal::new(direction, confidence, reason, ts).with_entry(f.close)
    }
}

/// Fades RSI extremes with an ATR-based protective stop.
pub struct RsiMeanRevert {
    pub oversold: f64,
    pub overbought: f64,
    pub atr_multiplier: f64,
    last_emitted: Option<Direction>,
}

impl Default for RsiMeanRevert {
    fn default() -> Self {
        RsiMeanRevert {
            oversold: 30.0,
            overbought: 70.0,
            atr_multiplier: 1.5,
            last_emitted: None,
        }
    }
}

impl SignalGenerator for RsiMeanRevert {
    fn name(&self) -> &str {
        "rsi_mean_revert"
    }

    fn generate(&mut self, ctx: &SignalContext<'_>) -> Signal {
        let f = ctx.features;
        let ts = ctx.timestamp();
        let stop_distance = self.atr_multiplier * f.atr;

        let (direction, distance, reason, stop) = if f.rsi < self.oversold {
            (Direction::Long, self.oversold - f.rsi, "rsi_oversold", f.close - stop_distance)
        } else if f.rsi > self.overbought {
            (Direction::Short, f.rsi - self.overbought, "rsi_overbought", f.close + stop_distance)
        } else {
            return Signal::flat("rsi_neutral", ts);
        };

        if self.last_emitted == Some(direction) {
            return Signal::flat("rsi_neutral", ts);
        }
        self.last_emitted = Some(direction);

        let confidence = 0.6 + (distance / 30.0) * 0.4;
        let stop_loss = if stop_distance > 0.0 { Some(stop) } else { None };
        Signal::new(direction, confidence, reason, ts)
            .with_entry(f.close)
            .with_stops(stop_loss, None)
    }
}

/// Switches between trend following and band fading depending on ADX.
pub struct RegimeAdaptive {
    pub adx_threshold: f64,
    pub htf_period: usize,
    last_emitted: Option<Direction>,
}

impl Default for RegimeAdaptive {
    fn default() -> Self {
        RegimeAdaptive {
            adx_threshold: 25.0,
            htf_period: 20,
            last_emitted: None,
        }
    }
}

impl RegimeAdaptive {
    /// Slope of the higher-timeframe SMA as a direction, if there is enough data.
    fn higher_timeframe_bias(&self, candles: &[Candle]) -> Option<Direction> {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let sma = SMA::new(self.htf_period).calculate_on_values(&closes);
        let n = sma.len();
        if n < 2 {
            return None;
        }
        let slope = sma[n - 1] - sma[n - 2];
        if slope > 0.0 {
            Some(Direction::Long)
        } else if slope < 0.0 {
            Some(Direction::Short)
        } else {
            None
        }
    }
}

impl SignalGenerator for RegimeAdaptive {
    fn name(&self) -> &str {
        "regime_adaptive"
    }

    fn generate(&mut self, ctx: &SignalContext<'_>) -> Signal {
        let f = ctx.features;
        let ts = ctx.timestamp();
        let regime = if f.adx >= self.adx_threshold {
            Regime::Trending
        } else {
            Regime::Ranging
        };

        let setup = match regime {
            Regime::Trending if f.macd_histogram > 0.0 && f.close > f.sma_slow => {
                Some((Direction::Long, "trend_up"))
            }
            Regime::Trending if f.macd_histogram < 0.0 && f.close < f.sma_slow => {
                Some((Direction::Short, "trend_down"))
            }
            Regime::Ranging if f.close <= f.bollinger_lower => Some((Direction::Long, "range_low")),
            Regime::Ranging if f.close >= f.bollinger_upper => Some((Direction::Short, "range_high")),
            _ => None,
        };

        let Some((direction, reason)) = setup else {
            return Signal::flat("no_setup", ts).with_regime(regime);
        };
        if self.last_emitted == Some(direction) {
            return Signal::flat("no_setup", ts).with_regime(regime);
        }
        self.last_emitted = Some(direction);

        let mut confidence = match regime {
            Regime::Trending => 0.65 + ((f.adx - self.adx_threshold) / 100.0).min(0.2),
            Regime::Ranging => 0.65,
        };
        if let Some(bias) = ctx.higher_timeframe.and_then(|c| self.higher_timeframe_bias(c)) {
            if bias == direction {
                confidence += 0.1;
            } else if bias.opposes(direction) {
                confidence -= 0.2;
            }
        }

        Signal::new(direction, confidence, reason, ts)
            .with_entry(f.close)
            .with_regime(regime)
    }
}
