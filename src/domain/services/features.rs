use crate::domain::entities::candle::Candle;
use crate::domain::services::indicators::{
    BollingerBands, Indicator, ADX, ATR, EMA, MACD, RSI, SMA,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub sma_fast: usize,
    pub sma_slow: usize,
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub rsi_period: usize,
    pub atr_period: usize,
    pub macd_signal: usize,
    pub adx_period: usize,
    pub bollinger_period: usize,
    pub bollinger_std_dev: f64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        FeatureConfig {
            sma_fast: 10,
            sma_slow: 30,
            ema_fast: 12,
            ema_slow: 26,
            rsi_period: 14,
            atr_period: 14,
            macd_signal: 9,
            adx_period: 14,
            bollinger_period: 20,
            bollinger_std_dev: 2.0,
        }
    }
}

impl FeatureConfig {
    /// Smallest window for which every feature is defined.
    pub fn min_history(&self) -> usize {
        [
            self.sma_slow,
            self.sma_fast,
            self.ema_slow + self.macd_signal,
            2 * self.adx_period + 1,
            self.bollinger_period,
            self.rsi_period + 1,
            self.atr_period + 1,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }
}

/// Fixed-shape numeric view of the trailing candle window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub close: f64,
    pub sma_fast: f64,
    pub sma_slow: f64,
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub rsi: f64,
    pub atr: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    pub adx: f64,
    pub bollinger_upper: f64,
    pub bollinger_middle: f64,
    pub bollinger_lower: f64,
    pub bollinger_bandwidth: f64,
    pub bollinger_percent_b: f64,
}

/// Derives a [`FeatureSnapshot`] from a candle window.
///
/// The computation is a pure function of the window it is given.
#[derive(Debug, Clone, Default)]
pub struct FeatureCalculator {
    config: FeatureConfig,
}

impl FeatureCalculator {
    pub fn new(config: FeatureConfig) -> Self {
        FeatureCalculator { config }
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub fn min_history(&self) -> usize {
        self.config.min_history()
    }

    /// Returns `None` until the window reaches the minimum length.
    pub fn compute(&self, candles: &[Candle]) -> Option<FeatureSnapshot> {
        if candles.len() < self.min_history() {
            return None;
        }
        let cfg = &self.config;
        let close = candles.last()?.close;

        let macd = MACD::new(cfg.ema_fast, cfg.ema_slow, cfg.macd_signal).calculate_detailed(candles);
        let bands = BollingerBands::new(cfg.bollinger_period, cfg.bollinger_std_dev)
            .calculate_detailed(candles);
        let upper = *bands.upper.last()?;
        let middle = *bands.middle.last()?;
        let lower = *bands.lower.last()?;
        let width = upper - lower;

        Some(FeatureSnapshot {
            close,
            sma_fast: SMA::new(cfg.sma_fast).last(candles)?,
            sma_slow: SMA::new(cfg.sma_slow).last(candles)?,
            ema_fast: EMA::new(cfg.ema_fast).last(candles)?,
            ema_slow: EMA::new(cfg.ema_slow).last(candles)?,
            rsi: RSI::new(cfg.rsi_period).last(candles)?,
            atr: ATR::new(cfg.atr_period).last(candles)?,
            macd: *macd.line.last()?,
            macd_signal: *macd.signal.last()?,
            macd_histogram: *macd.histogram.last()?,
            adx: ADX::new(cfg.adx_period).last(candles)?,
            bollinger_upper: upper,
            bollinger_middle: middle,
            bollinger_lower: lower,
            bollinger_bandwidth: if middle.abs() > f64::EPSILON { width / middle } else { 0.0 },
            bollinger_percent_b: if width > f64::EPSILON { (close - lower) / width } else { 0.5 },
        })
    }
}
