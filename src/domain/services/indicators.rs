use crate::domain::entities::candle::Candle;

/// Rolling technical indicator over a candle window.
///
/// Outputs are aligned to the end of the window: the last element always
/// belongs to the last candle. An empty vector means "not enough history".
pub trait Indicator {
    fn calculate(&self, candles: &[Candle]) -> Vec<f64>;

    fn last(&self, candles: &[Candle]) -> Option<f64> {
        self.calculate(candles).last().copied()
    }
}

pub fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}

pub struct SMA {
    pub period: usize,
}

impl SMA {
    pub fn new(period: usize) -> Self {
        SMA { period }
    }

    pub fn calculate_on_values(&self, values: &[f64]) -> Vec<f64> {
        if self.period == 0 || values.len() < self.period {
            return vec![];
        }
        values
            .windows(self.period)
            .map(|w| w.iter().sum::<f64>() / self.period as f64)
            .collect()
    }
}

impl Indicator for SMA {
    fn calculate(&self, candles: &[Candle]) -> Vec<f64> {
        self.calculate_on_values(&closes(candles))
    }
}

pub struct EMA {
    pub period: usize,
}

impl EMA {
    pub fn new(period: usize) -> Self {
        EMA { period }
    }

    pub fn calculate_on_values(&self, values: &[f64]) -> Vec<f64> {
        if self.period == 0 || values.len() < self.period {
            return vec![];
        }
        let multiplier = 2.0 / (self.period as f64 + 1.0);
        let mut ema_values = Vec::with_capacity(values.len() - self.period + 1);

        // Seeded with the SMA of the first period
        let mut ema = values[..self.period].iter().sum::<f64>() / self.period as f64;
        ema_values.push(ema);

        for &val in &values[self.period..] {
            ema = (val - ema) * multiplier + ema;
            ema_values.push(ema);
        }

        ema_values
    }
}

impl Indicator for EMA {
    fn calculate(&self, candles: &[Candle]) -> Vec<f64> {
        self.calculate_on_values(&closes(candles))
    }
}

/// Relative strength index with simple rolling averages of gains and losses.
pub struct RSI {
    pub period: usize,
}

impl RSI {
    pub fn new(period: usize) -> Self {
        RSI { period }
    }

    pub fn calculate_on_values(&self, values: &[f64]) -> Vec<f64> {
        if self.period == 0 || values.len() < self.period + 1 {
            return vec![];
        }
        let mut gains = Vec::with_capacity(values.len() - 1);
        let mut losses = Vec::with_capacity(values.len() - 1);

        for pair in values.windows(2) {
            let change = pair[1] - pair[0];
            if change > 0.0 {
                gains.push(change);
                losses.push(0.0);
            } else {
                gains.push(0.0);
                losses.push(-change);
            }
        }

        gains
            .windows(self.period)
            .zip(losses.windows(self.period))
            .map(|(g, l)| {
                let avg_gain = g.iter().sum::<f64>() / self.period as f64;
                let avg_loss = l.iter().sum::<f64>() / self.period as f64;
                rsi_from_averages(avg_gain, avg_loss)
            })
            .collect()
    }
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss <= 0.0 {
        // no losses: 100 when rising, neutral when nothing moved
        return if avg_gain > 0.0 { 100.0 } else { 50.0 };
    }
    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

impl Indicator for RSI {
    fn calculate(&self, candles: &[Candle]) -> Vec<f64> {
        self.calculate_on_values(&closes(candles))
    }
}

/// Average true range with Wilder smoothing.
pub struct ATR {
    pub period: usize,
}

impl ATR {
    pub fn new(period: usize) -> Self {
        ATR { period }
    }
}

impl Indicator for ATR {
    fn calculate(&self, candles: &[Candle]) -> Vec<f64> {
        if self.period == 0 || candles.len() < self.period + 1 {
            return vec![];
        }
        let true_ranges: Vec<f64> = candles
            .windows(2)
            .map(|pair| pair[1].true_range(Some(pair[0].close)))
            .collect();

        let p = self.period as f64;
        let mut atr = true_ranges[..self.period].iter().sum::<f64>() / p;
        let mut values = Vec::with_capacity(true_ranges.len() - self.period + 1);
        values.push(atr);
        for &tr in &true_ranges[self.period..] {
            atr = (atr * (p - 1.0) + tr) / p;
            values.push(atr);
        }
        values
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MacdValues {
    pub line: Vec<f64>,
    pub signal: Vec<f64>,
    pub histogram: Vec<f64>,
}

pub struct MACD {
    pub fast_period: usize,
    pub slow_period: usize,
    pub signal_period: usize,
}

impl MACD {
    pub fn new(fast_period: usize, slow_period: usize, signal_period: usize) -> Self {
        MACD {
            fast_period,
            slow_period,
            signal_period,
        }
    }

    pub fn calculate_detailed(&self, candles: &[Candle]) -> MacdValues {
        let empty = MacdValues {
            line: vec![],
            signal: vec![],
            histogram: vec![],
        };
        if self.fast_period >= self.slow_period {
            return empty;
        }
        let values = closes(candles);
        let fast = EMA::new(self.fast_period).calculate_on_values(&values);
        let slow = EMA::new(self.slow_period).calculate_on_values(&values);
        if slow.is_empty() {
            return empty;
        }

        let offset = fast.len() - slow.len();
        let line: Vec<f64> = slow
            .iter()
            .enumerate()
            .map(|(i, s)| fast[i + offset] - s)
            .collect();

        let signal = EMA::new(self.signal_period).calculate_on_values(&line);
        if signal.is_empty() {
            return empty;
        }
        let offset = line.len() - signal.len();
        let histogram = signal
            .iter()
            .enumerate()
            .map(|(i, s)| line[i + offset] - s)
            .collect();

        MacdValues {
            line,
            signal,
            histogram,
        }
    }
}

impl Indicator for MACD {
    /// Histogram series.
    fn calculate(&self, candles: &[Candle]) -> Vec<f64> {
        self.calculate_detailed(candles).histogram
    }
}

/// Average directional index (Wilder).
pub struct ADX {
    pub period: usize,
}

impl ADX {
    pub fn new(period: usize) -> Self {
        ADX { period }
    }
}

fn directional_index(plus: f64, minus: f64, tr: f64) -> f64 {
    if tr <= 0.0 {
        return 0.0;
    }
    let plus_di = 100.0 * plus / tr;
    let minus_di = 100.0 * minus / tr;
    let sum = plus_di + minus_di;
    if sum <= 0.0 {
        0.0
    } else {
        100.0 * (plus_di - minus_di).abs() / sum
    }
}

impl Indicator for ADX {
    fn calculate(&self, candles: &[Candle]) -> Vec<f64> {
        let p = self.period;
        if p == 0 || candles.len() < 2 * p {
            return vec![];
        }

        let mut tr = Vec::with_capacity(candles.len() - 1);
        let mut plus_dm = Vec::with_capacity(candles.len() - 1);
        let mut minus_dm = Vec::with_capacity(candles.len() - 1);
        for pair in candles.windows(2) {
            let (prev, cur) = (&pair[0], &pair[1]);
            let up = cur.high - prev.high;
            let down = prev.low - cur.low;
            plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
            minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });
            tr.push(cur.true_range(Some(prev.close)));
        }

        let pf = p as f64;
        let mut tr_s: f64 = tr[..p].iter().sum();
        let mut plus_s: f64 = plus_dm[..p].iter().sum();
        let mut minus_s: f64 = minus_dm[..p].iter().sum();
        let mut dx = vec![directional_index(plus_s, minus_s, tr_s)];
        for i in p..tr.len() {
            tr_s = tr_s - tr_s / pf + tr[i];
            plus_s = plus_s - plus_s / pf + plus_dm[i];
            minus_s = minus_s - minus_s / pf + minus_dm[i];
            dx.push(directional_index(plus_s, minus_s, tr_s));
        }

        if dx.len() < p {
            return vec![];
        }
        let mut adx = dx[..p].iter().sum::<f64>() / pf;
        let mut values = vec![adx];
        for &v in &dx[p..] {
            adx = (adx * (pf - 1.0) + v) / pf;
            values.push(adx);
        }
        values
    }
}

#[derive(Debug, Clone)]
pub struct BollingerBandsValues {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
}

pub struct BollingerBands {
    pub period: usize,
    pub std_dev: f64,
}

impl BollingerBands {
    pub fn new(period: usize, std_dev: f64) -> Self {
        BollingerBands { period, std_dev }
    }

    pub fn calculate_detailed(&self, candles: &[Candle]) -> BollingerBandsValues {
        let mut upper = Vec::new();
        let mut middle = Vec::new();
        let mut lower = Vec::new();
        if self.period == 0 || candles.len() < self.period {
            return BollingerBandsValues {
                upper,
                middle,
                lower,
            };
        }

        for window in candles.windows(self.period) {
            let sma = window.iter().map(|c| c.close).sum::<f64>() / self.period as f64;
            let variance = window
                .iter()
                .map(|c| (c.close - sma).powi(2))
                .sum::<f64>()
                / self.period as f64;
            let std = variance.sqrt();

            upper.push(sma + self.std_dev * std);
            middle.push(sma);
            lower.push(sma - self.std_dev * std);
        }

        BollingerBandsValues {
            upper,
            middle,
            lower,
        }
    }
}

impl Indicator for BollingerBands {
    /// Middle band.
    fn calculate(&self, candles: &[Candle]) -> Vec<f64> {
        self.calculate_detailed(candles).middle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::candle::Timeframe;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone, Utc};

    fn series(closes: &[f64]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                Candle::new(
                    "EUR_USD",
                    Timeframe::M5,
                    start + Duration::minutes(5 * i as i64),
                    c,
                    c + 0.0002,
                    c - 0.0002,
                    c,
                    100.0,
                )
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_rsi_is_100_without_losses() {
        let closes: Vec<f64> = (0..20).map(|i| 1.1 + i as f64 * 0.001).collect();
        let values = RSI::new(14).calculate(&series(&closes));
        assert!(!values.is_empty());
        for v in values {
            assert_eq!(v, 100.0);
        }
    }

    #[test]
    fn test_rsi_flat_series_is_neutral() {
        let values = RSI::new(14).calculate(&series(&[1.2; 20]));
        assert_eq!(values.last().copied(), Some(50.0));
    }

    #[test]
    fn test_rsi_needs_period_plus_one() {
        let closes: Vec<f64> = (0..14).map(|i| 1.0 + i as f64 * 0.01).collect();
        assert!(RSI::new(14).calculate(&series(&closes)).is_empty());
    }

    #[test]
    fn test_rsi_mixed_moves() {
        // two gains of 2 and two losses of 1 -> rs = 2 -> rsi = 66.67
        let values = RSI::new(4).calculate_on_values(&[10.0, 12.0, 11.0, 13.0, 12.0]);
        assert_eq!(values.len(), 1);
        assert_relative_eq!(values[0], 100.0 - 100.0 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn test_sma_and_ema_alignment() {
        let closes = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(SMA::new(3).calculate_on_values(&closes), vec![2.0, 3.0, 4.0]);

        let ema = EMA::new(3).calculate_on_values(&closes);
        assert_eq!(ema.len(), 3);
        assert_relative_eq!(ema[0], 2.0);
        assert_relative_eq!(ema[1], 3.0);
        assert_relative_eq!(ema[2], 4.0);
        assert!(EMA::new(6).calculate_on_values(&closes).is_empty());
    }

    #[test]
    fn test_atr_on_constant_ranges() {
        let candles = series(&[1.1; 30]);
        let atr = ATR::new(14).calculate(&candles);
        assert_eq!(atr.len(), 30 - 14);
        assert_relative_eq!(*atr.last().unwrap(), 0.0004, epsilon = 1e-12);
    }

    #[test]
    fn test_macd_positive_in_uptrend() {
        let closes: Vec<f64> = (0..60).map(|i| 1.1 + i as f64 * 0.0005).collect();
        let macd = MACD::new(12, 26, 9).calculate_detailed(&series(&closes));
        assert_eq!(macd.line.len(), 60 - 26 + 1);
        assert_eq!(macd.signal.len(), macd.line.len() - 8);
        assert_eq!(macd.histogram.len(), macd.signal.len());
        assert!(*macd.line.last().unwrap() > 0.0);
    }

    #[test]
    fn test_macd_not_ready_on_short_window() {
        let closes: Vec<f64> = (0..30).map(|i| 1.1 + i as f64 * 0.0005).collect();
        assert!(MACD::new(12, 26, 9).calculate(&series(&closes)).is_empty());
    }

    #[test]
    fn test_adx_reads_strong_trend() {
        let closes: Vec<f64> = (0..60).map(|i| 1.1 + i as f64 * 0.0005).collect();
        let adx = ADX::new(14).calculate(&series(&closes));
        assert!(!adx.is_empty());
        assert!(*adx.last().unwrap() > 25.0);
        assert!(ADX::new(14).calculate(&series(&closes[..27])).is_empty());
    }

    #[test]
    fn test_bollinger_collapses_on_flat_series() {
        let bands = BollingerBands::new(20, 2.0).calculate_detailed(&series(&[1.3; 25]));
        assert_eq!(bands.middle.len(), 6);
        assert_relative_eq!(bands.upper[0], 1.3, epsilon = 1e-12);
        assert_relative_eq!(bands.lower[0], 1.3, epsilon = 1e-12);
    }
}
