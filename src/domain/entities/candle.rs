use crate::domain::errors::{ConfigError, ValidationError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bar granularity supported by the data layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D,
}

impl Timeframe {
    pub fn seconds(&self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1_800,
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::D => 86_400,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.seconds())
    }

    /// Number of bars in a 24h trading day.
    pub fn bars_per_day(&self) -> f64 {
        86_400.0 / self.seconds() as f64
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::M30 => "M30",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D => "D",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "M1" => Ok(Timeframe::M1),
            "M5" => Ok(Timeframe::M5),
            "M15" => Ok(Timeframe::M15),
            "M30" => Ok(Timeframe::M30),
            "H1" => Ok(Timeframe::H1),
            "H4" => Ok(Timeframe::H4),
            "D" | "D1" => Ok(Timeframe::D),
            _ => Err(ConfigError::InvalidTimeframe(s.to_string())),
        }
    }
}

/// Checks the `BASE_QUOTE` instrument format, e.g. `EUR_USD`.
pub fn validate_instrument(instrument: &str) -> Result<(), ConfigError> {
    let mut parts = instrument.split('_');
    let valid = match (parts.next(), parts.next(), parts.next()) {
        (Some(base), Some(quote), None) => {
            let is_code = |code: &str| code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase());
            is_code(base) && is_code(quote) && base != quote
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidInstrument(instrument.to_string()))
    }
}

/// OHLCV bar keyed by `(instrument, timeframe, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub instrument: String,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instrument: &str,
        timeframe: Timeframe,
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, ValidationError> {
        for value in [open, high, low, close] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ValidationError::InvalidPrice(format!(
                    "{} at {}: {}",
                    instrument, timestamp, value
                )));
            }
        }
        if high < open.max(close) || low > open.min(close) {
            return Err(ValidationError::InvalidCandle(format!(
                "{} at {}: high/low do not bracket open/close",
                instrument, timestamp
            )));
        }
        if !volume.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        if volume < 0.0 {
            return Err(ValidationError::InvalidCandle(format!(
                "{} at {}: volume {}",
                instrument, timestamp, volume
            )));
        }

        Ok(Candle {
            instrument: instrument.to_string(),
            timeframe,
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        })
    }

    /// Largest of the three true-range legs against the previous close.
    pub fn true_range(&self, previous_close: Option<f64>) -> f64 {
        let span = self.high - self.low;
        match previous_close {
            Some(prev) => span
                .max((self.high - prev).abs())
                .max((self.low - prev).abs()),
            None => span,
        }
    }
}
