use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    Flat,
}

impl Direction {
    /// +1 for long, -1 for short, 0 for flat.
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
            Direction::Flat => 0.0,
        }
    }

    pub fn opposes(&self, other: Direction) -> bool {
        matches!(
            (self, other),
            (Direction::Long, Direction::Short) | (Direction::Short, Direction::Long)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
            Direction::Flat => "flat",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "long" | "buy" => Ok(Direction::Long),
            "short" | "sell" => Ok(Direction::Short),
            "flat" | "hold" => Ok(Direction::Flat),
            other => Err(format!("unknown direction: {}", other)),
        }
    }
}

/// Market behaviour classification attached by regime-aware strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Trending,
    Ranging,
}

/// Directional output of a strategy for one candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub direction: Direction,
    pub confidence: f64,
    pub reason: String,
    pub entry_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub regime: Option<Regime>,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn new(
        direction: Direction,
        confidence: f64,
        reason: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Signal {
            direction,
            confidence: clamp_confidence(confidence),
            reason: reason.into(),
            entry_price: None,
            stop_loss: None,
            take_profit: None,
            regime: None,
            timestamp,
        }
    }

    pub fn flat(reason: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Signal::new(Direction::Flat, 0.0, reason, timestamp)
    }

    /// Normalizes a manual override into a regular signal.
    pub fn forced(direction: Direction, confidence: f64, timestamp: DateTime<Utc>) -> Self {
        Signal::new(direction, confidence, "forced", timestamp)
    }

    pub fn with_entry(mut self, price: f64) -> Self {
        self.entry_price = Some(price);
        self
    }

    pub fn with_stops(mut self, stop_loss: Option<f64>, take_profit: Option<f64>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    pub fn with_regime(mut self, regime: Regime) -> Self {
        self.regime = Some(regime);
        self
    }

    pub fn is_actionable(&self, min_confidence: f64) -> bool {
        self.direction != Direction::Flat && self.confidence >= min_confidence
    }
}

fn clamp_confidence(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
