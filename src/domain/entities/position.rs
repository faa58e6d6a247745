use crate::domain::entities::signal::Direction;
use crate::domain::errors::BrokerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    SignalFlip,
    Manual,
    EndOfData,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::SignalFlip => "signal_flip",
            ExitReason::Manual => "manual",
            ExitReason::EndOfData => "end_of_data",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExitReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop_loss" => Ok(ExitReason::StopLoss),
            "take_profit" => Ok(ExitReason::TakeProfit),
            "signal_flip" => Ok(ExitReason::SignalFlip),
            "manual" => Ok(ExitReason::Manual),
            "end_of_data" => Ok(ExitReason::EndOfData),
            other => Err(format!("unknown exit reason: {}", other)),
        }
    }
}

/// Broker-owned record of one round-trip trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub run_id: String,
    pub order_id: String,
    pub instrument: String,
    pub side: Direction,
    pub entry_price: f64,
    /// Unit magnitude; direction lives in `side`.
    pub units: i64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub status: PositionStatus,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<ExitReason>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub risk_fraction: f64,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn pnl_at(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.side.sign() * self.units as f64
    }

    /// Updates unrealized PnL only; closed positions are left untouched.
    pub fn mark(&mut self, price: f64) {
        if self.is_open() {
            self.unrealized_pnl = self.pnl_at(price);
        }
    }

    pub fn stop_crossed(&self, price: f64) -> bool {
        match (self.stop_loss, self.side) {
            (Some(stop), Direction::Long) => price <= stop,
            (Some(stop), Direction::Short) => price >= stop,
            _ => false,
        }
    }

    pub fn target_crossed(&self, price: f64) -> bool {
        match (self.take_profit, self.side) {
            (Some(target), Direction::Long) => price >= target,
            (Some(target), Direction::Short) => price <= target,
            _ => false,
        }
    }

    /// Seals the position. Realized PnL is fixed here and never recomputed.
    pub fn close(
        &mut self,
        exit_price: f64,
        at: DateTime<Utc>,
        reason: ExitReason,
    ) -> Result<f64, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::AlreadyClosed(self.id.clone()));
        }
        let realized = (exit_price - self.entry_price) * self.side.sign() * self.units as f64;
        self.status = PositionStatus::Closed;
        self.exit_price = Some(exit_price);
        self.exit_reason = Some(reason);
        self.closed_at = Some(at);
        self.realized_pnl = realized;
        self.unrealized_pnl = 0.0;
        Ok(realized)
    }
}
