//! Broker capability set
//!
//! The engine and the control surface talk to every execution venue through
//! this trait. Two implementations exist: the in-process paper broker and the
//! OANDA REST broker. The concrete one is chosen once at startup by
//! `infrastructure::broker_factory::create_broker`.

use crate::domain::entities::account::Account;
use crate::domain::entities::order::OrderIntent;
use crate::domain::entities::position::{ExitReason, Position};
use crate::domain::errors::{BrokerError, ConfigError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// Common result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    Paper,
    Oanda,
}

impl BrokerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerKind::Paper => "paper",
            BrokerKind::Oanda => "oanda",
        }
    }
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrokerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "paper" => Ok(BrokerKind::Paper),
            "oanda" | "remote" => Ok(BrokerKind::Oanda),
            other => Err(ConfigError::InvalidValue {
                field: "broker".to_string(),
                reason: format!("unknown broker kind {}", other),
            }),
        }
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    fn kind(&self) -> BrokerKind;

    /// Execute a market order and return the opened position.
    async fn place_order(&self, intent: &OrderIntent) -> BrokerResult<Position>;

    /// Revalue open positions of `instrument` at `price`.
    ///
    /// Only unrealized PnL and equity change; the balance does not. Returns
    /// the positions the venue closed on its own side since the last call
    /// (e.g. a remote stop-loss), already sealed locally.
    async fn refresh_mark_to_market(
        &self,
        instrument: &str,
        price: f64,
        at: DateTime<Utc>,
    ) -> BrokerResult<Vec<Position>>;

    /// Close an open position at the latest mark.
    ///
    /// Closing twice fails with `BrokerError::AlreadyClosed`.
    async fn close_position(&self, position_id: &str, reason: ExitReason) -> BrokerResult<Position>;

    async fn list_open_positions(&self, run_id: &str) -> BrokerResult<Vec<Position>>;

    /// Every open position, including those left behind by earlier runs.
    async fn list_all_open_positions(&self) -> BrokerResult<Vec<Position>>;

    async fn account_summary(&self) -> BrokerResult<Account>;

    async fn is_healthy(&self) -> bool {
        true
    }
}
