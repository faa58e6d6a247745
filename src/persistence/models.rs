//! Database Models
//!
//! Row shapes for runs, candles, orders and positions, plus conversions to
//! the domain entities.

use super::DatabaseError;
use crate::domain::entities::candle::{Candle, Timeframe};
use crate::domain::entities::position::{Position, PositionStatus};
use crate::domain::entities::run::{Run, RunMode, RunStatus};
use crate::domain::entities::signal::Direction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Run record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunRecord {
    pub id: String,
    pub instrument: String,
    pub timeframe: String,
    pub mode: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl TryFrom<RunRecord> for Run {
    type Error = DatabaseError;

    fn try_from(record: RunRecord) -> Result<Self, Self::Error> {
        let timeframe = record
            .timeframe
            .parse::<Timeframe>()
            .map_err(|e| DatabaseError::DecodeError(e.to_string()))?;
        let mode = record
            .mode
            .parse::<RunMode>()
            .map_err(|e| DatabaseError::DecodeError(e.to_string()))?;
        let status = record
            .status
            .parse::<RunStatus>()
            .map_err(DatabaseError::DecodeError)?;
        Ok(Run {
            id: record.id,
            instrument: record.instrument,
            timeframe,
            mode,
            status,
            started_at: record.started_at,
            stopped_at: record.stopped_at,
        })
    }
}

/// Candle record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CandleRecord {
    pub instrument: String,
    pub timeframe: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl TryFrom<CandleRecord> for Candle {
    type Error = DatabaseError;

    fn try_from(record: CandleRecord) -> Result<Self, Self::Error> {
        let timeframe = record
            .timeframe
            .parse::<Timeframe>()
            .map_err(|e| DatabaseError::DecodeError(e.to_string()))?;
        Ok(Candle {
            instrument: record.instrument,
            timeframe,
            timestamp: record.timestamp,
            open: record.open,
            high: record.high,
            low: record.low,
            close: record.close,
            volume: record.volume,
        })
    }
}

/// Order record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderRecord {
    pub id: String,
    pub run_id: String,
    pub position_id: Option<String>,
    pub broker: String,
    pub instrument: String,
    pub side: String, // "long" or "short"
    pub units: i64,   // signed
    pub price: f64,
    pub fill_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub reason_codes: String, // JSON array
    pub risk_fraction: f64,
    pub submitted_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl OrderRecord {
    pub fn reason_codes(&self) -> Vec<String> {
        serde_json::from_str(&self.reason_codes).unwrap_or_default()
    }
}

/// Position record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PositionRecord {
    pub id: String,
    pub run_id: String,
    pub order_id: String,
    pub instrument: String,
    pub side: String,
    pub entry_price: f64,
    pub units: i64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub status: String, // "open" or "closed"
    pub exit_price: Option<f64>,
    pub exit_reason: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub risk_fraction: f64,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<PositionRecord> for Position {
    type Error = DatabaseError;

    fn try_from(record: PositionRecord) -> Result<Self, Self::Error> {
        let side = record
            .side
            .parse::<Direction>()
            .map_err(DatabaseError::DecodeError)?;
        let status = match record.status.as_str() {
            "open" => PositionStatus::Open,
            "closed" => PositionStatus::Closed,
            other => {
                return Err(DatabaseError::DecodeError(format!(
                    "unknown position status: {}",
                    other
                )))
            }
        };
        let exit_reason = record
            .exit_reason
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(DatabaseError::DecodeError)?;
        Ok(Position {
            id: record.id,
            run_id: record.run_id,
            order_id: record.order_id,
            instrument: record.instrument,
            side,
            entry_price: record.entry_price,
            units: record.units,
            stop_loss: record.stop_loss,
            take_profit: record.take_profit,
            status,
            exit_price: record.exit_price,
            exit_reason,
            opened_at: record.opened_at,
            closed_at: record.closed_at,
            realized_pnl: record.realized_pnl,
            unrealized_pnl: record.unrealized_pnl,
            risk_fraction: record.risk_fraction,
        })
    }
}

/// Create order input
#[derive(Debug, Clone)]
pub struct CreateOrder {
    pub id: String,
    pub run_id: String,
    pub position_id: Option<String>,
    pub broker: String,
    pub instrument: String,
    pub side: Direction,
    pub units: i64,
    pub price: f64,
    pub fill_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub reason_codes: Vec<String>,
    pub risk_fraction: f64,
    pub submitted_at: DateTime<Utc>,
}
