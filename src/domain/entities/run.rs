use crate::domain::entities::candle::Timeframe;
use crate::domain::errors::ConfigError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Paper,
    Live,
    Backtest,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Paper => "paper",
            RunMode::Live => "live",
            RunMode::Backtest => "backtest",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "paper" => Ok(RunMode::Paper),
            "live" => Ok(RunMode::Live),
            "backtest" => Ok(RunMode::Backtest),
            _ => Err(ConfigError::InvalidMode(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Stopped,
    Completed,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Stopped => "stopped",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "stopped" => Ok(RunStatus::Stopped),
            "completed" => Ok(RunStatus::Completed),
            "error" => Ok(RunStatus::Error),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// One trading session, created on start and sealed on stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub instrument: String,
    pub timeframe: Timeframe,
    pub mode: RunMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn start(instrument: &str, timeframe: Timeframe, mode: RunMode) -> Self {
        Run {
            id: uuid::Uuid::new_v4().simple().to_string(),
            instrument: instrument.to_string(),
            timeframe,
            mode,
            status: RunStatus::Running,
            started_at: Utc::now(),
            stopped_at: None,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.status != RunStatus::Running
    }

    /// Marks the run finished. A sealed run keeps its first outcome.
    pub fn seal(&mut self, status: RunStatus) {
        if self.is_sealed() {
            return;
        }
        self.status = status;
        self.stopped_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
}
