use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures raised while reading candles.
///
/// These never stop a session: the engine reports them as a blocked
/// `data` stage and waits for the next tick.
#[derive(Debug, Error, Clone)]
pub enum DataError {
    #[error("No candles available for {instrument} {timeframe}")]
    NoData {
        instrument: String,
        timeframe: String,
    },

    #[error("Candle provider request failed: {0}")]
    ProviderFailed(String),

    #[error("Failed to parse candle payload: {0}")]
    ParseError(String),

    #[error("Candle store error: {0}")]
    StoreError(String),
}

/// Failures of the broker capability set.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", content = "message")]
pub enum BrokerError {
    #[error("Unknown position: {0}")]
    UnknownPosition(String),

    #[error("Position already closed: {0}")]
    AlreadyClosed(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("No mark price for {0}")]
    NoMarkPrice(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Remote rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Remote temporarily unavailable (status {status}) after {attempts} attempts")]
    Unavailable { status: u16, attempts: u32 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),

    #[error("Journal write failed: {0}")]
    Journal(String),
}

impl BrokerError {
    /// Whether a failed remote call may be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            BrokerError::Rejected { status, .. } => *status == 429 || *status >= 500,
            BrokerError::Unavailable { .. } | BrokerError::Transport(_) => true,
            _ => false,
        }
    }
}

/// Rejections raised before a session is created.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("Invalid instrument: {0}")]
    InvalidInstrument(String),

    #[error("Invalid timeframe: {0}")]
    InvalidTimeframe(String),

    #[error("Invalid run mode: {0}")]
    InvalidMode(String),

    #[error("Run mode {mode} cannot be served by the {broker} broker")]
    ModeMismatch { mode: String, broker: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Missing credential: {0}")]
    MissingCredential(String),
}

/// Errors returned by the engine control surface.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration rejected: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker failure: {0}")]
    Broker(#[from] BrokerError),

    #[error("Candle data failure: {0}")]
    Data(#[from] DataError),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Engine is not running")]
    NotRunning,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal failure: {0}")]
    Internal(String),
}

impl From<crate::persistence::DatabaseError> for EngineError {
    fn from(e: crate::persistence::DatabaseError) -> Self {
        EngineError::Storage(e.to_string())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid candle: {0}")]
    InvalidCandle(String),

    #[error("Value must be finite")]
    MustBeFinite,
}

impl From<ValidationError> for String {
    fn from(error: ValidationError) -> Self {
        error.to_string()
    }
}
