use crate::domain::entities::candle::{Candle, Timeframe};
use crate::domain::errors::DataError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Pull interface for OHLCV history. Results are ordered oldest first.
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Up to `n` most recent candles.
    async fn latest(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        n: usize,
    ) -> Result<Vec<Candle>, DataError>;

    /// Candles with `start <= timestamp <= end`.
    async fn range(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, DataError>;
}

/// Remote origin of candles behind a cache.
#[async_trait]
pub trait CandleProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Up to `count` complete candles, oldest first. When `after` is given
    /// only candles strictly newer than it are returned.
    async fn fetch(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        count: usize,
        after: Option<&Candle>,
    ) -> Result<Vec<Candle>, DataError>;

    /// Complete candles with `start <= timestamp <= end`, oldest first.
    async fn fetch_range(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, DataError>;
}
