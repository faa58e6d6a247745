//! Candle sources: the SQLite-backed cache in front of a remote provider,
//! a replay source for dry runs, and a seeded synthetic generator.

use crate::domain::entities::candle::{Candle, Timeframe};
use crate::domain::errors::DataError;
use crate::domain::repositories::candle_source::{CandleProvider, CandleSource};
use crate::persistence::repository::CandleRepository;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const MAX_SYNTHETIC_BARS: i64 = 50_000;

/// Seeded random walk producing valid OHLCV bars on a fixed time grid.
pub struct SyntheticCandles {
    instrument: String,
    timeframe: Timeframe,
    rng: StdRng,
    next_timestamp: DateTime<Utc>,
    price: f64,
    drift: f64,
    volatility: f64,
}

impl SyntheticCandles {
    pub fn new(instrument: &str, timeframe: Timeframe, seed: u64) -> Self {
        SyntheticCandles {
            instrument: instrument.to_string(),
            timeframe,
            rng: StdRng::seed_from_u64(seed),
            next_timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default(),
            price: 1.10,
            drift: 0.0,
            volatility: 0.0005,
        }
    }

    pub fn starting_at(mut self, start: DateTime<Utc>) -> Self {
        self.next_timestamp = start;
        self
    }

    pub fn with_price(mut self, price: f64) -> Self {
        if price.is_finite() && price > 0.0 {
            self.price = price;
        }
        self
    }

    /// Relative move added to every bar, e.g. `0.0005` for a steady climb.
    pub fn with_drift(mut self, drift: f64) -> Self {
        self.drift = drift;
        self
    }

    /// Half-width of the uniform per-bar noise, relative to price.
    pub fn with_volatility(mut self, volatility: f64) -> Self {
        self.volatility = volatility.abs();
        self
    }

    pub fn next_candle(&mut self) -> Candle {
        let open = self.price;
        let shock: f64 = self.rng.gen_range(-1.0..1.0);
        let close = (open * (1.0 + self.drift + self.volatility * shock)).max(1e-6);
        let upper: f64 = self.rng.gen();
        let lower: f64 = self.rng.gen();
        let high = open.max(close) * (1.0 + self.volatility * 0.5 * upper);
        let low = (open.min(close) * (1.0 - self.volatility * 0.5 * lower)).max(1e-7);
        let volume = (100.0 + 900.0 * self.rng.gen::<f64>()).round();

        let candle = Candle {
            instrument: self.instrument.clone(),
            timeframe: self.timeframe,
            timestamp: self.next_timestamp,
            open,
            high,
            low,
            close,
            volume,
        };
        self.price = close;
        self.next_timestamp += self.timeframe.duration();
        candle
    }

    pub fn generate(&mut self, n: usize) -> Vec<Candle> {
        (0..n).map(|_| self.next_candle()).collect()
    }
}

fn align_down(at: DateTime<Utc>, timeframe: Timeframe) -> Result<DateTime<Utc>, DataError> {
    let secs = timeframe.seconds();
    Utc.timestamp_opt(at.timestamp().div_euclid(secs) * secs, 0)
        .single()
        .ok_or_else(|| DataError::ProviderFailed(format!("timestamp out of range: {}", at)))
}

/// Open time of the newest bar that has already closed.
fn last_complete_bar(timeframe: Timeframe) -> Result<DateTime<Utc>, DataError> {
    Ok(align_down(Utc::now(), timeframe)? - timeframe.duration())
}

/// Offline stand-in for a market data provider.
///
/// Bars are generated on demand for the requested interval; continuing
/// from a cached bar keeps the walk connected to its last close.
pub struct SyntheticProvider {
    seed: u64,
    base_price: f64,
    volatility: f64,
}

impl SyntheticProvider {
    pub fn new(seed: u64) -> Self {
        SyntheticProvider {
            seed,
            base_price: 1.10,
            volatility: 0.0005,
        }
    }

    fn walk(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        price: f64,
        bars: i64,
    ) -> Vec<Candle> {
        let seed = self.seed ^ start.timestamp() as u64;
        SyntheticCandles::new(instrument, timeframe, seed)
            .starting_at(start)
            .with_price(price)
            .with_volatility(self.volatility)
            .generate(bars.clamp(0, MAX_SYNTHETIC_BARS) as usize)
    }
}

#[async_trait]
impl CandleProvider for SyntheticProvider {
    fn name(&self) -> &str {
        "synthetic"
    }

    async fn fetch(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        count: usize,
        after: Option<&Candle>,
    ) -> Result<Vec<Candle>, DataError> {
        let last = last_complete_bar(timeframe)?;
        let step = timeframe.duration();
        let earliest = last - step * (count.max(1) as i32 - 1);
        let start = match after {
            Some(candle) => (candle.timestamp + step).max(earliest),
            None => earliest,
        };
        if start > last {
            return Ok(Vec::new());
        }
        let bars = (last - start).num_seconds() / timeframe.seconds() + 1;
        let price = after.map(|c| c.close).unwrap_or(self.base_price);
        Ok(self.walk(instrument, timeframe, start, price, bars))
    }

    async fn fetch_range(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, DataError> {
        let mut first = align_down(start, timeframe)?;
        if first < start {
            first += timeframe.duration();
        }
        let end = end.min(last_complete_bar(timeframe)?);
        if first > end {
            return Ok(Vec::new());
        }
        let bars = (end - first).num_seconds() / timeframe.seconds() + 1;
        Ok(self.walk(instrument, timeframe, first, self.base_price, bars))
    }
}

/// Serves a fixed candle sequence, revealing one more bar per `latest` call.
pub struct ReplayCandleSource {
    candles: Vec<Candle>,
    revealed: AtomicUsize,
}

impl ReplayCandleSource {
    pub fn new(candles: Vec<Candle>) -> Self {
        ReplayCandleSource {
            candles,
            revealed: AtomicUsize::new(0),
        }
    }

    /// Makes the first `n` bars visible before the first call.
    pub fn with_revealed(self, n: usize) -> Self {
        self.revealed.store(n.min(self.candles.len()), Ordering::SeqCst);
        self
    }

    pub fn revealed(&self) -> usize {
        self.revealed.load(Ordering::SeqCst)
    }

    pub fn is_exhausted(&self) -> bool {
        self.revealed() >= self.candles.len()
    }

    fn matches(&self, instrument: &str, timeframe: Timeframe) -> bool {
        self.candles
            .first()
            .map_or(false, |c| c.instrument == instrument && c.timeframe == timeframe)
    }

    fn no_data(instrument: &str, timeframe: Timeframe) -> DataError {
        DataError::NoData {
            instrument: instrument.to_string(),
            timeframe: timeframe.to_string(),
        }
    }
}

#[async_trait]
impl CandleSource for ReplayCandleSource {
    async fn latest(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        n: usize,
    ) -> Result<Vec<Candle>, DataError> {
        if !self.matches(instrument, timeframe) {
            return Err(Self::no_data(instrument, timeframe));
        }
        let len = self.candles.len();
        let visible = match self
            .revealed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| (r < len).then_some(r + 1))
        {
            Ok(previous) => previous + 1,
            Err(current) => current,
        };
        let start = visible.saturating_sub(n);
        Ok(self.candles[start..visible].to_vec())
    }

    async fn range(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, DataError> {
        if !self.matches(instrument, timeframe) {
            return Err(Self::no_data(instrument, timeframe));
        }
        Ok(self
            .candles
            .iter()
            .filter(|c| c.timestamp >= start && c.timestamp <= end)
            .cloned()
            .collect())
    }
}

/// Candle cache backed by SQLite with an optional remote provider.
///
/// The provider is asked only when the freshest cached bar closed more than
/// one interval ago. Provider failures are logged and cached data is served.
pub struct CachedCandleSource {
    repo: CandleRepository,
    provider: Option<Arc<dyn CandleProvider>>,
}

impl CachedCandleSource {
    pub fn new(repo: CandleRepository, provider: Option<Arc<dyn CandleProvider>>) -> Self {
        CachedCandleSource { repo, provider }
    }

    fn is_stale(newest: Option<&Candle>, timeframe: Timeframe, now: DateTime<Utc>) -> bool {
        match newest {
            Some(candle) => now - (candle.timestamp + timeframe.duration()) >= timeframe.duration(),
            None => true,
        }
    }

    async fn store(&self, provider: &dyn CandleProvider, fetched: Result<Vec<Candle>, DataError>) {
        match fetched {
            Ok(candles) if !candles.is_empty() => match self.repo.upsert_batch(&candles).await {
                Ok(count) => debug!("Cached {} candles from {}", count, provider.name()),
                Err(e) => warn!("Failed to cache candles from {}: {}", provider.name(), e),
            },
            Ok(_) => debug!("{} returned no new candles", provider.name()),
            Err(e) => warn!("Candle provider {} failed: {}", provider.name(), e),
        }
    }
}

fn store_error(e: crate::persistence::DatabaseError) -> DataError {
    DataError::StoreError(e.to_string())
}

#[async_trait]
impl CandleSource for CachedCandleSource {
    async fn latest(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        n: usize,
    ) -> Result<Vec<Candle>, DataError> {
        if let Some(provider) = &self.provider {
            let newest = self
                .repo
                .latest(instrument, timeframe, 1)
                .await
                .map_err(store_error)?;
            if Self::is_stale(newest.last(), timeframe, Utc::now()) {
                let fetched = provider
                    .fetch(instrument, timeframe, n.max(1), newest.last())
                    .await;
                self.store(provider.as_ref(), fetched).await;
            }
        }

        let candles = self
            .repo
            .latest(instrument, timeframe, n)
            .await
            .map_err(store_error)?;
        if candles.is_empty() {
            return Err(DataError::NoData {
                instrument: instrument.to_string(),
                timeframe: timeframe.to_string(),
            });
        }
        Ok(candles)
    }

    async fn range(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, DataError> {
        let cached = self
            .repo
            .range(instrument, timeframe, start, end)
            .await
            .map_err(store_error)?;

        let Some(provider) = &self.provider else {
            return Ok(cached);
        };
        let step = timeframe.duration();
        let covered = match (cached.first(), cached.last()) {
            (Some(first), Some(last)) => {
                first.timestamp <= start + step
                    && (last.timestamp >= end - step || last.timestamp + step * 2 > Utc::now())
            }
            _ => false,
        };
        if covered {
            return Ok(cached);
        }

        info!(
            "Filling {} {} candles {} -> {} from {}",
            instrument,
            timeframe,
            start,
            end,
            provider.name()
        );
        let fetched = provider.fetch_range(instrument, timeframe, start, end).await;
        self.store(provider.as_ref(), fetched).await;
        self.repo
            .range(instrument, timeframe, start, end)
            .await
            .map_err(store_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::init_database;
    use chrono::Duration;

    #[test]
    fn test_synthetic_candles_are_seeded_and_valid() {
        let a = SyntheticCandles::new("EUR_USD", Timeframe::M5, 7).generate(50);
        let b = SyntheticCandles::new("EUR_USD", Timeframe::M5, 7).generate(50);
        assert_eq!(a, b);
        for pair in a.windows(2) {
            assert_eq!(pair[1].timestamp - pair[0].timestamp, Duration::minutes(5));
            assert_eq!(pair[1].open, pair[0].close);
        }
        for c in &a {
            assert!(c.high >= c.open.max(c.close));
            assert!(c.low <= c.open.min(c.close));
            assert!(c.low > 0.0);
        }
    }

    #[test]
    fn test_positive_drift_climbs_every_bar() {
        let candles = SyntheticCandles::new("EUR_USD", Timeframe::M5, 3)
            .with_drift(0.001)
            .with_volatility(0.0004)
            .generate(100);
        assert!(candles.windows(2).all(|w| w[1].close > w[0].close));
    }

    #[tokio::test]
    async fn test_replay_reveals_one_bar_per_call() {
        let candles = SyntheticCandles::new("EUR_USD", Timeframe::M5, 1).generate(3);
        let source = ReplayCandleSource::new(candles.clone());

        let first = source.latest("EUR_USD", Timeframe::M5, 10).await.unwrap();
        assert_eq!(first.len(), 1);
        source.latest("EUR_USD", Timeframe::M5, 10).await.unwrap();
        let third = source.latest("EUR_USD", Timeframe::M5, 2).await.unwrap();
        assert_eq!(third, candles[1..3].to_vec());
        assert!(source.is_exhausted());

        let again = source.latest("EUR_USD", Timeframe::M5, 10).await.unwrap();
        assert_eq!(again.len(), 3);
        assert!(source.latest("USD_JPY", Timeframe::M5, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_cache_fills_from_provider_once() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let source = CachedCandleSource::new(
            CandleRepository::new(pool.clone()),
            Some(Arc::new(SyntheticProvider::new(11))),
        );

        let first = source.latest("EUR_USD", Timeframe::M5, 60).await.unwrap();
        assert_eq!(first.len(), 60);
        let second = source.latest("EUR_USD", Timeframe::M5, 60).await.unwrap();
        assert_eq!(second.len(), 60);
        assert!(second.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn test_empty_cache_without_provider_is_no_data() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let source = CachedCandleSource::new(CandleRepository::new(pool), None);
        assert!(matches!(
            source.latest("EUR_USD", Timeframe::H1, 10).await,
            Err(DataError::NoData { .. })
        ));
    }

    #[test]
    fn test_staleness_is_measured_from_bar_close() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 7, 0).unwrap();
        let candle = |minute: u32| Candle {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 12, minute, 0).unwrap(),
            ..SyntheticCandles::new("EUR_USD", Timeframe::M5, 1).next_candle()
        };
        assert!(!CachedCandleSource::is_stale(Some(&candle(0)), Timeframe::M5, now));
        assert!(CachedCandleSource::is_stale(Some(&candle(0)), Timeframe::M5, now + Duration::minutes(3)));
        assert!(CachedCandleSource::is_stale(None, Timeframe::M5, now));
    }
}
