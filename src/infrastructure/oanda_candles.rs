use crate::domain::entities::candle::{Candle, Timeframe};
use crate::domain::errors::{BrokerError, DataError};
use crate::domain::repositories::candle_source::CandleProvider;
use crate::infrastructure::oanda_client::{decimal_field, OandaClient};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// OANDA caps a single candles request at 5000 bars.
const MAX_CANDLES_PER_REQUEST: i64 = 5_000;

/// Mid-price candles from `GET /v3/instruments/{instrument}/candles`.
pub struct OandaCandleClient {
    client: Arc<OandaClient>,
}

impl OandaCandleClient {
    pub fn new(client: Arc<OandaClient>) -> Self {
        OandaCandleClient { client }
    }

    async fn get(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        mut query: Vec<(&str, String)>,
    ) -> Result<Vec<Candle>, DataError> {
        query.push(("price", "M".to_string()));
        query.push(("granularity", timeframe.as_str().to_string()));
        let path = format!("/v3/instruments/{}/candles", instrument);
        let body = self
            .client
            .request(Method::GET, &path, &query, None)
            .await
            .map_err(provider_error)?;
        parse_candles(&body, instrument, timeframe)
    }
}

fn provider_error(e: BrokerError) -> DataError {
    DataError::ProviderFailed(e.to_string())
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Complete candles only; the forming bar is dropped.
pub fn parse_candles(
    body: &Value,
    instrument: &str,
    timeframe: Timeframe,
) -> Result<Vec<Candle>, DataError> {
    let Some(items) = body.get("candles").and_then(Value::as_array) else {
        return Err(DataError::ParseError("missing candles array".to_string()));
    };

    let mut candles = Vec::with_capacity(items.len());
    for item in items {
        if !item.get("complete").and_then(Value::as_bool).unwrap_or(false) {
            continue;
        }
        let time = item
            .get("time")
            .and_then(Value::as_str)
            .ok_or_else(|| DataError::ParseError("candle without time".to_string()))?;
        let timestamp = DateTime::parse_from_rfc3339(time)
            .map_err(|e| DataError::ParseError(format!("bad time {}: {}", time, e)))?
            .with_timezone(&Utc);
        let mid = item
            .get("mid")
            .ok_or_else(|| DataError::ParseError(format!("candle {} without mid prices", time)))?;
        let field = |name: &str| decimal_field(mid, name).map_err(|e| DataError::ParseError(e.to_string()));
        let volume = item.get("volume").and_then(Value::as_f64).unwrap_or(0.0);

        let candle = Candle::new(
            instrument,
            timeframe,
            timestamp,
            field("o")?,
            field("h")?,
            field("l")?,
            field("c")?,
            volume,
        )
        .map_err(|e| DataError::ParseError(e.to_string()))?;
        candles.push(candle);
    }
    Ok(candles)
}

#[async_trait]
impl CandleProvider for OandaCandleClient {
    fn name(&self) -> &str {
        "oanda"
    }

    async fn fetch(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        count: usize,
        after: Option<&Candle>,
    ) -> Result<Vec<Candle>, DataError> {
        let count = (count.max(1) as i64).min(MAX_CANDLES_PER_REQUEST);
        let mut query = vec![("count", count.to_string())];
        if let Some(last) = after {
            query.push(("from", rfc3339(last.timestamp + timeframe.duration())));
        }
        let candles = self.get(instrument, timeframe, query).await?;
        debug!("OANDA returned {} {} {} candles", candles.len(), instrument, timeframe);
        Ok(candles)
    }

    async fn fetch_range(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, DataError> {
        let chunk = timeframe.duration() * (MAX_CANDLES_PER_REQUEST as i32 - 1);
        let mut from = start;
        let mut candles: Vec<Candle> = Vec::new();
        while from <= end {
            let to = (from + chunk).min(end);
            let query = vec![("from", rfc3339(from)), ("to", rfc3339(to))];
            let batch = self.get(instrument, timeframe, query).await?;
            let newest = candles.last().map(|c| c.timestamp);
            candles.extend(
                batch
                    .into_iter()
                    .filter(|c| newest.map_or(true, |ts| c.timestamp > ts)),
            );
            from = to + timeframe.duration();
        }
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_skips_incomplete_bars() {
        let body = json!({
            "instrument": "EUR_USD",
            "granularity": "M5",
            "candles": [
                {"complete": true, "volume": 120, "time": "2024-03-01T12:00:00.000000000Z",
                 "mid": {"o": "1.08410", "h": "1.08450", "l": "1.08390", "c": "1.08440"}},
                {"complete": false, "volume": 15, "time": "2024-03-01T12:05:00.000000000Z",
                 "mid": {"o": "1.08440", "h": "1.08460", "l": "1.08430", "c": "1.08455"}}
            ]
        });
        let candles = parse_candles(&body, "EUR_USD", Timeframe::M5).unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, 1.0844);
        assert_eq!(candles[0].volume, 120.0);
        assert_eq!(rfc3339(candles[0].timestamp), "2024-03-01T12:00:00Z");
    }

    #[test]
    fn test_parse_rejects_malformed_payloads() {
        assert!(parse_candles(&json!({}), "EUR_USD", Timeframe::M5).is_err());
        let bad = json!({"candles": [{"complete": true, "time": "2024-03-01T12:00:00Z",
            "mid": {"o": "1.1", "h": "1.0", "l": "1.2", "c": "1.1"}}]});
        assert!(matches!(
            parse_candles(&bad, "EUR_USD", Timeframe::M5),
            Err(DataError::ParseError(_))
        ));
    }
}
