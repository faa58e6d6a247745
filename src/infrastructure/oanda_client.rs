//! OANDA v20 REST transport
//!
//! Shared by the candle provider and the broker. Every call goes through
//! [`OandaClient::request`] or [`OandaClient::submit`], which apply the retry
//! policy: 429, 5xx and transport failures back off exponentially, any other
//! 4xx fails at once. `submit` is for calls that must not run twice; a
//! transport failure after the request may have reached OANDA is not retried.

use crate::domain::errors::{BrokerError, ConfigError};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};
use zeroize::Zeroizing;

const PRACTICE_API_BASE: &str = "https://api-fxpractice.oanda.com";
const LIVE_API_BASE: &str = "https://api-fxtrade.oanda.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OandaEnvironment {
    Practice,
    Live,
}

impl OandaEnvironment {
    pub fn api_base(&self) -> &'static str {
        match self {
            OandaEnvironment::Practice => PRACTICE_API_BASE,
            OandaEnvironment::Live => LIVE_API_BASE,
        }
    }
}

impl fmt::Display for OandaEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OandaEnvironment::Practice => f.write_str("practice"),
            OandaEnvironment::Live => f.write_str("live"),
        }
    }
}

impl FromStr for OandaEnvironment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "practice" | "demo" => Ok(OandaEnvironment::Practice),
            "live" | "trade" => Ok(OandaEnvironment::Live),
            other => Err(ConfigError::InvalidValue {
                field: "oanda_environment".to_string(),
                reason: format!("unknown environment {}", other),
            }),
        }
    }
}

/// Bounded exponential backoff: attempt `n` (0-based) waits `base × 2^n`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Connection settings for one OANDA account
#[derive(Clone)]
pub struct OandaConfig {
    pub api_base: String,
    pub account_id: String,
    pub token: Zeroizing<String>,
    pub retry: RetryPolicy,
    pub timeout: Duration,
}

impl fmt::Debug for OandaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OandaConfig")
            .field("api_base", &self.api_base)
            .field("account_id", &self.account_id)
            .field("token", &"<redacted>")
            .field("retry", &self.retry)
            .finish()
    }
}

impl OandaConfig {
    pub fn new(
        environment: OandaEnvironment,
        account_id: &str,
        token: Zeroizing<String>,
        retry: RetryPolicy,
    ) -> Self {
        OandaConfig {
            api_base: environment.api_base().to_string(),
            account_id: account_id.to_string(),
            token,
            retry,
            timeout: Duration::from_secs(10),
        }
    }

    /// Points the client at another host, e.g. a local stub server.
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

pub struct OandaClient {
    http: Client,
    config: OandaConfig,
}

enum Attempt {
    Done(Value),
    Retry(BrokerError),
    /// The request may have been delivered before the failure.
    Unsure(BrokerError),
    Fail(BrokerError),
}

impl OandaClient {
    pub fn new(config: OandaConfig) -> Result<Self, BrokerError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("fxbot/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BrokerError::Transport(format!("Failed to build HTTP client: {}", e)))?;
        Ok(OandaClient { http, config })
    }

    pub fn config(&self) -> &OandaConfig {
        &self.config
    }

    pub fn account_path(&self, suffix: &str) -> String {
        format!("/v3/accounts/{}{}", self.config.account_id, suffix)
    }

    /// Sends one idempotent request, retrying per the configured policy.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, BrokerError> {
        self.send(method, path, query, body, true).await
    }

    /// Sends a request that creates something remotely, such as an order.
    /// Throttling, 5xx and refused connections are retried; a failure after
    /// the request went out is returned as is.
    pub async fn submit(
        &self,
        method: Method,
        path: &str,
        body: &Value,
    ) -> Result<Value, BrokerError> {
        self.send(method, path, &[], Some(body), false).await
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        idempotent: bool,
    ) -> Result<Value, BrokerError> {
        let policy = self.config.retry;
        let attempts = policy.max_attempts.max(1);
        let mut last_error = BrokerError::Transport("no attempt made".to_string());

        for attempt in 0..attempts {
            let outcome = match self.attempt(method.clone(), path, query, body).await {
                Attempt::Unsure(e) if idempotent => Attempt::Retry(e),
                Attempt::Unsure(e) => Attempt::Fail(e),
                other => other,
            };
            match outcome {
                Attempt::Done(value) => return Ok(value),
                Attempt::Unsure(e) | Attempt::Fail(e) => {
                    error!("OANDA {} {} failed: {}", method, path, e);
                    return Err(e);
                }
                Attempt::Retry(e) => {
                    last_error = e;
                    if attempt + 1 < attempts {
                        let delay = policy.delay_for(attempt);
                        warn!(
                            "OANDA {} {} failed (attempt {}/{}): {}, retrying in {:?}",
                            method,
                            path,
                            attempt + 1,
                            attempts,
                            last_error,
                            delay
                        );
                        sleep(delay).await;
                    }
                }
            }
        }

        error!(
            "OANDA {} {} exhausted {} attempts: {}",
            method, path, attempts, last_error
        );
        Err(match last_error {
            BrokerError::Rejected { status, .. } => BrokerError::Unavailable { status, attempts },
            other => other,
        })
    }

    async fn attempt(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Attempt {
        let url = format!("{}{}", self.config.api_base, path);
        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(self.config.token.as_str())
            .header("Accept-Datetime-Format", "RFC3339");
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() => return Attempt::Retry(BrokerError::Transport(e.to_string())),
            Err(e) => return Attempt::Unsure(BrokerError::Transport(e.to_string())),
        };

        let status = response.status();
        if status.is_success() {
            return match response.json::<Value>().await {
                Ok(value) => {
                    debug!("OANDA {} -> {}", path, status);
                    Attempt::Done(value)
                }
                Err(e) => Attempt::Fail(BrokerError::InvalidResponse(format!(
                    "Failed to parse response from {}: {}",
                    path, e
                ))),
            };
        }

        let body = response.text().await.unwrap_or_default();
        classify_failure(status, body)
    }
}

fn classify_failure(status: StatusCode, body: String) -> Attempt {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Attempt::Fail(BrokerError::AuthenticationFailed(format!(
            "{} - {}",
            status, body
        )));
    }
    let error = BrokerError::Rejected {
        status: status.as_u16(),
        body,
    };
    if error.is_retryable() {
        Attempt::Retry(error)
    } else {
        Attempt::Fail(error)
    }
}

/// OANDA encodes decimals as strings.
pub fn decimal_field(value: &Value, field: &str) -> Result<f64, BrokerError> {
    match value.get(field) {
        Some(Value::String(s)) => s
            .parse::<f64>()
            .map_err(|e| BrokerError::InvalidResponse(format!("{} = {:?}: {}", field, s, e))),
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| BrokerError::InvalidResponse(format!("{} is not a number", field))),
        _ => Err(BrokerError::InvalidResponse(format!("missing field {}", field))),
    }
}

/// Decimals OANDA quotes an instrument with when the account did not say:
/// 3 for JPY-quoted pairs, 5 otherwise.
pub fn default_precision(instrument: &str) -> usize {
    if instrument.ends_with("_JPY") {
        3
    } else {
        5
    }
}

/// Price rounded to `decimals`; OANDA rejects anything finer than the
/// instrument's display precision.
pub fn format_price(price: f64, decimals: usize) -> String {
    format!("{:.*}", decimals, price)
}
