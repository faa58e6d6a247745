use crate::domain::entities::candle::{validate_instrument, Timeframe};
use crate::domain::errors::ConfigError;
use crate::domain::repositories::broker::BrokerKind;
use crate::domain::services::features::FeatureConfig;
use crate::domain::services::pipeline::PipelineConfig;
use crate::domain::services::risk_manager::RiskConfig;
use crate::domain::services::strategies::create_strategy;
use crate::infrastructure::oanda_client::{OandaEnvironment, RetryPolicy};
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration for the bot and its collaborators
#[derive(Debug, Clone)]
pub struct TradingConfig {
    // Session defaults
    pub instrument: String,
    pub timeframe: Timeframe,
    pub strategy: String,
    pub window_size: usize, // candles handed to the pipeline each tick
    pub tick_interval_seconds: u64,
    pub min_confidence_threshold: f64,
    pub flip_margin: f64, // extra confidence an opposing signal needs to close a position
    pub higher_timeframe: Option<Timeframe>,

    pub risk: RiskConfig,

    // Broker
    pub broker: BrokerKind,
    pub paper_initial_balance: f64,
    pub paper_margin_rate: f64,
    pub oanda_environment: OandaEnvironment,
    pub oanda_account_id: Option<String>,
    pub oanda_token_env: String,
    pub oanda_token_op_ref: Option<String>,
    pub broker_retry_attempts: u32,
    pub broker_retry_base_ms: u64,
    pub broker_timeout_ms: u64,

    // Storage, news gating and HTTP
    pub database_url: String,
    pub news_calendar_path: Option<String>,
    pub news_blackout_minutes: i64,
    pub http_bind: String,
    pub synthetic_seed: u64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            instrument: "EUR_USD".to_string(),
            timeframe: Timeframe::M5,
            strategy: "sma_crossover".to_string(),
            window_size: 200,
            tick_interval_seconds: 60,
            min_confidence_threshold: 0.6,
            flip_margin: 0.3,
            higher_timeframe: None,

            risk: RiskConfig::default(),

            broker: BrokerKind::Paper,
            paper_initial_balance: 100_000.0,
            paper_margin_rate: 0.02,
            oanda_environment: OandaEnvironment::Practice,
            oanda_account_id: None,
            oanda_token_env: "OANDA_API_TOKEN".to_string(),
            oanda_token_op_ref: None,
            broker_retry_attempts: 3,
            broker_retry_base_ms: 500,
            broker_timeout_ms: 10_000,

            database_url: "sqlite://data/fxbot.db".to_string(),
            news_calendar_path: None,
            news_blackout_minutes: 30,
            http_bind: "127.0.0.1:8080".to_string(),
            synthetic_seed: 42,
        }
    }
}

/// Overwrites `target` with the parsed value of `name` when it is set and
/// accepted by `valid`; otherwise logs and keeps the current value.
fn override_from_env<T, F>(name: &str, target: &mut T, valid: F)
where
    T: FromStr + Display,
    T::Err: Display,
    F: Fn(&T) -> bool,
{
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => *target = value,
        Ok(value) => {
            tracing::warn!(
                "Invalid {} value: {}, using default: {}",
                name,
                value,
                target
            );
        }
        Err(e) => {
            tracing::warn!(
                "Failed to parse {} '{}': {}, using default: {}",
                name,
                raw,
                e,
                target
            );
        }
    }
}

fn optional_from_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn unit_interval(v: &f64) -> bool {
    (0.0..=1.0).contains(v)
}

fn positive(v: &f64) -> bool {
    v.is_finite() && *v > 0.0
}

impl TradingConfig {
    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> TradingConfig {
        let mut config = TradingConfig::default();

        if let Some(instrument) = optional_from_env("FXBOT_INSTRUMENT") {
            match validate_instrument(&instrument) {
                Ok(()) => config.instrument = instrument,
                Err(e) => tracing::warn!("{}, using default: {}", e, config.instrument),
            }
        }
        override_from_env("FXBOT_TIMEFRAME", &mut config.timeframe, |_| true);
        if let Some(strategy) = optional_from_env("FXBOT_STRATEGY") {
            match create_strategy(&strategy) {
                Ok(s) => config.strategy = s.name().to_string(),
                Err(e) => tracing::warn!("{}, using default: {}", e, config.strategy),
            }
        }
        override_from_env("FXBOT_WINDOW_SIZE", &mut config.window_size, |v| {
            (50..=5_000).contains(v)
        });
        override_from_env(
            "FXBOT_TICK_INTERVAL_SECONDS",
            &mut config.tick_interval_seconds,
            |v| (1..=86_400).contains(v),
        );
        override_from_env(
            "MIN_CONFIDENCE_THRESHOLD",
            &mut config.min_confidence_threshold,
            unit_interval,
        );
        override_from_env("FLIP_MARGIN", &mut config.flip_margin, unit_interval);
        if let Some(raw) = optional_from_env("HIGHER_TIMEFRAME") {
            match raw.parse::<Timeframe>() {
                Ok(tf) => config.higher_timeframe = Some(tf),
                Err(e) => tracing::warn!("Failed to parse HIGHER_TIMEFRAME '{}': {}", raw, e),
            }
        }

        // Risk limits
        let risk = &mut config.risk;
        override_from_env("RISK_ALLOCATION_PCT", &mut risk.allocation_pct, |v| {
            *v > 0.0 && *v <= 1.0
        });
        override_from_env("RISK_PCT_PER_TRADE", &mut risk.risk_pct_per_trade, |v| {
            *v > 0.0 && *v <= 1.0
        });
        override_from_env("MAX_LEVERAGE", &mut risk.max_leverage, |v| {
            positive(v) && *v <= 500.0
        });
        override_from_env("MAX_EXPOSURE", &mut risk.max_exposure, |v| {
            *v > 0.0 && *v <= 1.0
        });
        override_from_env("MAX_DRAWDOWN_STOP", &mut risk.max_drawdown_stop, |v| {
            *v > 0.0 && *v <= 1.0
        });
        override_from_env("STOP_ATR_MULTIPLE", &mut risk.stop_atr_multiple, positive);
        override_from_env("TAKE_PROFIT_ATR_MULTIPLE", &mut risk.target_atr_multiple, positive);
        override_from_env("PIP_VALUE", &mut risk.pip_value, positive);

        // Broker
        override_from_env("BROKER", &mut config.broker, |_| true);
        override_from_env("PAPER_INITIAL_BALANCE", &mut config.paper_initial_balance, positive);
        override_from_env("PAPER_MARGIN_RATE", &mut config.paper_margin_rate, |v| {
            *v > 0.0 && *v <= 1.0
        });
        override_from_env("OANDA_ENVIRONMENT", &mut config.oanda_environment, |_| true);
        config.oanda_account_id = optional_from_env("OANDA_ACCOUNT_ID");
        if let Some(name) = optional_from_env("OANDA_TOKEN_ENV") {
            config.oanda_token_env = name;
        }
        config.oanda_token_op_ref = optional_from_env("OANDA_TOKEN_OP_REF");
        override_from_env("BROKER_RETRY_ATTEMPTS", &mut config.broker_retry_attempts, |v| {
            (1..=10).contains(v)
        });
        override_from_env("BROKER_RETRY_BASE_MS", &mut config.broker_retry_base_ms, |v| {
            (10..=60_000).contains(v)
        });
        override_from_env("BROKER_TIMEOUT_MS", &mut config.broker_timeout_ms, |v| {
            (1_000..=120_000).contains(v)
        });

        if let Some(url) = optional_from_env("DATABASE_URL") {
            config.database_url = url;
        }
        config.news_calendar_path = optional_from_env("NEWS_CALENDAR_PATH");
        override_from_env(
            "NEWS_BLACKOUT_MINUTES",
            &mut config.news_blackout_minutes,
            |v| (0..=1_440).contains(v),
        );
        if let Some(bind) = optional_from_env("HTTP_BIND") {
            config.http_bind = bind;
        }
        override_from_env("SYNTHETIC_SEED", &mut config.synthetic_seed, |_| true);

        config
    }

    /// Checks every value a session depends on. Runs before any Run is created.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_instrument(&self.instrument)?;
        create_strategy(&self.strategy)?;
        self.risk.validate()?;

        let min_window = FeatureConfig::default().min_history();
        if self.window_size < min_window {
            return Err(ConfigError::InvalidValue {
                field: "window_size".to_string(),
                reason: format!("{} is below the feature warm-up of {}", self.window_size, min_window),
            });
        }
        if !unit_interval(&self.min_confidence_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "min_confidence_threshold".to_string(),
                reason: format!("{} is outside [0, 1]", self.min_confidence_threshold),
            });
        }
        if !(self.flip_margin.is_finite() && self.flip_margin >= 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "flip_margin".to_string(),
                reason: format!("{} must be non-negative", self.flip_margin),
            });
        }
        if let Some(htf) = self.higher_timeframe {
            if htf.seconds() <= self.timeframe.seconds() {
                return Err(ConfigError::InvalidValue {
                    field: "higher_timeframe".to_string(),
                    reason: format!("{} is not above {}", htf, self.timeframe),
                });
            }
        }
        if self.tick_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "tick_interval_seconds".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if !positive(&self.paper_initial_balance) {
            return Err(ConfigError::InvalidValue {
                field: "paper_initial_balance".to_string(),
                reason: format!("{} must be positive", self.paper_initial_balance),
            });
        }
        if !(self.paper_margin_rate > 0.0 && self.paper_margin_rate <= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "paper_margin_rate".to_string(),
                reason: format!("{} is outside (0, 1]", self.paper_margin_rate),
            });
        }
        if self.broker_retry_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "broker_retry_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.broker == BrokerKind::Oanda && self.oanda_account_id.is_none() {
            return Err(ConfigError::MissingCredential("OANDA_ACCOUNT_ID".to_string()));
        }
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            min_confidence: self.min_confidence_threshold,
            flip_margin: self.flip_margin,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.broker_retry_attempts,
            base_delay: Duration::from_millis(self.broker_retry_base_ms),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_seconds)
    }
}
