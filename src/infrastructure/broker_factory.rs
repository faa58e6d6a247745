//! Broker and candle-source construction
//!
//! The configured broker kind is resolved once at startup; the engine and
//! the control surface share the resulting `Arc<dyn Broker>`.

use crate::config::TradingConfig;
use crate::domain::errors::{ConfigError, EngineError};
use crate::domain::repositories::broker::{Broker, BrokerKind};
use crate::domain::repositories::candle_source::{CandleProvider, CandleSource};
use crate::domain::services::ledger::PaperLedger;
use crate::infrastructure::candle_feed::{CachedCandleSource, SyntheticProvider};
use crate::infrastructure::oanda_broker::OandaBroker;
use crate::infrastructure::oanda_candles::OandaCandleClient;
use crate::infrastructure::oanda_client::{OandaClient, OandaConfig};
use crate::persistence::repository::{CandleRepository, TradeJournal};
use crate::persistence::DbPool;
use crate::secrets::{load_api_token, SecretConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Builds the OANDA transport when credentials are configured.
pub fn create_oanda_client(config: &TradingConfig) -> Result<Option<Arc<OandaClient>>, EngineError> {
    let Some(account_id) = config.oanda_account_id.as_deref() else {
        return Ok(None);
    };
    let token = match load_api_token(
        &config.oanda_token_env,
        config.oanda_token_op_ref.as_deref(),
        &SecretConfig::default(),
    ) {
        Ok(token) => token,
        Err(e) => {
            warn!("OANDA token unavailable: {}", e);
            return Ok(None);
        }
    };

    let oanda = OandaConfig::new(config.oanda_environment, account_id, token, config.retry_policy())
        .with_timeout(Duration::from_millis(config.broker_timeout_ms));
    let client = OandaClient::new(oanda)?;
    info!(
        "OANDA client configured for account {} ({})",
        account_id, config.oanda_environment
    );
    Ok(Some(Arc::new(client)))
}

/// Selects the broker implementation for `config.broker`.
///
/// The OANDA broker requires a reachable account; a missing credential or a
/// failing connection is an error, never a silent switch to paper trading.
pub async fn create_broker(
    config: &TradingConfig,
    oanda: Option<Arc<OandaClient>>,
    journal: Option<TradeJournal>,
) -> Result<Arc<dyn Broker>, EngineError> {
    match config.broker {
        BrokerKind::Paper => {
            let prefix = format!("{}-", &uuid::Uuid::new_v4().simple().to_string()[..8]);
            let ledger = PaperLedger::new(config.paper_initial_balance, config.paper_margin_rate)
                .with_id_prefix(&prefix);
            let mut broker = crate::infrastructure::paper_broker::PaperBroker::new(ledger);
            if let Some(journal) = journal {
                broker = broker.with_journal(journal);
            }
            info!(
                "Paper broker created with balance {:.2}",
                config.paper_initial_balance
            );
            Ok(Arc::new(broker))
        }
        BrokerKind::Oanda => {
            let Some(client) = oanda else {
                error!("OANDA broker selected but no credentials are configured");
                return Err(ConfigError::MissingCredential(config.oanda_token_env.clone()).into());
            };
            let broker = OandaBroker::connect(client, journal).await?;
            Ok(Arc::new(broker))
        }
    }
}

/// Candle cache fed by OANDA when available, otherwise by the synthetic walk.
pub fn create_candle_source(
    config: &TradingConfig,
    pool: DbPool,
    oanda: Option<Arc<OandaClient>>,
) -> Arc<dyn CandleSource> {
    let provider: Arc<dyn CandleProvider> = match oanda {
        Some(client) => Arc::new(OandaCandleClient::new(client)),
        None => {
            warn!("No market data credentials, using synthetic candles");
            Arc::new(SyntheticProvider::new(config.synthetic_seed))
        }
    };
    Arc::new(CachedCandleSource::new(
        CandleRepository::new(pool),
        Some(provider),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::init_database;

    #[tokio::test]
    async fn test_paper_broker_from_default_config() {
        let config = TradingConfig::default();
        let broker = create_broker(&config, None, None).await.unwrap();
        assert_eq!(broker.kind(), BrokerKind::Paper);
        let account = broker.account_summary().await.unwrap();
        assert_eq!(account.balance, 100_000.0);
    }

    #[tokio::test]
    async fn test_oanda_without_credentials_is_rejected() {
        let mut config = TradingConfig::default();
        config.broker = BrokerKind::Oanda;
        let result = create_broker(&config, None, None).await;
        assert!(matches!(
            result,
            Err(EngineError::Config(ConfigError::MissingCredential(_)))
        ));
    }

    #[tokio::test]
    async fn test_no_account_means_no_oanda_client() {
        let config = TradingConfig::default();
        assert!(create_oanda_client(&config).unwrap().is_none());

        let pool = init_database("sqlite::memory:").await.unwrap();
        let source = create_candle_source(&config, pool, None);
        let candles = source.latest("EUR_USD", config.timeframe, 50).await.unwrap();
        assert_eq!(candles.len(), 50);
    }
}
