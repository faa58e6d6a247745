use crate::domain::entities::account::Account;
use crate::domain::entities::order::OrderIntent;
use crate::domain::entities::position::{ExitReason, Position};
use crate::domain::errors::BrokerError;
use crate::domain::repositories::broker::{Broker, BrokerKind, BrokerResult};
use crate::domain::services::ledger::PaperLedger;
use crate::persistence::repository::TradeJournal;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// In-process broker filling every order at its intent price.
pub struct PaperBroker {
    ledger: Mutex<PaperLedger>,
    journal: Option<TradeJournal>,
}

impl PaperBroker {
    pub fn new(ledger: PaperLedger) -> Self {
        PaperBroker {
            ledger: Mutex::new(ledger),
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: TradeJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Copy of the book, mostly for inspection in tests.
    pub async fn snapshot(&self) -> PaperLedger {
        self.ledger.lock().await.clone()
    }
}

fn journal_error(e: crate::persistence::DatabaseError) -> BrokerError {
    BrokerError::Journal(e.to_string())
}

#[async_trait]
impl Broker for PaperBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Paper
    }

    async fn place_order(&self, intent: &OrderIntent) -> BrokerResult<Position> {
        let mut ledger = self.ledger.lock().await;
        let position = ledger.open(intent, intent.price, intent.submitted_at)?;
        info!(
            "Paper fill {} {} {} @ {:.5} ({})",
            position.id, position.side, position.units, position.entry_price, position.instrument
        );

        if let Some(journal) = &self.journal {
            journal
                .record_fill(BrokerKind::Paper.as_str(), intent, &position)
                .await
                .map_err(journal_error)?;
        }
        Ok(position)
    }

    async fn refresh_mark_to_market(
        &self,
        instrument: &str,
        price: f64,
        at: DateTime<Utc>,
    ) -> BrokerResult<Vec<Position>> {
        let mut ledger = self.ledger.lock().await;
        ledger.mark(instrument, price, at);
        debug!("Marked {} at {:.5}", instrument, price);

        if let Some(journal) = &self.journal {
            let marked: Vec<Position> = ledger
                .open_positions(None)
                .into_iter()
                .filter(|p| p.instrument == instrument)
                .collect();
            journal.record_marks(&marked).await.map_err(journal_error)?;
        }
        // Paper stops and targets are only ever triggered by the engine.
        Ok(Vec::new())
    }

    async fn close_position(&self, position_id: &str, reason: ExitReason) -> BrokerResult<Position> {
        let mut ledger = self.ledger.lock().await;
        let position = ledger.close(position_id, reason)?;
        info!(
            "Paper close {} ({}) @ {:.5}, realized {:.2}",
            position.id,
            reason,
            position.exit_price.unwrap_or_default(),
            position.realized_pnl
        );

        if let Some(journal) = &self.journal {
            journal.record_close(&position).await.map_err(journal_error)?;
        }
        ledger.prune_closed();
        Ok(position)
    }

    async fn list_open_positions(&self, run_id: &str) -> BrokerResult<Vec<Position>> {
        Ok(self.ledger.lock().await.open_positions(Some(run_id)))
    }

    async fn list_all_open_positions(&self) -> BrokerResult<Vec<Position>> {
        Ok(self.ledger.lock().await.open_positions(None))
    }

    async fn account_summary(&self) -> BrokerResult<Account> {
        Ok(self.ledger.lock().await.account())
    }
}
