//! OANDA v20 execution
//!
//! Orders go to the remote account first; the local mirror ledger is only
//! touched once the remote confirms the fill. Remote failures propagate to
//! the caller and never fall back to simulated fills.
//!
//! Stops and targets ride on the order, so OANDA may close a trade on its
//! own. Every mark checks the mirror against `openTrades` and settles such
//! trades from their remote record.

use crate::domain::entities::account::Account;
use crate::domain::entities::order::OrderIntent;
use crate::domain::entities::position::{ExitReason, Position};
use crate::domain::errors::BrokerError;
use crate::domain::repositories::broker::{Broker, BrokerKind, BrokerResult};
use crate::domain::services::ledger::PaperLedger;
use crate::infrastructure::oanda_client::{
    decimal_field, default_precision, format_price, OandaClient,
};
use crate::persistence::repository::TradeJournal;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub struct OandaBroker {
    client: Arc<OandaClient>,
    mirror: Mutex<PaperLedger>,
    journal: Option<TradeJournal>,
    precision: HashMap<String, usize>,
}

impl OandaBroker {
    /// Builds the broker and checks the account is reachable with the given
    /// credentials.
    pub async fn connect(
        client: Arc<OandaClient>,
        journal: Option<TradeJournal>,
    ) -> BrokerResult<Self> {
        let mut broker = OandaBroker {
            client,
            mirror: Mutex::new(PaperLedger::new(0.0, 0.0)),
            journal,
            precision: HashMap::new(),
        };
        let account = broker.account_summary().await?;
        info!(
            "Connected to OANDA account {} (balance {:.2}, NAV {:.2})",
            broker.client.config().account_id,
            account.balance,
            account.equity
        );

        let path = broker.client.account_path("/instruments");
        match broker.client.request(Method::GET, &path, &[], None).await {
            Ok(body) => broker.precision = parse_precisions(&body),
            Err(e) => warn!(
                "No instrument list from OANDA ({}), using default price precision",
                e
            ),
        }
        Ok(broker)
    }

    fn price_precision(&self, instrument: &str) -> usize {
        self.precision
            .get(instrument)
            .copied()
            .unwrap_or_else(|| default_precision(instrument))
    }

    fn order_body(intent: &OrderIntent, decimals: usize) -> Value {
        let mut order = json!({
            "type": "MARKET",
            "instrument": intent.instrument,
            "units": intent.units.to_string(),
            "timeInForce": "FOK",
            "positionFill": "DEFAULT",
        });
        if let Some(stop) = intent.stop_loss {
            order["stopLossOnFill"] = json!({ "price": format_price(stop, decimals) });
        }
        if let Some(target) = intent.take_profit {
            order["takeProfitOnFill"] = json!({ "price": format_price(target, decimals) });
        }
        json!({ "order": order })
    }

    fn journal_error(e: crate::persistence::DatabaseError) -> BrokerError {
        BrokerError::Journal(e.to_string())
    }

    /// Seals a mirror position from a close that already happened remotely.
    async fn seal(
        &self,
        trade_id: &str,
        exit_price: f64,
        at: DateTime<Utc>,
        reason: ExitReason,
    ) -> BrokerResult<Position> {
        let position = {
            let mut mirror = self.mirror.lock().await;
            let position = mirror.close_at(trade_id, exit_price, at, reason)?;
            mirror.prune_closed();
            position
        };
        info!(
            "OANDA closed trade {} ({}) @ {:.5}, realized {:.2}",
            position.id, reason, exit_price, position.realized_pnl
        );
        if let Some(journal) = &self.journal {
            journal
                .record_close(&position)
                .await
                .map_err(Self::journal_error)?;
        }
        Ok(position)
    }

    /// Reads the remote record of a trade that OANDA already closed.
    async fn settle_remote_close(
        &self,
        trade_id: &str,
        fallback_at: DateTime<Utc>,
    ) -> BrokerResult<Position> {
        let path = self.client.account_path(&format!("/trades/{}", trade_id));
        let body = self.client.request(Method::GET, &path, &[], None).await?;
        let closed = parse_closed_trade(&body)?;
        self.seal(
            trade_id,
            closed.price,
            closed.at.unwrap_or(fallback_at),
            closed.reason,
        )
        .await
    }

    /// Settles every mirror position OANDA no longer lists as open.
    async fn reconcile(&self, at: DateTime<Utc>) -> BrokerResult<Vec<Position>> {
        let local: Vec<String> = self
            .mirror
            .lock()
            .await
            .open_positions(None)
            .into_iter()
            .map(|p| p.id)
            .collect();
        if local.is_empty() {
            return Ok(Vec::new());
        }

        let path = self.client.account_path("/openTrades");
        let body = self.client.request(Method::GET, &path, &[], None).await?;
        let remote = parse_open_trade_ids(&body)?;

        let mut settled = Vec::new();
        for id in local.iter().filter(|id| !remote.contains(*id)) {
            warn!("OANDA trade {} was closed remotely, settling", id);
            settled.push(self.settle_remote_close(id, at).await?);
        }
        Ok(settled)
    }
}

/// Price and cause of a remotely closed trade.
#[derive(Debug, Clone, PartialEq)]
struct RemoteClose {
    price: f64,
    at: Option<DateTime<Utc>>,
    reason: ExitReason,
}

fn parse_precisions(body: &Value) -> HashMap<String, usize> {
    body.get("instruments")
        .and_then(Value::as_array)
        .map(|instruments| {
            instruments
                .iter()
                .filter_map(|i| {
                    let name = i.get("name")?.as_str()?;
                    let decimals = i.get("displayPrecision")?.as_u64()?;
                    Some((name.to_string(), decimals as usize))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_open_trade_ids(body: &Value) -> BrokerResult<HashSet<String>> {
    let trades = body
        .get("trades")
        .and_then(Value::as_array)
        .ok_or_else(|| BrokerError::InvalidResponse("missing trades".to_string()))?;
    Ok(trades
        .iter()
        .filter_map(|t| t.get("id").and_then(Value::as_str))
        .map(str::to_string)
        .collect())
}

fn parse_closed_trade(body: &Value) -> BrokerResult<RemoteClose> {
    let trade = body
        .get("trade")
        .ok_or_else(|| BrokerError::InvalidResponse("missing trade".to_string()))?;
    let state = trade.get("state").and_then(Value::as_str).unwrap_or("UNKNOWN");
    if state != "CLOSED" {
        return Err(BrokerError::InvalidResponse(format!(
            "trade is {} remotely, expected CLOSED",
            state
        )));
    }
    let filled = |order: &str| trade.pointer(&format!("/{}/state", order)) == Some(&json!("FILLED"));
    let reason = if filled("stopLossOrder") || filled("trailingStopLossOrder") {
        ExitReason::StopLoss
    } else if filled("takeProfitOrder") {
        ExitReason::TakeProfit
    } else {
        ExitReason::Manual
    };
    let at = trade
        .get("closeTime")
        .and_then(Value::as_str)
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc));
    Ok(RemoteClose {
        price: decimal_field(trade, "averageClosePrice")?,
        at,
        reason,
    })
}

/// Extracts `(order id, trade id, fill price)` from an order-create response.
fn parse_fill(body: &Value) -> BrokerResult<(String, String, f64)> {
    if let Some(cancel) = body.get("orderCancelTransaction") {
        let reason = cancel
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        return Err(BrokerError::InvalidOrder(format!(
            "order cancelled by broker: {}",
            reason
        )));
    }
    let fill = body
        .get("orderFillTransaction")
        .ok_or_else(|| BrokerError::InvalidResponse("missing orderFillTransaction".to_string()))?;
    let order_id = fill
        .get("orderID")
        .or_else(|| fill.get("id"))
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::InvalidResponse("fill without order id".to_string()))?;
    let trade_id = fill
        .pointer("/tradeOpened/tradeID")
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::InvalidResponse("fill did not open a trade".to_string()))?;
    let price = decimal_field(fill, "price")?;
    Ok((order_id.to_string(), trade_id.to_string(), price))
}

fn parse_account(body: &Value) -> BrokerResult<Account> {
    let account = body
        .get("account")
        .ok_or_else(|| BrokerError::InvalidResponse("missing account".to_string()))?;
    Ok(Account {
        balance: decimal_field(account, "balance")?,
        equity: decimal_field(account, "NAV")?,
        margin_used: decimal_field(account, "marginUsed")?,
        free_margin: decimal_field(account, "marginAvailable")?,
    })
}

#[async_trait]
impl Broker for OandaBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Oanda
    }

    async fn place_order(&self, intent: &OrderIntent) -> BrokerResult<Position> {
        intent.validate().map_err(BrokerError::InvalidOrder)?;

        let path = self.client.account_path("/orders");
        let order = Self::order_body(intent, self.price_precision(&intent.instrument));
        let body = self.client.submit(Method::POST, &path, &order).await?;
        let (order_id, trade_id, fill_price) = parse_fill(&body)?;

        let position = self.mirror.lock().await.open_with_ids(
            intent,
            fill_price,
            intent.submitted_at,
            order_id,
            trade_id,
        )?;
        info!(
            "OANDA fill trade {} {} {} @ {:.5}",
            position.id, position.side, position.units, position.entry_price
        );

        if let Some(journal) = &self.journal {
            journal
                .record_fill(BrokerKind::Oanda.as_str(), intent, &position)
                .await
                .map_err(Self::journal_error)?;
        }
        Ok(position)
    }

    async fn refresh_mark_to_market(
        &self,
        instrument: &str,
        price: f64,
        at: DateTime<Utc>,
    ) -> BrokerResult<Vec<Position>> {
        let settled = self.reconcile(at).await?;

        let mut mirror = self.mirror.lock().await;
        mirror.mark(instrument, price, at);
        if let Some(journal) = &self.journal {
            let marked: Vec<Position> = mirror
                .open_positions(None)
                .into_iter()
                .filter(|p| p.instrument == instrument)
                .collect();
            journal.record_marks(&marked).await.map_err(Self::journal_error)?;
        }
        Ok(settled)
    }

    async fn close_position(&self, position_id: &str, reason: ExitReason) -> BrokerResult<Position> {
        let (mark_at, already_closed) = {
            let mirror = self.mirror.lock().await;
            let position = mirror.get(position_id)?;
            let at = mirror
                .last_mark(&position.instrument)
                .map(|m| m.at)
                .unwrap_or(position.opened_at);
            (at, !position.is_open())
        };
        if already_closed {
            return Err(BrokerError::AlreadyClosed(position_id.to_string()));
        }

        let path = self
            .client
            .account_path(&format!("/trades/{}/close", position_id));
        let body = match self
            .client
            .request(Method::PUT, &path, &[], Some(&json!({ "units": "ALL" })))
            .await
        {
            Ok(body) => body,
            // NO_SUCH_TRADE: a stop or target filled remotely first.
            Err(BrokerError::Rejected { status: 404, body }) => {
                warn!("OANDA trade {} is gone ({}), settling", position_id, body);
                return self.settle_remote_close(position_id, mark_at).await;
            }
            Err(e) => return Err(e),
        };
        let exit_price = body
            .get("orderFillTransaction")
            .ok_or_else(|| BrokerError::InvalidResponse("missing orderFillTransaction".to_string()))
            .and_then(|fill| decimal_field(fill, "price"))?;

        self.seal(position_id, exit_price, mark_at, reason).await
    }

    async fn list_open_positions(&self, run_id: &str) -> BrokerResult<Vec<Position>> {
        Ok(self.mirror.lock().await.open_positions(Some(run_id)))
    }

    async fn list_all_open_positions(&self) -> BrokerResult<Vec<Position>> {
        Ok(self.mirror.lock().await.open_positions(None))
    }

    async fn account_summary(&self) -> BrokerResult<Account> {
        let path = self.client.account_path("/summary");
        let body = self.client.request(Method::GET, &path, &[], None).await?;
        parse_account(&body)
    }

    async fn is_healthy(&self) -> bool {
        match self.account_summary().await {
            Ok(_) => true,
            Err(e) => {
                error!("OANDA health check failed: {}", e);
                false
            }
        }
    }
}
