use crate::domain::entities::account::Account;
use crate::domain::entities::order::OrderIntent;
use crate::domain::entities::position::{ExitReason, Position, PositionStatus};
use crate::domain::errors::BrokerError;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mark {
    pub price: f64,
    pub at: DateTime<Utc>,
}

/// Deterministic in-memory account and position book.
///
/// Balance moves only when a position closes; marking to market touches
/// unrealized PnL alone. Ids are sequential so two ledgers fed the same
/// orders produce identical books.
#[derive(Debug, Clone)]
pub struct PaperLedger {
    balance: f64,
    margin_rate: f64,
    positions: Vec<Position>,
    index: HashMap<String, usize>,
    /// Ids of closed positions already moved out by `prune_closed`.
    pruned: HashSet<String>,
    marks: HashMap<String, Mark>,
    next_seq: u64,
    id_prefix: String,
}

impl PaperLedger {
    pub fn new(initial_balance: f64, margin_rate: f64) -> Self {
        PaperLedger {
            balance: initial_balance,
            margin_rate,
            positions: Vec::new(),
            index: HashMap::new(),
            pruned: HashSet::new(),
            marks: HashMap::new(),
            next_seq: 1,
            id_prefix: String::new(),
        }
    }

    /// Prefixes generated ids, keeping them unique across process restarts
    /// when positions are journaled.
    pub fn with_id_prefix(mut self, prefix: &str) -> Self {
        self.id_prefix = prefix.to_string();
        self
    }

    pub fn open(
        &mut self,
        intent: &OrderIntent,
        fill_price: f64,
        filled_at: DateTime<Utc>,
    ) -> Result<Position, BrokerError> {
        let order_id = format!("{}ord-{:06}", self.id_prefix, self.next_seq);
        let position_id = format!("{}pos-{:06}", self.id_prefix, self.next_seq);
        self.open_with_ids(intent, fill_price, filled_at, order_id, position_id)
    }

    /// Books a filled order under ids assigned elsewhere, e.g. by a remote broker.
    pub fn open_with_ids(
        &mut self,
        intent: &OrderIntent,
        fill_price: f64,
        filled_at: DateTime<Utc>,
        order_id: String,
        position_id: String,
    ) -> Result<Position, BrokerError> {
        intent.validate().map_err(BrokerError::InvalidOrder)?;
        if self.index.contains_key(&position_id) || self.pruned.contains(&position_id) {
            return Err(BrokerError::InvalidOrder(format!(
                "duplicate position id {}",
                position_id
            )));
        }
        if !(fill_price.is_finite() && fill_price > 0.0) {
            return Err(BrokerError::InvalidOrder(format!("fill price {}", fill_price)));
        }

        let position = Position {
            id: position_id,
            run_id: intent.run_id.clone(),
            order_id,
            instrument: intent.instrument.clone(),
            side: intent.side,
            entry_price: fill_price,
            units: intent.abs_units(),
            stop_loss: intent.stop_loss,
            take_profit: intent.take_profit,
            status: PositionStatus::Open,
            exit_price: None,
            exit_reason: None,
            opened_at: filled_at,
            closed_at: None,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            risk_fraction: intent.risk_fraction,
        };
        self.next_seq += 1;

        self.marks.entry(intent.instrument.clone()).or_insert(Mark {
            price: fill_price,
            at: filled_at,
        });
        self.index.insert(position.id.clone(), self.positions.len());
        self.positions.push(position.clone());
        Ok(position)
    }

    pub fn mark(&mut self, instrument: &str, price: f64, at: DateTime<Utc>) {
        self.marks.insert(instrument.to_string(), Mark { price, at });
        for position in self
            .positions
            .iter_mut()
            .filter(|p| p.is_open() && p.instrument == instrument)
        {
            position.mark(price);
        }
    }

    pub fn last_mark(&self, instrument: &str) -> Option<Mark> {
        self.marks.get(instrument).copied()
    }

    /// Closes at the latest mark for the position's instrument.
    pub fn close(&mut self, position_id: &str, reason: ExitReason) -> Result<Position, BrokerError> {
        let instrument = self.get(position_id)?.instrument.clone();
        let mark = self
            .last_mark(&instrument)
            .ok_or(BrokerError::NoMarkPrice(instrument))?;
        self.close_at(position_id, mark.price, mark.at, reason)
    }

    pub fn close_at(
        &mut self,
        position_id: &str,
        exit_price: f64,
        at: DateTime<Utc>,
        reason: ExitReason,
    ) -> Result<Position, BrokerError> {
        let idx = self.slot(position_id)?;
        let position = &mut self.positions[idx];
        let realized = position.close(exit_price, at, reason)?;
        self.balance += realized;
        Ok(position.clone())
    }

    /// Looks a position up; a pruned one reports `AlreadyClosed`.
    pub fn get(&self, position_id: &str) -> Result<&Position, BrokerError> {
        self.slot(position_id).map(|idx| &self.positions[idx])
    }

    fn slot(&self, position_id: &str) -> Result<usize, BrokerError> {
        match self.index.get(position_id) {
            Some(&idx) => Ok(idx),
            None if self.pruned.contains(position_id) => {
                Err(BrokerError::AlreadyClosed(position_id.to_string()))
            }
            None => Err(BrokerError::UnknownPosition(position_id.to_string())),
        }
    }

    /// Moves closed positions out of the book and returns them. Long-lived
    /// brokers call this once a close is journaled; only the id is kept.
    pub fn prune_closed(&mut self) -> Vec<Position> {
        let (closed, open): (Vec<Position>, Vec<Position>) = std::mem::take(&mut self.positions)
            .into_iter()
            .partition(|p| !p.is_open());
        self.positions = open;
        self.index = self
            .positions
            .iter()
            .enumerate()
            .map(|(idx, p)| (p.id.clone(), idx))
            .collect();
        self.pruned.extend(closed.iter().map(|p| p.id.clone()));
        closed
    }

    /// Open positions in opening order, optionally restricted to one run.
    pub fn open_positions(&self, run_id: Option<&str>) -> Vec<Position> {
        self.positions
            .iter()
            .filter(|p| p.is_open() && run_id.map_or(true, |id| p.run_id == id))
            .cloned()
            .collect()
    }

    pub fn closed_positions(&self) -> Vec<Position> {
        self.positions
            .iter()
            .filter(|p| !p.is_open())
            .cloned()
            .collect()
    }

    pub fn account(&self) -> Account {
        let open = self.positions.iter().filter(|p| p.is_open());
        let (unrealized, margin_used) = open.fold((0.0, 0.0), |(pnl, margin), p| {
            (
                pnl + p.unrealized_pnl,
                margin + p.units.unsigned_abs() as f64 * p.entry_price * self.margin_rate,
            )
        });
        let equity = self.balance + unrealized;
        Account {
            balance: self.balance,
            equity,
            margin_used,
            free_margin: (equity - margin_used).max(0.0),
        }
    }
}
