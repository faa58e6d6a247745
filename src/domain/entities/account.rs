use serde::{Deserialize, Serialize};

/// Snapshot of the trading account.
///
/// `equity = balance + Σ unrealized_pnl` over open positions. Negative
/// equity is allowed; the risk manager surfaces it as a drawdown breach.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub balance: f64,
    pub equity: f64,
    pub margin_used: f64,
    pub free_margin: f64,
}

impl Account {
    pub fn new(balance: f64) -> Self {
        Account {
            balance,
            equity: balance,
            margin_used: 0.0,
            free_margin: balance,
        }
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.equity - self.balance
    }
}
