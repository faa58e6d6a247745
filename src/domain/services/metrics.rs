use crate::domain::entities::candle::Timeframe;
use crate::domain::entities::position::Position;
use crate::domain::entities::run::EquityPoint;
use serde::{Deserialize, Serialize};

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Summary statistics of a backtest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub cagr: f64,
    /// Largest peak-to-trough decline as a positive fraction.
    pub max_drawdown: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub win_rate: f64,
    /// Gross profit over gross loss; `None` when no trade lost money.
    pub profit_factor: Option<f64>,
    /// Fraction of bars with at least one open position.
    pub exposure: f64,
    pub trade_count: usize,
}

/// Annualization factor: trading days times bars per day.
pub fn periods_per_year(timeframe: Timeframe) -> f64 {
    match timeframe {
        Timeframe::D => TRADING_DAYS_PER_YEAR,
        tf => TRADING_DAYS_PER_YEAR * tf.bars_per_day(),
    }
}

impl PerformanceMetrics {
    pub fn compute(
        equity_curve: &[EquityPoint],
        trades: &[Position],
        initial_equity: f64,
        timeframe: Timeframe,
        exposed_bars: usize,
    ) -> Self {
        let periods = periods_per_year(timeframe);
        let final_equity = equity_curve
            .last()
            .map(|p| p.equity)
            .unwrap_or(initial_equity);

        let total_return = if initial_equity > 0.0 {
            final_equity / initial_equity - 1.0
        } else {
            0.0
        };

        let years = equity_curve.len() as f64 / periods;
        let cagr = if years > 0.0 && total_return > -1.0 {
            (1.0 + total_return).powf(1.0 / years) - 1.0
        } else if total_return <= -1.0 {
            -1.0
        } else {
            0.0
        };

        let (sharpe, sortino) = risk_adjusted(equity_curve, initial_equity, periods);

        let mut wins = 0usize;
        let mut gross_profit = 0.0_f64;
        let mut gross_loss = 0.0_f64;
        for trade in trades {
            if trade.realized_pnl > 0.0 {
                wins += 1;
                gross_profit += trade.realized_pnl;
            } else {
                gross_loss += trade.realized_pnl.abs();
            }
        }

        let win_rate = if trades.is_empty() {
            0.0
        } else {
            wins as f64 / trades.len() as f64
        };
        let profit_factor = if gross_loss > 0.0 {
            Some(gross_profit / gross_loss)
        } else {
            None
        };
        let exposure = if equity_curve.is_empty() {
            0.0
        } else {
            exposed_bars as f64 / equity_curve.len() as f64
        };

        PerformanceMetrics {
            total_return,
            cagr,
            max_drawdown: max_drawdown(equity_curve),
            sharpe,
            sortino,
            win_rate,
            profit_factor,
            exposure,
            trade_count: trades.len(),
        }
    }
}

pub fn max_drawdown(equity_curve: &[EquityPoint]) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut max_dd = 0.0_f64;
    for point in equity_curve {
        if point.equity > peak {
            peak = point.equity;
        } else if peak > 0.0 {
            max_dd = max_dd.max((peak - point.equity) / peak);
        }
    }
    max_dd
}

fn period_returns(equity_curve: &[EquityPoint], initial_equity: f64) -> Vec<f64> {
    let mut previous = initial_equity;
    let mut returns = Vec::with_capacity(equity_curve.len());
    for point in equity_curve {
        returns.push(if previous > 0.0 {
            point.equity / previous - 1.0
        } else {
            0.0
        });
        previous = point.equity;
    }
    returns
}

fn risk_adjusted(equity_curve: &[EquityPoint], initial_equity: f64, periods: f64) -> (f64, f64) {
    let returns = period_returns(equity_curve, initial_equity);
    if returns.len() < 2 {
        return (0.0, 0.0);
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let std = (returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n).sqrt();
    let downside = (returns.iter().map(|r| r.min(0.0).powi(2)).sum::<f64>() / n).sqrt();

    let sharpe = if std > 0.0 { periods.sqrt() * mean / std } else { 0.0 };
    let sortino = if downside > 0.0 {
        periods.sqrt() * mean / downside
    } else {
        0.0
    };
    (sharpe, sortino)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::position::PositionStatus;
    use crate::domain::entities::signal::Direction;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone, Utc};

    fn curve(values: &[f64]) -> Vec<EquityPoint> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, &equity)| EquityPoint {
                timestamp: start + Duration::days(i as i64),
                equity,
            })
            .collect()
    }

    fn trade(pnl: f64) -> Position {
        Position {
            id: "pos".to_string(),
            run_id: "backtest".to_string(),
            order_id: "ord".to_string(),
            instrument: "EUR_USD".to_string(),
            side: Direction::Long,
            entry_price: 1.0,
            units: 1,
            stop_loss: None,
            take_profit: None,
            status: PositionStatus::Closed,
            exit_price: Some(1.0),
            exit_reason: None,
            opened_at: Utc::now(),
            closed_at: Some(Utc::now()),
            realized_pnl: pnl,
            unrealized_pnl: 0.0,
            risk_fraction: 0.0,
        }
    }

    #[test]
    fn test_empty_inputs() {
        let m = PerformanceMetrics::compute(&[], &[], 100_000.0, Timeframe::D, 0);
        assert_eq!(m.total_return, 0.0);
        assert_eq!(m.cagr, 0.0);
        assert_eq!(m.max_drawdown, 0.0);
        assert_eq!(m.win_rate, 0.0);
        assert_eq!(m.profit_factor, None);
        assert_eq!(m.exposure, 0.0);
    }

    #[test]
    fn test_max_drawdown_is_positive_fraction() {
        let dd = max_drawdown(&curve(&[100.0, 120.0, 90.0, 130.0, 117.0]));
        assert_relative_eq!(dd, 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_cagr_over_one_year_of_daily_bars() {
        let mut values = vec![100.0; 251];
        values.push(110.0);
        let m = PerformanceMetrics::compute(&curve(&values), &[], 100.0, Timeframe::D, 0);
        assert_relative_eq!(m.total_return, 0.1, epsilon = 1e-12);
        assert_relative_eq!(m.cagr, 0.1, epsilon = 1e-9);
    }

    #[test]
    fn test_trade_statistics() {
        let trades = vec![trade(300.0), trade(-100.0), trade(100.0), trade(0.0)];
        let m = PerformanceMetrics::compute(&curve(&[100.0, 101.0]), &trades, 100.0, Timeframe::H1, 1);
        assert_relative_eq!(m.win_rate, 0.5);
        assert_relative_eq!(m.profit_factor.unwrap(), 4.0);
        assert_relative_eq!(m.exposure, 0.5);
        assert_eq!(m.trade_count, 4);
    }

    #[test]
    fn test_sharpe_and_sortino_signs() {
        let rising = curve(&[100.0, 101.0, 103.0, 102.5, 105.0]);
        let m = PerformanceMetrics::compute(&rising, &[], 100.0, Timeframe::D, 0);
        assert!(m.sharpe > 0.0);
        assert!(m.sortino > 0.0);

        let steady = curve(&[100.0, 100.0, 100.0]);
        let m = PerformanceMetrics::compute(&steady, &[], 100.0, Timeframe::D, 0);
        assert_eq!(m.sharpe, 0.0);
        assert_eq!(m.sortino, 0.0);
    }

    #[test]
    fn test_periods_per_year() {
        assert_eq!(periods_per_year(Timeframe::D), 252.0);
        assert_eq!(periods_per_year(Timeframe::H1), 252.0 * 24.0);
    }
}
