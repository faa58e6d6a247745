use crate::domain::entities::signal::Direction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Market order derived from an accepted position plan.
///
/// `units` carries the direction sign; `side` repeats it for readability
/// in logs and persisted rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub run_id: String,
    pub instrument: String,
    pub side: Direction,
    pub units: i64,
    pub price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub reason_codes: Vec<String>,
    pub risk_fraction: f64,
    pub submitted_at: DateTime<Utc>,
}

impl OrderIntent {
    pub fn abs_units(&self) -> i64 {
        self.units.abs()
    }

    pub fn notional(&self) -> f64 {
        self.units.abs() as f64 * self.price
    }

    /// Rejects intents whose side and unit sign disagree.
    pub fn validate(&self) -> Result<(), String> {
        if self.units == 0 {
            return Err("units must be non-zero".to_string());
        }
        let consistent = match self.side {
            Direction::Long => self.units > 0,
            Direction::Short => self.units < 0,
            Direction::Flat => false,
        };
        if !consistent {
            return Err(format!(
                "side {} does not match units {}",
                self.side, self.units
            ));
        }
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(format!("invalid price {}", self.price));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(side: Direction, units: i64) -> OrderIntent {
        OrderIntent {
            run_id: "run".to_string(),
            instrument: "EUR_USD".to_string(),
            side,
            units,
            price: 1.1,
            stop_loss: None,
            take_profit: None,
            reason_codes: vec![],
            risk_fraction: 0.01,
            submitted_at: Utc::now(),
        }
    }

    #[test]
    fn test_side_and_sign_must_agree() {
        assert!(intent(Direction::Long, 1_000).validate().is_ok());
        assert!(intent(Direction::Short, -1_000).validate().is_ok());
        assert!(intent(Direction::Long, -1_000).validate().is_err());
        assert!(intent(Direction::Flat, 1_000).validate().is_err());
        assert!(intent(Direction::Long, 0).validate().is_err());
    }

    #[test]
    fn test_notional_uses_magnitude() {
        let order = intent(Direction::Short, -2_000);
        assert_eq!(order.abs_units(), 2_000);
        assert!((order.notional() - 2_200.0).abs() < 1e-9);
    }
}
