use crate::domain::entities::signal::Direction;
use crate::domain::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Boundary tolerance for the drawdown gate.
const DRAWDOWN_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Share of equity allocated to a single trade.
    pub allocation_pct: f64,
    /// Share of the allocation that may be lost at the stop.
    pub risk_pct_per_trade: f64,
    pub max_leverage: f64,
    /// Cap on the summed risk fractions of open positions.
    pub max_exposure: f64,
    pub max_drawdown_stop: f64,
    pub stop_atr_multiple: f64,
    pub target_atr_multiple: f64,
    /// Account-currency value of a one-unit price move per unit held.
    pub pip_value: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        RiskConfig {
            allocation_pct: 0.02,
            risk_pct_per_trade: 0.5,
            max_leverage: 20.0,
            max_exposure: 0.05,
            max_drawdown_stop: 0.2,
            stop_atr_multiple: 1.5,
            target_atr_multiple: 3.0,
            pip_value: 1.0,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fraction_fields = [
            ("allocation_pct", self.allocation_pct),
            ("risk_pct_per_trade", self.risk_pct_per_trade),
            ("max_exposure", self.max_exposure),
            ("max_drawdown_stop", self.max_drawdown_stop),
        ];
        for (field, value) in fraction_fields {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: format!("{} is outside (0, 1]", value),
                });
            }
        }
        let positive_fields = [
            ("max_leverage", self.max_leverage),
            ("stop_atr_multiple", self.stop_atr_multiple),
            ("target_atr_multiple", self.target_atr_multiple),
            ("pip_value", self.pip_value),
        ];
        for (field, value) in positive_fields {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: format!("{} must be positive", value),
                });
            }
        }
        Ok(())
    }
}

/// Why a signal did not become a position plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RiskRejection {
    ZeroUnits,
    LeverageCap { leverage: f64, max_leverage: f64 },
    ExposureCap { exposure: f64, max_exposure: f64 },
    DrawdownStop { drawdown: f64 },
}

impl RiskRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            RiskRejection::ZeroUnits => "zero_units",
            RiskRejection::LeverageCap { .. } => "leverage_cap",
            RiskRejection::ExposureCap { .. } => "exposure_cap",
            RiskRejection::DrawdownStop { .. } => "drawdown_stop",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionPlan {
    /// Signed by direction.
    pub units: i64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub risk_fraction: f64,
    pub leverage: f64,
}

/// Inputs to a sizing decision.
#[derive(Debug, Clone, Copy)]
pub struct SizingRequest {
    pub equity: f64,
    pub price: f64,
    pub direction: Direction,
    pub atr: f64,
    /// Strategy-provided levels; used when they sit on the protective side.
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

/// Sizes trades and tracks peak equity plus open-risk exposure for one session.
#[derive(Debug, Clone)]
pub struct RiskManager {
    config: RiskConfig,
    peak_equity: f64,
    exposure: BTreeMap<String, f64>,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        RiskManager {
            config,
            peak_equity: 0.0,
            exposure: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn peak_equity(&self) -> f64 {
        self.peak_equity
    }

    /// Peak tracking is monotonic non-decreasing.
    pub fn observe_equity(&mut self, equity: f64) {
        if equity.is_finite() && equity > self.peak_equity {
            self.peak_equity = equity;
        }
    }

    pub fn drawdown(&self, equity: f64) -> f64 {
        if self.peak_equity <= 0.0 {
            return 0.0;
        }
        1.0 - equity / self.peak_equity
    }

    pub fn drawdown_breached(&self, equity: f64) -> bool {
        self.drawdown(equity) + DRAWDOWN_EPSILON >= self.config.max_drawdown_stop
    }

    pub fn current_exposure(&self) -> f64 {
        self.exposure.values().sum()
    }

    pub fn open_risk_count(&self) -> usize {
        self.exposure.len()
    }

    pub fn register(&mut self, position_id: &str, risk_fraction: f64) {
        self.exposure.insert(position_id.to_string(), risk_fraction);
    }

    pub fn release(&mut self, position_id: &str) -> Option<f64> {
        self.exposure.remove(position_id)
    }

    /// Replaces the exposure book with the given `(position id, risk fraction)` pairs.
    pub fn reset_exposure<'a, I>(&mut self, open: I)
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        self.exposure = open
            .into_iter()
            .map(|(id, risk)| (id.to_string(), risk))
            .collect();
    }

    pub fn size(&self, req: &SizingRequest) -> Result<PositionPlan, RiskRejection> {
        let cfg = &self.config;
        let sign = req.direction.sign();
        if sign == 0.0 || !(req.equity > 0.0) || !(req.price > 0.0) {
            if self.drawdown_breached(req.equity) {
                return Err(RiskRejection::DrawdownStop {
                    drawdown: self.drawdown(req.equity),
                });
            }
            return Err(RiskRejection::ZeroUnits);
        }

        if self.drawdown_breached(req.equity) {
            let drawdown = self.drawdown(req.equity);
            debug!("Drawdown {:.4} breaches stop {:.4}", drawdown, cfg.max_drawdown_stop);
            return Err(RiskRejection::DrawdownStop { drawdown });
        }

        let allocation = req.equity * cfg.allocation_pct;
        let risk_budget = allocation * cfg.risk_pct_per_trade;

        let stop_distance = match req.stop_loss {
            Some(stop) if (req.price - stop) * sign > 0.0 => (req.price - stop).abs(),
            _ => cfg.stop_atr_multiple * req.atr,
        };
        if !(stop_distance.is_finite() && stop_distance > 0.0) {
            return Err(RiskRejection::ZeroUnits);
        }

        let raw_units = (risk_budget / (stop_distance * cfg.pip_value)).floor();
        if !raw_units.is_finite() || raw_units < 1.0 {
            return Err(RiskRejection::ZeroUnits);
        }
        let units = raw_units as i64;

        let leverage = units as f64 * req.price / req.equity;
        if leverage > cfg.max_leverage {
            return Err(RiskRejection::LeverageCap {
                leverage,
                max_leverage: cfg.max_leverage,
            });
        }

        let risk_fraction = units as f64 * stop_distance * cfg.pip_value / req.equity;
        let exposure = self.current_exposure();
        if exposure + risk_fraction > cfg.max_exposure {
            return Err(RiskRejection::ExposureCap {
                exposure: exposure + risk_fraction,
                max_exposure: cfg.max_exposure,
            });
        }

        let take_profit = match req.take_profit {
            Some(target) if (target - req.price) * sign > 0.0 => target,
            _ => {
                let distance = if req.atr > 0.0 {
                    cfg.target_atr_multiple * req.atr
                } else {
                    stop_distance * cfg.target_atr_multiple / cfg.stop_atr_multiple
                };
                req.price + sign * distance
            }
        };

        Ok(PositionPlan {
            units: if req.direction == Direction::Short { -units } else { units },
            stop_loss: req.price - sign * stop_distance,
            take_profit,
            risk_fraction,
            leverage,
        })
    }
}
