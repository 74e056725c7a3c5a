//! Kelly-criterion position sizing.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::models::StrategyStats;

use super::RiskConfig;

/// Where a sizing fraction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingMethod {
    /// Kelly formula on the strategy's history
    Kelly,
    /// Fixed conservative fraction (thin or degenerate history)
    Fallback,
}

/// Fraction of equity to commit, always inside the configured clamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KellySizing {
    pub fraction: f64,
    /// Unclamped formula output, if the formula ran
    pub raw: Option<f64>,
    pub method: SizingMethod,
}

/// Calculator for position sizes.
pub struct PositionSizer {
    config: RiskConfig,
}

impl PositionSizer {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Kelly fraction from a strategy's win probability and payoff ratio.
    ///
    /// f* = (p * b - q) / b
    /// where:
    ///   p = probability of winning
    ///   q = 1 - p
    ///   b = average win / average loss
    ///
    /// Thin (< `kelly_min_samples`) or degenerate (b <= 0, NaN) input uses
    /// the fallback fraction. An unbounded b (no losses yet) reduces to p. The result is clamped to
    /// [`kelly_min_fraction`, `kelly_max_fraction`] in every case, so a
    /// negative edge still sizes at the floor.
    pub fn kelly_fraction(&self, stats: Option<&StrategyStats>) -> KellySizing {
        let (lo, hi) = (self.config.kelly_min_fraction, self.config.kelly_max_fraction);
        let fallback = KellySizing {
            fraction: self.config.kelly_fallback_fraction.clamp(lo, hi),
            raw: None,
            method: SizingMethod::Fallback,
        };

        let Some(s) = stats else {
            return fallback;
        };
        let (p, b) = (s.win_probability, s.payoff_ratio);
        if s.samples < self.config.kelly_min_samples || !p.is_finite() || b.is_nan() || b <= 0.0 {
            return fallback;
        }

        let p = p.clamp(0.0, 1.0);
        let q = 1.0 - p;
        let kelly = if b.is_infinite() { p } else { (p * b - q) / b };

        KellySizing {
            fraction: kelly.clamp(lo, hi),
            raw: Some(kelly),
            method: SizingMethod::Kelly,
        }
    }

    /// Contracts for `fraction` of equity at `leverage`, rounded down.
    pub fn quantity(&self, fraction: f64, leverage: u32, entry_price: Decimal) -> Decimal {
        if entry_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let fraction = Decimal::from_f64(fraction).unwrap_or(Decimal::ZERO);
        let margin = self.config.account_equity * fraction;
        let notional = margin * Decimal::from(leverage);

        (notional / entry_price)
            .round_dp_with_strategy(self.config.quantity_decimals, RoundingStrategy::ToZero)
    }

    /// Margin committed by a quantity at a given leverage.
    pub fn margin_for(&self, quantity: Decimal, entry_price: Decimal, leverage: u32) -> Decimal {
        if leverage == 0 {
            return Decimal::ZERO;
        }
        quantity * entry_price / Decimal::from(leverage)
    }

    /// Share of equity a margin amount represents.
    pub fn equity_share(&self, margin: Decimal) -> f64 {
        if self.config.account_equity <= Decimal::ZERO {
            return 0.0;
        }
        (margin / self.config.account_equity).to_f64().unwrap_or(0.0)
    }
}
