//! Leverage selection from volatility, confidence, market structure and
//! correlated exposure.

use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::models::Position;

use super::RiskConfig;

const QUOTE_SUFFIXES: [&str; 6] = ["USDT", "USDC", "BUSD", "PERP", "USD", "-"];

/// Market facts the leverage decision needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeverageInputs {
    pub price: Decimal,
    pub volatility: Option<f64>,
    pub confidence: f64,
    pub support: Option<Decimal>,
    pub resistance: Option<Decimal>,
    /// |entry - stop| / entry
    pub stop_distance_pct: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LeverageDecision {
    Selected {
        leverage: u32,
        /// Human-readable adjustment trail for the rationale
        notes: Vec<String>,
    },
    Blocked {
        reason: String,
    },
}

pub struct LeverageSelector {
    config: RiskConfig,
}

impl LeverageSelector {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Base asset cluster of a symbol (BTCUSDT -> BTC, ARBUSDT -> ETH).
    pub fn cluster_of(&self, symbol: &str) -> String {
        let upper = symbol.trim().to_uppercase();
        let mut base = upper.as_str();
        for suffix in QUOTE_SUFFIXES {
            if let Some(stripped) = base.strip_suffix(suffix) {
                if !stripped.is_empty() {
                    base = stripped;
                }
            }
        }
        self.config
            .clusters
            .get(base)
            .cloned()
            .unwrap_or_else(|| base.to_string())
    }

    /// Base leverage for a realized volatility.
    pub fn base_leverage(&self, volatility: Option<f64>) -> u32 {
        let Some(vol) = volatility.filter(|v| v.is_finite() && *v >= 0.0) else {
            return self.config.high_volatility_leverage;
        };
        self.config
            .volatility_buckets
            .iter()
            .find(|b| vol < b.max_volatility)
            .map_or(self.config.high_volatility_leverage, |b| b.leverage)
    }

    /// Highest leverage whose approximate liquidation distance still contains
    /// the stop with the configured buffer.
    pub fn liquidation_cap(&self, stop_distance_pct: f64) -> Option<u32> {
        if !(stop_distance_pct.is_finite() && stop_distance_pct > 0.0) {
            return None;
        }
        let needed = stop_distance_pct / self.config.liquidation_buffer + self.config.maintenance_margin;
        Some((1.0 / needed).floor().max(0.0) as u32)
    }

    /// Choose leverage for a new position in `symbol`.
    ///
    /// `open_positions` must be read from the store at decision time.
    pub fn select(
        &self,
        symbol: &str,
        inputs: &LeverageInputs,
        open_positions: &[Arc<Position>],
    ) -> LeverageDecision {
        let c = &self.config;
        let mut notes = Vec::new();

        let base = self.base_leverage(inputs.volatility);
        let mut lev = base as i64;
        match inputs.volatility {
            Some(v) if v.is_finite() => notes.push(format!("base {base}x (vol {:.1}%)", v * 100.0)),
            _ => notes.push(format!("base {base}x (vol unknown)")),
        }

        if inputs.confidence >= c.high_confidence {
            lev += 2;
            notes.push("+2 confidence".into());
        } else if inputs.confidence >= c.medium_confidence {
            lev += 1;
            notes.push("+1 confidence".into());
        }

        if let Some(distance) = self.structure_distance(inputs) {
            if distance > c.structure_clear_pct {
                lev += 1;
                notes.push(format!("+1 structure {:.1}% clear", distance * 100.0));
            } else if distance < c.structure_tight_pct {
                lev -= 1;
                notes.push(format!("-1 structure {:.2}% tight", distance * 100.0));
            }
        }

        let cluster = self.cluster_of(symbol);
        let correlated: Vec<_> = open_positions
            .iter()
            .filter(|p| p.is_open() && self.cluster_of(&p.symbol) == cluster)
            .collect();

        if correlated.len() >= c.max_correlated_positions {
            return LeverageDecision::Blocked {
                reason: format!(
                    "{} open positions in cluster {cluster} (limit {})",
                    correlated.len(),
                    c.max_correlated_positions
                ),
            };
        }
        if !correlated.is_empty() {
            let penalty = c.correlation_penalty as i64 * correlated.len() as i64;
            lev -= penalty;
            notes.push(format!("-{penalty} cluster {cluster} x{}", correlated.len()));
        }

        let mut lev = lev.clamp(c.min_leverage as i64, c.max_leverage as i64) as u32;

        let cluster_margin: Decimal = correlated.iter().map(|p| p.initial_margin).sum();
        let margin_share = if c.account_equity > Decimal::ZERO {
            (cluster_margin / c.account_equity).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };
        if margin_share > c.max_cluster_margin_pct {
            lev = c.min_leverage;
            notes.push(format!("min leverage: cluster margin {:.0}% of equity", margin_share * 100.0));
        }

        if let Some(cap) = self.liquidation_cap(inputs.stop_distance_pct) {
            if cap < c.min_leverage {
                return LeverageDecision::Blocked {
                    reason: format!(
                        "stop {:.2}% away is beyond liquidation at {}x",
                        inputs.stop_distance_pct * 100.0,
                        c.min_leverage
                    ),
                };
            }
            if lev > cap {
                lev = cap;
                notes.push(format!("capped {cap}x by liquidation distance"));
            }
        }

        LeverageDecision::Selected {
            leverage: lev,
            notes,
        }
    }

    /// Fractional distance from price to the nearest support or resistance.
    fn structure_distance(&self, inputs: &LeverageInputs) -> Option<f64> {
        if inputs.price <= Decimal::ZERO {
            return None;
        }
        [inputs.support, inputs.resistance]
            .into_iter()
            .flatten()
            .filter(|level| *level > Decimal::ZERO)
            .filter_map(|level| ((inputs.price - level).abs() / inputs.price).to_f64())
            .reduce(f64::min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn open(symbol: &str, margin: Decimal) -> Arc<Position> {
        let mut p = Position::flat(symbol, Utc::now());
        p.side = Side::Long;
        p.size = dec!(1);
        p.initial_margin = margin;
        Arc::new(p)
    }

    fn inputs(vol: f64, confidence: f64) -> LeverageInputs {
        LeverageInputs {
            price: dec!(100),
            volatility: Some(vol),
            confidence,
            stop_distance_pct: 0.01,
            ..Default::default()
        }
    }

    fn leverage(d: LeverageDecision) -> u32 {
        match d {
            LeverageDecision::Selected { leverage, .. } => leverage,
            LeverageDecision::Blocked { reason } => panic!("blocked: {reason}"),
        }
    }

    #[test]
    fn test_higher_volatility_lowers_base() {
        let sel = LeverageSelector::new(RiskConfig::default());
        assert_eq!(sel.base_leverage(Some(0.01)), 10);
        assert_eq!(sel.base_leverage(Some(0.03)), 7);
        assert_eq!(sel.base_leverage(Some(0.05)), 5);
        assert_eq!(sel.base_leverage(Some(0.20)), 3);
        assert_eq!(sel.base_leverage(None), 3);
    }

    #[test]
    fn test_confidence_and_structure_adjust_upward() {
        let sel = LeverageSelector::new(RiskConfig::default());
        let mut i = inputs(0.03, 0.9);
        i.support = Some(dec!(95));
        assert_eq!(leverage(sel.select("BTCUSDT", &i, &[])), 7 + 2 + 1);

        i.support = Some(dec!(99.8));
        assert_eq!(leverage(sel.select("BTCUSDT", &i, &[])), 7 + 2 - 1);
    }

    #[test]
    fn test_correlated_positions_reduce_then_block() {
        let sel = LeverageSelector::new(RiskConfig::default());
        let i = inputs(0.01, 0.5);

        let one = vec![open("ETHUSDT", dec!(10))];
        assert_eq!(leverage(sel.select("ARBUSDT", &i, &one)), 9);

        let other_cluster = vec![open("SOLUSDT", dec!(10))];
        assert_eq!(leverage(sel.select("ARBUSDT", &i, &other_cluster)), 10);

        let three = vec![open("ETHUSDT", dec!(1)), open("OPUSDT", dec!(1)), open("ARBUSDT", dec!(1))];
        assert!(matches!(sel.select("ETHUSDT", &i, &three), LeverageDecision::Blocked { .. }));
    }

    #[test]
    fn test_heavy_cluster_margin_forces_minimum() {
        let sel = LeverageSelector::new(RiskConfig::default());
        let heavy = vec![open("BTCUSDT", dec!(5000))];
        assert_eq!(leverage(sel.select("BTCUSDT", &inputs(0.01, 0.9), &heavy)), 2);
    }

    #[test]
    fn test_result_is_clamped_and_liquidation_capped() {
        let sel = LeverageSelector::new(RiskConfig::default());

        let mut wide = inputs(0.01, 0.9);
        // 1 / (0.05 / 0.8 + 0.005) = 14.8
        wide.stop_distance_pct = 0.05;
        assert_eq!(leverage(sel.select("BTCUSDT", &wide, &[])), 12);

        wide.stop_distance_pct = 0.04;
        wide.volatility = Some(0.01);
        wide.support = Some(dec!(80));
        // 10 + 2 + 1 = 13, cap 1 / (0.05 + 0.005) = 18
        assert_eq!(leverage(sel.select("BTCUSDT", &wide, &[])), 13);

        let mut extreme = inputs(0.5, 0.0);
        extreme.stop_distance_pct = 0.5;
        assert!(matches!(sel.select("BTCUSDT", &extreme, &[]), LeverageDecision::Blocked { .. }));
    }

    #[test]
    fn test_cluster_heuristic() {
        let sel = LeverageSelector::new(RiskConfig::default());
        assert_eq!(sel.cluster_of("btcusdt"), "BTC");
        assert_eq!(sel.cluster_of("ARBUSDT"), "ETH");
        assert_eq!(sel.cluster_of("SOL-PERP"), "SOL");
    }
}
