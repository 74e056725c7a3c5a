//! Risk and scan configuration.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::models::Timeframe;

/// One volatility bucket of the base-leverage table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LeverageBucket {
    /// Upper (exclusive) realized volatility for this bucket
    pub max_volatility: f64,
    pub leverage: u32,
}

/// Configuration for sizing, leverage, and exits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Account equity used for sizing, in quote currency
    pub account_equity: Decimal,

    /// Kelly fraction floor
    pub kelly_min_fraction: f64,

    /// Kelly fraction ceiling
    pub kelly_max_fraction: f64,

    /// Fraction used when Kelly inputs are insufficient
    pub kelly_fallback_fraction: f64,

    /// Closed trades needed before Kelly inputs are trusted
    pub kelly_min_samples: u32,

    /// Exchange leverage bounds
    pub min_leverage: u32,
    pub max_leverage: u32,

    /// Base leverage by volatility, ascending
    pub volatility_buckets: Vec<LeverageBucket>,

    /// Base leverage above the last bucket
    pub high_volatility_leverage: u32,

    /// Confidence for +2x and +1x
    pub high_confidence: f64,
    pub medium_confidence: f64,

    /// Distance to support/resistance counted as clear (+1x)
    pub structure_clear_pct: f64,

    /// Distance to support/resistance counted as cramped (-1x)
    pub structure_tight_pct: f64,

    /// Leverage removed per open position in the same cluster
    pub correlation_penalty: u32,

    /// Open positions per cluster at which new proposals are blocked
    pub max_correlated_positions: usize,

    /// Cluster margin over equity above which leverage drops to the minimum
    pub max_cluster_margin_pct: f64,

    /// Base asset to cluster overrides, e.g. ARB -> ETH
    pub clusters: BTreeMap<String, String>,

    /// Timeframe whose ATR drives stops
    pub atr_timeframe: Timeframe,

    /// Trailing stop distance in ATRs
    pub trailing_atr_multiplier: Decimal,

    /// Initial stop and target distances in ATRs
    pub atr_stop_multiplier: Decimal,
    pub atr_target_multiplier: Decimal,

    /// Minimum reward / risk for a proposal
    pub min_risk_reward: f64,

    /// Return thresholds for partial profit-taking, ascending
    pub profit_targets: Vec<f64>,

    /// Fraction of the initial quantity closed at each target
    pub profit_take_fraction: Decimal,

    /// Maintenance margin rate used to approximate liquidation distance
    pub maintenance_margin: f64,

    /// Share of the liquidation distance the stop may use
    pub liquidation_buffer: f64,

    /// Quantity precision
    pub quantity_decimals: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        let clusters = [("ARB", "ETH"), ("OP", "ETH"), ("WBTC", "BTC"), ("STETH", "ETH")]
            .into_iter()
            .map(|(base, cluster)| (base.to_string(), cluster.to_string()))
            .collect();

        Self {
            account_equity: dec!(10000),
            kelly_min_fraction: 0.01,
            kelly_max_fraction: 0.25,
            kelly_fallback_fraction: 0.02, // 2% when history is thin
            kelly_min_samples: 10,
            min_leverage: 2,
            max_leverage: 20,
            volatility_buckets: vec![
                LeverageBucket { max_volatility: 0.02, leverage: 10 },
                LeverageBucket { max_volatility: 0.04, leverage: 7 },
                LeverageBucket { max_volatility: 0.07, leverage: 5 },
            ],
            high_volatility_leverage: 3,
            high_confidence: 0.85,
            medium_confidence: 0.70,
            structure_clear_pct: 0.015,
            structure_tight_pct: 0.005,
            correlation_penalty: 1,
            max_correlated_positions: 3,
            max_cluster_margin_pct: 0.30,
            clusters,
            atr_timeframe: Timeframe::H1,
            trailing_atr_multiplier: dec!(2),
            atr_stop_multiplier: dec!(2),
            atr_target_multiplier: dec!(4),
            min_risk_reward: 1.5,
            profit_targets: vec![0.015, 0.03, 0.05],
            profit_take_fraction: dec!(0.25),
            maintenance_margin: 0.005,
            liquidation_buffer: 0.8,
            quantity_decimals: 3,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.min_leverage == 0 || self.min_leverage > self.max_leverage {
            return Err(EngineError::Config(format!(
                "leverage bounds invalid: [{}, {}]",
                self.min_leverage, self.max_leverage
            )));
        }
        if !(self.kelly_min_fraction > 0.0 && self.kelly_min_fraction <= self.kelly_max_fraction) {
            return Err(EngineError::Config("kelly fraction bounds invalid".into()));
        }
        if self.profit_targets.len() > 8 {
            return Err(EngineError::Config("at most 8 profit targets are supported".into()));
        }
        if self.profit_targets.windows(2).any(|w| w[0] >= w[1])
            || self.profit_targets.iter().any(|t| *t <= 0.0)
        {
            return Err(EngineError::Config("profit targets must be positive and ascending".into()));
        }
        if self.volatility_buckets.windows(2).any(|w| w[0].max_volatility >= w[1].max_volatility) {
            return Err(EngineError::Config("volatility buckets must be ascending".into()));
        }
        if !(self.liquidation_buffer > 0.0 && self.liquidation_buffer <= 1.0) {
            return Err(EngineError::Config("liquidation buffer must be in (0, 1]".into()));
        }
        if self.account_equity <= Decimal::ZERO {
            return Err(EngineError::Config("account equity must be positive".into()));
        }
        Ok(())
    }
}

/// Scan pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Symbols scanned when none are given
    pub symbols: Vec<String>,

    /// Timeframes scanned when none are given
    pub timeframes: Vec<Timeframe>,

    /// Symbols processed in parallel
    pub concurrency: usize,

    /// Deadline for all external calls of one scan
    pub timeout_secs: u64,

    /// Composite factor score a directional signal needs for a proposal
    pub min_composite_score: f64,

    /// Strategy tag used for learning and Kelly statistics
    pub strategy: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".into(), "ETHUSDT".into(), "SOLUSDT".into()],
            timeframes: Timeframe::DEFAULT_SCAN.to_vec(),
            concurrency: 4,
            timeout_secs: 10,
            min_composite_score: 0.0,
            strategy: "mtf_confluence".into(),
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.concurrency == 0 || self.timeout_secs == 0 {
            return Err(EngineError::Config("scan concurrency and timeout must be > 0".into()));
        }
        if self.strategy.trim().is_empty() {
            return Err(EngineError::Config("scan strategy tag must not be empty".into()));
        }
        Ok(())
    }
}
