//! Trade outcome records and the aggregated performance snapshot.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Regime, Timeframe};

/// Classified result of a closed trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Win,
    Loss,
    Breakeven,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Win => "WIN",
            Self::Loss => "LOSS",
            Self::Breakeven => "BREAKEVEN",
        }
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "WIN" => Ok(Self::Win),
            "LOSS" => Ok(Self::Loss),
            "BREAKEVEN" => Ok(Self::Breakeven),
            other => Err(format!("unknown outcome: {other}")),
        }
    }
}

/// Learning key a trade is tagged with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PerformanceKey {
    pub strategy: String,
    pub regime: Regime,
    pub timeframe: Timeframe,
}

impl fmt::Display for PerformanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.strategy, self.regime, self.timeframe)
    }
}

/// Append-only record of one closed trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub key: PerformanceKey,
    pub symbol: String,
    pub outcome: Outcome,
    pub pnl: Decimal,
    pub closed_at: DateTime<Utc>,
}

/// Recent statistics for a (strategy, regime) pair and the weight shift they earn.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LearnedDelta {
    pub samples: u32,
    pub win_rate: f64,
    /// Shift added to the technical weight and taken from the AI weight
    pub delta: f64,
}

/// Win statistics for one full learning key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KeyStats {
    pub samples: u32,
    pub wins: u32,
    pub losses: u32,
    pub win_rate: f64,
    pub total_pnl: Decimal,
}

/// Kelly inputs for one strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StrategyStats {
    pub samples: u32,
    /// Probability of a winning trade
    pub win_probability: f64,
    /// Average win divided by average loss
    pub payoff_ratio: f64,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub profit_factor: f64,
    pub sharpe_ratio: f64,
}

/// Immutable output of one learning cycle.
#[derive(Debug, Clone, Default)]
pub struct PerformanceSnapshot {
    pub version: u64,
    pub computed_at: Option<DateTime<Utc>>,
    pub by_key: HashMap<PerformanceKey, KeyStats>,
    pub deltas: HashMap<(String, Regime), LearnedDelta>,
    pub strategies: HashMap<String, StrategyStats>,
}

impl PerformanceSnapshot {
    pub fn delta_for(&self, strategy: &str, regime: Regime) -> Option<&LearnedDelta> {
        self.deltas.get(&(strategy.to_string(), regime))
    }

    pub fn strategy(&self, strategy: &str) -> Option<&StrategyStats> {
        self.strategies.get(strategy)
    }
}
