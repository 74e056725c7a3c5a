//! Multi-timeframe confluence voting.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{Direction, Timeframe, TimeframeSignal};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfluenceConfig {
    /// Weighted agreement needed to emit a direction
    pub threshold: f64,

    /// Tolerance applied at the threshold, so 0.6 - 1e-12 still passes
    pub epsilon: f64,

    /// Fewer reporting timeframes than this forces NEUTRAL
    pub min_timeframes: usize,

    /// Confidence at exactly `threshold` agreement
    pub confidence_floor: f64,

    /// Confidence at full agreement
    pub confidence_ceiling: f64,

    /// Per-timeframe importance overrides
    pub importance: BTreeMap<Timeframe, f64>,
}

impl Default for ConfluenceConfig {
    fn default() -> Self {
        Self {
            threshold: 0.60,
            epsilon: 1e-9,
            min_timeframes: 2,
            confidence_floor: 0.50,
            confidence_ceiling: 0.95,
            importance: BTreeMap::new(),
        }
    }
}

impl ConfluenceConfig {
    pub fn importance_of(&self, timeframe: Timeframe) -> f64 {
        self.importance
            .get(&timeframe)
            .copied()
            .unwrap_or_else(|| timeframe.default_importance())
    }
}

/// Outcome of a confluence vote.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Confluence {
    pub direction: Direction,
    /// Agreement of the emitted direction, or the best agreement when NEUTRAL
    pub ratio: f64,
    pub confidence: f64,
    /// Timeframes that had data
    pub reporting: usize,
}

impl Confluence {
    fn neutral(ratio: f64, reporting: usize) -> Self {
        Self {
            direction: Direction::Neutral,
            ratio,
            confidence: 0.0,
            reporting,
        }
    }
}

/// Fuse per-timeframe votes.
///
/// Only timeframes that produced a vote are passed in; those lacking data are
/// absent rather than counted as NEUTRAL. NEUTRAL votes are also left out of
/// the denominator.
pub fn aggregate(votes: &[TimeframeSignal], config: &ConfluenceConfig) -> Confluence {
    let reporting = votes.len();

    let weight_for = |d: Direction| -> f64 {
        votes
            .iter()
            .filter(|v| v.direction == d)
            .map(|v| v.importance.max(0.0))
            .sum()
    };
    let buy = weight_for(Direction::Buy);
    let sell = weight_for(Direction::Sell);
    let decided = buy + sell;

    if decided <= 0.0 {
        return Confluence::neutral(0.0, reporting);
    }

    let buy_ratio = buy / decided;
    let sell_ratio = sell / decided;
    let best = buy_ratio.max(sell_ratio);

    if reporting < config.min_timeframes {
        return Confluence::neutral(best, reporting);
    }

    // The winning side must also hold a strict majority, so a tie never picks one.
    let cutoff = config.threshold - config.epsilon;
    let (direction, ratio) = if buy_ratio >= cutoff && buy > sell {
        (Direction::Buy, buy_ratio)
    } else if sell_ratio >= cutoff && sell > buy {
        (Direction::Sell, sell_ratio)
    } else {
        return Confluence::neutral(best, reporting);
    };

    Confluence {
        direction,
        ratio,
        confidence: confidence_for(ratio, config),
        reporting,
    }
}

/// Affine map of agreement in [threshold, 1] onto [floor, ceiling].
pub fn confidence_for(ratio: f64, config: &ConfluenceConfig) -> f64 {
    let span = (1.0 - config.threshold).max(f64::EPSILON);
    let t = ((ratio - config.threshold) / span).clamp(0.0, 1.0);
    config.confidence_floor + (config.confidence_ceiling - config.confidence_floor) * t
}
