//! Per-timeframe technical scoring as a declarative rule table.

use serde::{Deserialize, Serialize};

use crate::api::IndicatorSnapshot;
use crate::models::{Direction, Timeframe, TimeframeSignal};

/// One scoring rule: the vote is +1 (bullish), -1 (bearish), 0 (no opinion)
/// or `None` when its inputs are missing.
pub struct ScoringRule {
    pub name: &'static str,
    pub weight: f64,
    pub vote: fn(&IndicatorSnapshot) -> Option<f64>,
}

pub const RULES: &[ScoringRule] = &[
    ScoringRule {
        name: "ema_cross",
        weight: 0.25,
        vote: |s| Some(cmp_sign(s.ema_fast?, s.ema_slow?)),
    },
    ScoringRule {
        name: "price_vs_slow_ema",
        weight: 0.15,
        vote: |s| Some(cmp_sign(s.price, s.ema_slow?)),
    },
    ScoringRule {
        name: "rsi_extremes",
        weight: 0.20,
        vote: |s| {
            let rsi = s.rsi.filter(|r| r.is_finite())?;
            Some(if rsi < 30.0 {
                1.0
            } else if rsi > 70.0 {
                -1.0
            } else {
                0.0
            })
        },
    },
    ScoringRule {
        name: "macd_histogram",
        weight: 0.20,
        vote: |s| {
            let h = s.macd_histogram.filter(|h| h.is_finite())?;
            Some(if h > 0.0 {
                1.0
            } else if h < 0.0 {
                -1.0
            } else {
                0.0
            })
        },
    },
    ScoringRule {
        name: "bollinger_touch",
        weight: 0.10,
        vote: |s| {
            let (upper, lower) = (s.bb_upper?, s.bb_lower?);
            Some(if s.price <= lower {
                1.0
            } else if s.price >= upper {
                -1.0
            } else {
                0.0
            })
        },
    },
    ScoringRule {
        name: "trend_strength",
        weight: 0.10,
        vote: |s| {
            let t = s.trend_strength.filter(|t| t.is_finite())?;
            Some(if t.abs() < 0.1 { 0.0 } else { t.signum() })
        },
    },
];

fn cmp_sign<T: PartialOrd>(a: T, b: T) -> f64 {
    if a > b {
        1.0
    } else if a < b {
        -1.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// |score| below this is NEUTRAL
    pub neutral_band: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self { neutral_band: 0.15 }
    }
}

/// Sum of rule votes, clamped to [-1, 1]; `None` if no rule could run.
pub fn technical_score(snapshot: &IndicatorSnapshot) -> Option<f64> {
    let mut evaluated = 0;
    let mut score = 0.0;
    for rule in RULES {
        if let Some(vote) = (rule.vote)(snapshot) {
            evaluated += 1;
            score += rule.weight * vote;
        }
    }
    (evaluated > 0).then(|| score.clamp(-1.0, 1.0))
}

/// Score one timeframe into a directional vote.
pub fn score_timeframe(
    symbol: &str,
    timeframe: Timeframe,
    importance: f64,
    snapshot: &IndicatorSnapshot,
    config: &ScoringConfig,
) -> Option<TimeframeSignal> {
    let score = technical_score(snapshot)?;
    let direction = if score >= config.neutral_band {
        Direction::Buy
    } else if score <= -config.neutral_band {
        Direction::Sell
    } else {
        Direction::Neutral
    };

    Some(TimeframeSignal {
        symbol: symbol.to_string(),
        timeframe,
        direction,
        strength: score.abs(),
        importance: importance.max(0.0),
        score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_rule_weights_sum_to_one() {
        let total: f64 = RULES.iter().map(|r| r.weight).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_bullish_snapshot_scores_buy() {
        let snapshot = IndicatorSnapshot {
            price: dec!(105),
            ema_fast: Some(dec!(104)),
            ema_slow: Some(dec!(100)),
            rsi: Some(55.0),
            macd_histogram: Some(0.8),
            trend_strength: Some(0.5),
            ..Default::default()
        };

        let signal = score_timeframe("BTCUSDT", Timeframe::H1, 2.0, &snapshot, &ScoringConfig::default())
            .unwrap();

        // 0.25 + 0.15 + 0 + 0.20 + 0.10
        assert!((signal.score - 0.70).abs() < 1e-9);
        assert_eq!(signal.direction, Direction::Buy);
        assert!((signal.strength - 0.70).abs() < 1e-9);
        assert_eq!(signal.importance, 2.0);
    }

    #[test]
    fn test_mixed_snapshot_is_neutral() {
        let snapshot = IndicatorSnapshot {
            price: dec!(100),
            ema_fast: Some(dec!(101)),
            ema_slow: Some(dec!(99)),
            macd_histogram: Some(-0.2),
            rsi: Some(75.0),
            ..Default::default()
        };
        // 0.25 + 0.15 - 0.20 - 0.20
        let signal = score_timeframe("X", Timeframe::M15, 1.0, &snapshot, &ScoringConfig::default())
            .unwrap();
        assert_eq!(signal.direction, Direction::Neutral);
    }

    #[test]
    fn test_no_evaluable_rule_means_no_data() {
        let snapshot = IndicatorSnapshot {
            price: dec!(100),
            ..Default::default()
        };
        assert!(technical_score(&snapshot).is_none());
    }
}
