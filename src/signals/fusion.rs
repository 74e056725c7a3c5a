//! Combine the technical, AI and sentiment factors into one composite score.

use crate::models::{Direction, Factor, TimeframeSignal, WeightProfile};

/// Inputs available for a single decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct FactorInputs {
    /// Importance-weighted mean technical score, in [-1, 1]
    pub technical: Option<f64>,
    /// AI bias, in [-1, 1]
    pub ai: Option<f64>,
    /// Sentiment, in [-1, 1]
    pub sentiment: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fusion {
    pub effective_weights: [f64; 3],
    pub composite: f64,
    pub degraded: Vec<Factor>,
}

/// Importance-weighted mean of the per-timeframe scores.
pub fn technical_consensus(votes: &[TimeframeSignal]) -> Option<f64> {
    let total: f64 = votes.iter().map(|v| v.importance.max(0.0)).sum();
    if votes.is_empty() || total <= 0.0 {
        return None;
    }
    let weighted: f64 = votes.iter().map(|v| v.importance.max(0.0) * v.score).sum();
    Some((weighted / total).clamp(-1.0, 1.0))
}

/// Weighted alignment of every available factor with `direction`.
///
/// Missing factors are recorded as degraded and their weight is shared among
/// the others for this decision only. NEUTRAL decisions score 0.
pub fn fuse(direction: Direction, inputs: FactorInputs, profile: &WeightProfile) -> Fusion {
    let factors = [
        (Factor::Technical, inputs.technical),
        (Factor::Ai, inputs.ai),
        (Factor::Sentiment, inputs.sentiment),
    ];

    let mut available = Vec::with_capacity(3);
    let mut degraded = Vec::new();
    for (factor, value) in factors {
        match value.filter(|v| v.is_finite()) {
            Some(_) => available.push(factor),
            None => degraded.push(factor),
        }
    }

    let effective_weights = profile.redistributed(&available);
    let sign = direction.sign();
    let composite = factors
        .iter()
        .zip(effective_weights)
        .filter_map(|((_, value), w)| value.filter(|v| v.is_finite()).map(|v| w * v.clamp(-1.0, 1.0) * sign))
        .sum::<f64>();

    Fusion {
        effective_weights,
        composite,
        degraded,
    }
}
