use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{Factor, Regime};

/// Immutable technical/AI/sentiment weighting for one regime.
///
/// Only the weight engine constructs profiles, so every instance sums to 1.0
/// and sits inside the configured bands.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightProfile {
    technical: f64,
    ai: f64,
    sentiment: f64,
    regime: Regime,
    version: u64,
    created_at: DateTime<Utc>,
}

impl WeightProfile {
    pub(crate) fn new(
        [technical, ai, sentiment]: [f64; 3],
        regime: Regime,
        version: u64,
    ) -> Self {
        Self {
            technical,
            ai,
            sentiment,
            regime,
            version,
            created_at: Utc::now(),
        }
    }

    pub fn technical(&self) -> f64 {
        self.technical
    }

    pub fn ai(&self) -> f64 {
        self.ai
    }

    pub fn sentiment(&self) -> f64 {
        self.sentiment
    }

    pub fn regime(&self) -> Regime {
        self.regime
    }

    /// Version of the learned snapshot this profile was derived from.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn as_array(&self) -> [f64; 3] {
        [self.technical, self.ai, self.sentiment]
    }

    pub fn weight(&self, factor: Factor) -> f64 {
        match factor {
            Factor::Technical => self.technical,
            Factor::Ai => self.ai,
            Factor::Sentiment => self.sentiment,
        }
    }

    /// Weights for a single decision where some factors are unavailable.
    ///
    /// Missing factors get zero and their share is spread over the remaining
    /// ones in proportion to their own weight. Returns all zeros if nothing
    /// is available.
    pub fn redistributed(&self, available: &[Factor]) -> [f64; 3] {
        let factors = [Factor::Technical, Factor::Ai, Factor::Sentiment];
        let kept: f64 = factors
            .iter()
            .filter(|f| available.contains(f))
            .map(|f| self.weight(*f))
            .sum();

        if kept <= 0.0 {
            return [0.0; 3];
        }

        factors.map(|f| {
            if available.contains(&f) {
                self.weight(f) / kept
            } else {
                0.0
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redistribution_without_ai() {
        let profile = WeightProfile::new([0.5, 0.3, 0.2], Regime::Bull, 0);

        let w = profile.redistributed(&[Factor::Technical, Factor::Sentiment]);

        assert!((w[0] - 0.5 / 0.7).abs() < 1e-12);
        assert_eq!(w[1], 0.0);
        assert!((w[2] - 0.2 / 0.7).abs() < 1e-12);
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_redistribution_all_available_is_identity() {
        let profile = WeightProfile::new([0.45, 0.33, 0.22], Regime::Volatile, 3);
        let w = profile.redistributed(&[Factor::Technical, Factor::Ai, Factor::Sentiment]);
        for (a, b) in w.iter().zip(profile.as_array()) {
            assert!((a - b).abs() < 1e-12);
        }
    }
}
