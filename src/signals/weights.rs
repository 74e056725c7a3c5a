//! Adaptive technical/AI/sentiment weighting.
//!
//! A profile starts from static base weights, takes a regime-specific shift,
//! then an optional learned shift, and is finally clamped into per-factor
//! bands and renormalized to sum to exactly 1.

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::models::{LearnedDelta, Regime, WeightProfile};

/// Inclusive [min, max] range for one weight.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Band {
    pub min: f64,
    pub max: f64,
}

impl Band {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, w: f64, eps: f64) -> bool {
        w >= self.min - eps && w <= self.max + eps
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightConfig {
    /// Static [technical, ai, sentiment] weights
    pub base: [f64; 3],

    pub technical_band: Band,
    pub ai_band: Band,
    pub sentiment_band: Band,

    /// Scale of (win rate - 0.5) turned into a weight shift
    pub learning_rate: f64,

    /// Cap on |learned shift|
    pub max_learned_delta: f64,

    /// Samples required before a learned shift applies
    pub min_samples: u32,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            base: [0.50, 0.30, 0.20],
            technical_band: Band::new(0.25, 0.50),
            ai_band: Band::new(0.25, 0.55),
            sentiment_band: Band::new(0.20, 0.30),
            learning_rate: 0.10,
            max_learned_delta: 0.05,
            min_samples: 10,
        }
    }
}

impl WeightConfig {
    pub fn bands(&self) -> [Band; 3] {
        [self.technical_band, self.ai_band, self.sentiment_band]
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let bands = self.bands();
        let min_sum: f64 = bands.iter().map(|b| b.min).sum();
        let max_sum: f64 = bands.iter().map(|b| b.max).sum();
        if bands.iter().any(|b| b.min < 0.0 || b.min > b.max) {
            return Err(EngineError::Config("weight band min must be in [0, max]".into()));
        }
        if min_sum > 1.0 + 1e-9 || max_sum < 1.0 - 1e-9 {
            return Err(EngineError::Config(format!(
                "weight bands cannot sum to 1 (min sum {min_sum:.2}, max sum {max_sum:.2})"
            )));
        }
        if self.base.iter().zip(bands).any(|(w, b)| !b.contains(*w, 1e-9)) {
            return Err(EngineError::Config("base weights must lie inside their bands".into()));
        }
        if (self.base.iter().sum::<f64>() - 1.0).abs() > 1e-6 {
            return Err(EngineError::Config("base weights must sum to 1".into()));
        }
        Ok(())
    }
}

/// Builds weight profiles. Stateless apart from its configuration.
#[derive(Debug, Clone)]
pub struct WeightEngine {
    config: WeightConfig,
}

impl WeightEngine {
    pub fn new(config: WeightConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WeightConfig {
        &self.config
    }

    /// Shift applied on top of the base weights for a regime.
    pub fn regime_shift(regime: Regime) -> [f64; 3] {
        match regime {
            Regime::Bull | Regime::Bear => [0.05, -0.03, -0.02],
            Regime::Volatile => [-0.10, 0.10, 0.0],
            Regime::Sideways | Regime::Transition => [-0.05, 0.05, 0.0],
            Regime::LowVolume => [0.0, -0.05, 0.05],
        }
    }

    /// Learned shift earned by a recent win rate, zero below `min_samples`.
    pub fn learned_delta(&self, win_rate: f64, samples: u32) -> f64 {
        if samples < self.config.min_samples || !win_rate.is_finite() {
            return 0.0;
        }
        let cap = self.config.max_learned_delta.abs();
        (self.config.learning_rate * (win_rate - 0.5)).clamp(-cap, cap)
    }

    /// Fresh profile for `regime`, optionally shifted by learned performance.
    pub fn weights_for(
        &self,
        regime: Regime,
        learned: Option<&LearnedDelta>,
        version: u64,
    ) -> WeightProfile {
        let shift = Self::regime_shift(regime);
        let mut raw = [0.0; 3];
        for i in 0..3 {
            raw[i] = self.config.base[i] + shift[i];
        }

        if let Some(l) = learned {
            if l.samples >= self.config.min_samples && l.delta.is_finite() {
                let cap = self.config.max_learned_delta.abs();
                let d = l.delta.clamp(-cap, cap);
                raw[0] += d;
                raw[1] -= d;
            }
        }

        WeightProfile::new(fit_to_bands(raw, &self.config.bands()), regime, version)
    }
}

/// Clamp each weight into its band, then spread the residual over the
/// weights in proportion to the room each has left in the needed direction.
pub fn fit_to_bands(raw: [f64; 3], bands: &[Band; 3]) -> [f64; 3] {
    let mut w = [0.0; 3];
    for i in 0..3 {
        let v = if raw[i].is_finite() { raw[i] } else { bands[i].min };
        w[i] = v.clamp(bands[i].min, bands[i].max);
    }

    let residual = 1.0 - w.iter().sum::<f64>();
    if residual.abs() < f64::EPSILON {
        return w;
    }

    let room: Vec<f64> = (0..3)
        .map(|i| {
            if residual > 0.0 {
                bands[i].max - w[i]
            } else {
                w[i] - bands[i].min
            }
        })
        .collect();
    let total_room: f64 = room.iter().sum();
    if total_room <= 0.0 {
        return w;
    }

    for i in 0..3 {
        w[i] += residual * room[i] / total_room;
    }
    w
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_valid(profile: &WeightProfile, config: &WeightConfig) {
        let w = profile.as_array();
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-6, "sum {w:?}");
        for (v, band) in w.iter().zip(config.bands()) {
            assert!(band.contains(*v, 1e-9), "{v} outside {band:?}");
        }
    }

    #[test]
    fn test_every_regime_and_delta_yields_valid_profile() {
        let config = WeightConfig::default();
        let engine = WeightEngine::new(config.clone());

        for regime in Regime::ALL {
            for step in -20..=20 {
                let learned = LearnedDelta {
                    samples: 50,
                    win_rate: 0.5,
                    delta: step as f64 * 0.01,
                };
                let profile = engine.weights_for(regime, Some(&learned), 1);
                assert_valid(&profile, &config);
                assert_eq!(profile.regime(), regime);
            }
            assert_valid(&engine.weights_for(regime, None, 0), &config);
        }
    }

    #[test]
    fn test_volatile_shifts_toward_ai() {
        let engine = WeightEngine::new(WeightConfig::default());
        let base = engine.weights_for(Regime::Bull, None, 0);
        let volatile = engine.weights_for(Regime::Volatile, None, 0);

        assert!(volatile.ai() > base.ai());
        assert!(volatile.technical() < base.technical());
    }

    #[test]
    fn test_learned_delta_needs_samples() {
        let engine = WeightEngine::new(WeightConfig::default());
        assert_eq!(engine.learned_delta(0.9, 9), 0.0);
        assert!((engine.learned_delta(0.7, 10) - 0.02).abs() < 1e-12);
        // capped
        assert!((engine.learned_delta(1.0, 100) - 0.05).abs() < 1e-12);
        assert!((engine.learned_delta(0.0, 100) + 0.05).abs() < 1e-12);

        let thin = LearnedDelta {
            samples: 3,
            win_rate: 1.0,
            delta: 0.05,
        };
        assert_eq!(
            engine.weights_for(Regime::Sideways, Some(&thin), 0).as_array(),
            engine.weights_for(Regime::Sideways, None, 0).as_array()
        );
    }

    #[test]
    fn test_fit_to_bands_handles_non_finite() {
        let config = WeightConfig::default();
        let w = fit_to_bands([f64::NAN, 0.3, 0.2], &config.bands());
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_validate_rejects_infeasible_bands() {
        let config = WeightConfig {
            technical_band: Band::new(0.1, 0.2),
            ai_band: Band::new(0.1, 0.2),
            sentiment_band: Band::new(0.1, 0.2),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(WeightConfig::default().validate().is_ok());
    }
}
