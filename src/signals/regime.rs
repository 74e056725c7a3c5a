//! Regime classification from trend, volatility and volume features.

use serde::{Deserialize, Serialize};

use crate::models::Regime;

/// Thresholds for [`RegimeClassifier`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    /// |trend strength| at or above which a market is trending
    pub trend_threshold: f64,

    /// Realized volatility above which a market is VOLATILE
    pub volatility_threshold: f64,

    /// Volume ratio (current / average) below which LOW_VOLUME dominates
    pub volume_floor: f64,

    /// Relative distance to a boundary that counts as "near" it
    pub hysteresis: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            trend_threshold: 0.3,
            volatility_threshold: 0.04,
            volume_floor: 0.5,
            hysteresis: 0.1, // 10% of each threshold
        }
    }
}

/// Feature inputs for one symbol, taken from its longest timeframe with data.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegimeFeatures {
    pub trend_strength: f64,
    pub realized_volatility: f64,
    pub volume_ratio: f64,
}

/// Deterministic rule-based regime labeler.
#[derive(Debug, Clone)]
pub struct RegimeClassifier {
    config: RegimeConfig,
}

impl RegimeClassifier {
    pub fn new(config: RegimeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RegimeConfig {
        &self.config
    }

    /// Label the market.
    ///
    /// Priority: volume, then volatility, then trend, else SIDEWAYS. When the
    /// inputs sit inside the hysteresis band of two or more boundaries at once
    /// the result is TRANSITION, unless volume is clearly below its floor.
    /// Non-finite inputs skip their check.
    pub fn classify(&self, symbol: &str, features: RegimeFeatures) -> Regime {
        let c = &self.config;
        let RegimeFeatures {
            trend_strength: trend,
            realized_volatility: vol,
            volume_ratio: volume,
        } = features;

        let volume_band = c.volume_floor * c.hysteresis;
        let clearly_thin = volume.is_finite() && volume < c.volume_floor - volume_band;

        let near = [
            near(volume, c.volume_floor, c.hysteresis),
            near(vol, c.volatility_threshold, c.hysteresis),
            near(trend.abs(), c.trend_threshold, c.hysteresis),
        ]
        .into_iter()
        .filter(|n| *n)
        .count();

        let regime = if clearly_thin {
            Regime::LowVolume
        } else if near >= 2 {
            Regime::Transition
        } else if volume.is_finite() && volume < c.volume_floor {
            Regime::LowVolume
        } else if vol.is_finite() && vol > c.volatility_threshold {
            Regime::Volatile
        } else if trend.is_finite() && trend >= c.trend_threshold {
            Regime::Bull
        } else if trend.is_finite() && trend <= -c.trend_threshold {
            Regime::Bear
        } else {
            Regime::Sideways
        };

        tracing::debug!(symbol, trend, vol, volume, near, regime = %regime, "Classified regime");
        regime
    }
}

fn near(value: f64, threshold: f64, hysteresis: f64) -> bool {
    value.is_finite() && (value - threshold).abs() <= threshold.abs() * hysteresis
}
