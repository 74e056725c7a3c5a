//! Engine configuration: JSON file, then environment overrides, then validation.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::EngineError;
use crate::learning::LearningConfig;
use crate::lifecycle::LifecycleConfig;
use crate::signals::{ConfluenceConfig, RegimeConfig, ScoringConfig, WeightConfig};
use crate::trading::{RiskConfig, ScanConfig};

pub const ENV_INDICATOR_URL: &str = "SIGNALBOT_INDICATOR_URL";
pub const ENV_COMMENTARY_URL: &str = "SIGNALBOT_COMMENTARY_URL";
pub const ENV_ACCOUNT_EQUITY: &str = "SIGNALBOT_ACCOUNT_EQUITY";
pub const ENV_DATABASE: &str = "SIGNALBOT_DATABASE";

/// Upstream service endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub indicator_url: String,
    pub commentary_url: String,
    /// Total retry budget per request
    pub retry_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            indicator_url: "http://localhost:8080".into(),
            commentary_url: "http://localhost:8081".into(),
            retry_secs: 5,
        }
    }
}

/// Every component's configuration; every field has a default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub regime: RegimeConfig,
    pub scoring: ScoringConfig,
    pub weights: WeightConfig,
    pub confluence: ConfluenceConfig,
    pub risk: RiskConfig,
    pub scan: ScanConfig,
    pub lifecycle: LifecycleConfig,
    pub learning: LearningConfig,
    pub endpoints: EndpointConfig,
    /// Overridden by the CLI `--database` flag
    pub database_url: Option<String>,
}

impl EngineConfig {
    /// Load from an optional JSON file, apply `.env` and environment
    /// overrides, and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        // A missing .env file is fine.
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "Loaded .env");
        }
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), EngineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(url) = get(ENV_INDICATOR_URL) {
            self.endpoints.indicator_url = url;
        }
        if let Some(url) = get(ENV_COMMENTARY_URL) {
            self.endpoints.commentary_url = url;
        }
        if let Some(equity) = get(ENV_ACCOUNT_EQUITY) {
            self.risk.account_equity = Decimal::from_str(&equity).map_err(|_| {
                EngineError::Config(format!("{ENV_ACCOUNT_EQUITY} is not a number: {equity}"))
            })?;
        }
        if let Some(db) = get(ENV_DATABASE) {
            self.database_url = Some(db);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.weights.validate()?;
        self.risk.validate()?;
        self.scan.validate()?;
        self.lifecycle.validate()?;
        self.learning.validate()?;

        let c = &self.confluence;
        // At or below one half, a BUY/SELL tie would pass for both directions.
        if !(c.threshold > 0.5 && c.threshold <= 1.0) {
            return Err(EngineError::Config("confluence threshold must be in (0.5, 1]".into()));
        }
        if !(0.0..=1.0).contains(&c.confidence_floor) || c.confidence_floor > c.confidence_ceiling || c.confidence_ceiling > 1.0 {
            return Err(EngineError::Config("confidence floor/ceiling must satisfy 0 <= floor <= ceiling <= 1".into()));
        }
        if c.importance.values().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(EngineError::Config("timeframe importance must be >= 0".into()));
        }

        let r = &self.regime;
        if r.trend_threshold <= 0.0 || r.volatility_threshold <= 0.0 || r.volume_floor < 0.0 || r.hysteresis < 0.0 {
            return Err(EngineError::Config("regime thresholds must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.scoring.neutral_band) {
            return Err(EngineError::Config("neutral band must be in [0, 1)".into()));
        }
        if self.endpoints.retry_secs == 0 {
            return Err(EngineError::Config("endpoint retry budget must be > 0".into()));
        }
        Ok(())
    }
}
