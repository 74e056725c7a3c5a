//! In-memory market data, loadable from a JSON file for offline scans.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::models::Timeframe;
use crate::positions::normalize_symbol;

use super::types::{AiCommentary, IndicatorSnapshot};
use super::{CommentarySource, IndicatorSource};

/// Canned indicator, sentiment and commentary values keyed by symbol.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticMarketData {
    #[serde(default)]
    indicators: HashMap<String, HashMap<Timeframe, IndicatorSnapshot>>,
    #[serde(default)]
    sentiment: HashMap<String, f64>,
    #[serde(default)]
    commentary: HashMap<String, AiCommentary>,
    #[serde(skip)]
    delay: Option<Duration>,
}

impl StaticMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixtures {}", path.display()))?;
        let mut data: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse fixtures {}", path.display()))?;
        data.indicators = data
            .indicators
            .into_iter()
            .map(|(k, v)| (normalize_symbol(&k), v))
            .collect();
        data.sentiment = data
            .sentiment
            .into_iter()
            .map(|(k, v)| (normalize_symbol(&k), v))
            .collect();
        data.commentary = data
            .commentary
            .into_iter()
            .map(|(k, v)| (normalize_symbol(&k), v))
            .collect();
        Ok(data)
    }

    pub fn with_indicators(mut self, symbol: &str, timeframe: Timeframe, snapshot: IndicatorSnapshot) -> Self {
        self.indicators
            .entry(normalize_symbol(symbol))
            .or_default()
            .insert(timeframe, snapshot);
        self
    }

    pub fn with_sentiment(mut self, symbol: &str, score: f64) -> Self {
        self.sentiment.insert(normalize_symbol(symbol), score);
        self
    }

    pub fn with_commentary(mut self, symbol: &str, commentary: AiCommentary) -> Self {
        self.commentary.insert(normalize_symbol(symbol), commentary);
        self
    }

    /// Delay every answer, to exercise scan deadlines.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<_> = self.indicators.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    async fn pause(&self) {
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
    }
}

#[async_trait]
impl IndicatorSource for StaticMarketData {
    async fn indicators(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<IndicatorSnapshot>> {
        self.pause().await;
        Ok(self
            .indicators
            .get(&normalize_symbol(symbol))
            .and_then(|by_tf| by_tf.get(&timeframe))
            .cloned())
    }

    async fn sentiment(&self, symbol: &str) -> Result<Option<f64>> {
        self.pause().await;
        Ok(self.sentiment.get(&normalize_symbol(symbol)).copied())
    }
}

#[async_trait]
impl CommentarySource for StaticMarketData {
    async fn commentary(&self, symbol: &str) -> Result<Option<AiCommentary>> {
        self.pause().await;
        Ok(self.commentary.get(&normalize_symbol(symbol)).cloned())
    }
}
