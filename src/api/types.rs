//! Wire types exchanged with the indicator and commentary services.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Already-computed technical values for one symbol and timeframe.
///
/// Only `price` is required; rules whose inputs are missing are skipped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorSnapshot {
    pub price: Decimal,
    #[serde(default)]
    pub ema_fast: Option<Decimal>,
    #[serde(default)]
    pub ema_slow: Option<Decimal>,
    #[serde(default)]
    pub rsi: Option<f64>,
    #[serde(default)]
    pub macd_histogram: Option<f64>,
    #[serde(default)]
    pub bb_upper: Option<Decimal>,
    #[serde(default)]
    pub bb_lower: Option<Decimal>,
    #[serde(default)]
    pub atr: Option<Decimal>,
    /// Signed trend strength in [-1, 1] (ADX-style magnitude with direction)
    #[serde(default)]
    pub trend_strength: Option<f64>,
    /// Realized volatility as a fraction of price
    #[serde(default)]
    pub realized_volatility: Option<f64>,
    /// Current volume over its moving average
    #[serde(default)]
    pub volume_ratio: Option<f64>,
    #[serde(default)]
    pub support: Option<Decimal>,
    #[serde(default)]
    pub resistance: Option<Decimal>,
}

/// Sentiment score response.
#[derive(Debug, Clone, Deserialize)]
pub struct SentimentResponse {
    /// Bearish -1 to bullish +1
    pub score: f64,
}

/// Commentary from the AI analysis service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiCommentary {
    #[serde(default)]
    pub text: String,
    /// Parsed directional bias, bearish -1 to bullish +1
    #[serde(default)]
    pub bias: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
}
