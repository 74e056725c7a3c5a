//! Upstream data sources: indicators, sentiment, AI commentary, and the
//! exchange position feed.

mod commentary_client;
pub mod feed;
mod fixtures;
mod indicator_client;
mod types;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::Timeframe;

pub use commentary_client::CommentaryClient;
pub use fixtures::StaticMarketData;
pub use indicator_client::IndicatorClient;
pub use types::*;

/// Source of pre-computed indicators and sentiment.
///
/// `Ok(None)` means the source has nothing for the request; errors are
/// reserved for transport or decoding failures.
#[async_trait]
pub trait IndicatorSource: Send + Sync {
    async fn indicators(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<IndicatorSnapshot>>;

    /// Bearish -1 to bullish +1.
    async fn sentiment(&self, symbol: &str) -> Result<Option<f64>>;
}

/// Source of AI commentary for a symbol.
#[async_trait]
pub trait CommentarySource: Send + Sync {
    async fn commentary(&self, symbol: &str) -> Result<Option<AiCommentary>>;
}
