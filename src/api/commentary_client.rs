//! HTTP client for the AI commentary service.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::indicator_client::get_json;
use super::types::AiCommentary;
use super::CommentarySource;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

pub struct CommentaryClient {
    client: Client,
    base_url: String,
    max_retry: Duration,
}

impl CommentaryClient {
    pub fn new(base_url: &str, max_retry: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retry,
        })
    }
}

#[async_trait]
impl CommentarySource for CommentaryClient {
    async fn commentary(&self, symbol: &str) -> Result<Option<AiCommentary>> {
        let url = format!("{}/commentary/{}", self.base_url, symbol);
        debug!(url = %url, "Fetching AI commentary");
        let commentary: Option<AiCommentary> =
            get_json(&self.client, &url, "commentary service", self.max_retry).await?;
        Ok(commentary.map(|mut c| {
            c.bias = c.bias.filter(|b| b.is_finite()).map(|b| b.clamp(-1.0, 1.0));
            c
        }))
    }
}
