//! HTTP client for the indicator service.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::errors::EngineError;
use crate::models::Timeframe;

use super::types::{IndicatorSnapshot, SentimentResponse};
use super::IndicatorSource;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the indicator and sentiment endpoints (read-only).
pub struct IndicatorClient {
    client: Client,
    base_url: String,
    max_retry: Duration,
}

impl IndicatorClient {
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
impl IndicatorSource for IndicatorClient {
    async fn indicators(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<IndicatorSnapshot>> {
        let url = format!(
            "{}/indicators/{}?timeframe={}",
            self.base_url,
            symbol,
            timeframe.as_str()
        );
        debug!(url = %url, "Fetching indicators");
        get_json(&self.client, &url, "indicator source", self.max_retry).await
    }

    async fn sentiment(&self, symbol: &str) -> Result<Option<f64>> {
        let url = format!("{}/sentiment/{}", self.base_url, symbol);
        debug!(url = %url, "Fetching sentiment");
        let response: Option<SentimentResponse> =
            get_json(&self.client, &url, "sentiment source", self.max_retry).await?;
        Ok(response.map(|r| r.score.clamp(-1.0, 1.0)))
    }
}

/// GET a JSON document, retrying transport errors and 5xx with backoff.
///
/// 404 means "no data" and yields `Ok(None)`; other 4xx fail immediately.
pub(crate) async fn get_json<T: DeserializeOwned>(
    client: &Client,
    url: &str,
    source_name: &'static str,
    max_retry: Duration,
) -> Result<Option<T>> {
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(200))
        .with_max_elapsed_time(Some(max_retry))
        .build();

    backoff::future::retry(policy, || async move {
        let response = client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {source_name}"))
            .map_err(backoff::Error::transient)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = anyhow::Error::new(EngineError::Upstream {
                source_name,
                status: status.as_u16(),
                body,
            });
            return Err(if status.is_server_error() {
                backoff::Error::transient(err)
            } else {
                backoff::Error::permanent(err)
            });
        }

        response
            .json::<T>()
            .await
            .map(Some)
            .with_context(|| format!("Failed to parse {source_name} response"))
            .map_err(backoff::Error::permanent)
    })
    .await
}
