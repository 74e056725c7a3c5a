//! Line-delimited JSON position feed.
//!
//! Accepts the exchange envelope `{"topic":"position","data":[...]}`, a bare
//! update object, or an array of update objects, one message per line.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::models::RawPositionUpdate;
use crate::positions::{ApplyResult, PositionStore};

/// One position update ready for the store.
#[derive(Debug, Clone)]
pub struct FeedUpdate {
    pub symbol: String,
    pub raw: RawPositionUpdate,
    pub source_ts: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    topic: Option<String>,
    data: Value,
}

/// Counters for a finished feed run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedStats {
    pub lines: u64,
    pub applied: u64,
    pub stale: u64,
    pub malformed: u64,
}

/// Parse one feed message into position updates.
///
/// Updates without a symbol are dropped. The source timestamp comes from
/// `updatedTime` (epoch millis or RFC 3339) and falls back to `received_at`.
pub fn parse_message(line: &str, received_at: DateTime<Utc>) -> Result<Vec<FeedUpdate>> {
    let value: Value = serde_json::from_str(line).context("Feed line is not JSON")?;

    let items = match value {
        Value::Object(ref map) if map.contains_key("data") => {
            let envelope: Envelope = serde_json::from_value(value).context("Bad feed envelope")?;
            if let Some(topic) = envelope.topic.as_deref() {
                if !topic.starts_with("position") {
                    debug!(topic, "Ignoring non-position topic");
                    return Ok(Vec::new());
                }
            }
            match envelope.data {
                Value::Array(items) => items,
                obj @ Value::Object(_) => vec![obj],
                other => return Err(anyhow!("Unexpected feed data: {}", other)),
            }
        }
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        other => return Err(anyhow!("Unexpected feed message: {}", other)),
    };

    let mut updates = Vec::with_capacity(items.len());
    for item in items {
        let raw: RawPositionUpdate =
            serde_json::from_value(item).context("Bad position update")?;
        let Some(symbol) = raw.symbol.clone().filter(|s| !s.trim().is_empty()) else {
            warn!("Position update without symbol, skipping");
            continue;
        };
        let source_ts = source_timestamp(raw.updated_time.as_ref()).unwrap_or(received_at);
        updates.push(FeedUpdate { symbol, raw, source_ts });
    }
    Ok(updates)
}

fn source_timestamp(raw: Option<&Value>) -> Option<DateTime<Utc>> {
    match raw? {
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(ms) = s.parse::<i64>() {
                return Utc.timestamp_millis_opt(ms).single();
            }
            DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc))
        }
        _ => None,
    }
}

/// Apply every line of `reader` to `store` until EOF or shutdown.
///
/// Malformed lines are logged and skipped.
pub async fn run_feed<R>(
    reader: R,
    store: Arc<PositionStore>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<FeedStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut stats = FeedStats::default();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read position feed")?,
            _ = shutdown.changed() => {
                info!("Position feed stopping");
                break;
            }
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        stats.lines += 1;

        let updates = match parse_message(&line, Utc::now()) {
            Ok(updates) => updates,
            Err(e) => {
                stats.malformed += 1;
                warn!(error = %e, "Skipping malformed feed line");
                continue;
            }
        };

        for update in updates {
            match store.apply_update(&update.symbol, &update.raw, update.source_ts) {
                ApplyResult::Applied { .. } => stats.applied += 1,
                ApplyResult::Stale => stats.stale += 1,
            }
        }
    }

    info!(
        lines = stats.lines,
        applied = stats.applied,
        stale = stats.stale,
        malformed = stats.malformed,
        "Position feed finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_exchange_envelope() {
        let line = r#"{"topic":"position","data":[
            {"symbol":"BTCUSDT","side":"Buy","size":"0.5","avgPrice":"50000","markPrice":"50100","updatedTime":"1700000000000"},
            {"symbol":"ETHUSDT","side":"Sell","size":"2","avgPrice":"3000","markPrice":"2990","updatedTime":1700000001000}
        ]}"#;

        let updates = parse_message(line, Utc::now()).unwrap();

        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].symbol, "BTCUSDT");
        assert_eq!(updates[0].source_ts.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(updates[1].source_ts.timestamp_millis(), 1_700_000_001_000);
    }

    #[test]
    fn test_parse_bare_object_uses_receive_time() {
        let received = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let updates =
            parse_message(r#"{"symbol":"solusdt","side":"Buy","size":1,"entryPrice":100}"#, received).unwrap();

        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].source_ts, received);
    }

    #[test]
    fn test_parse_rfc3339_timestamp() {
        let updates = parse_message(
            r#"[{"symbol":"BTCUSDT","size":"0","updatedAt":"2024-01-02T03:04:05Z"}]"#,
            Utc::now(),
        )
        .unwrap();

        assert_eq!(updates[0].source_ts.to_rfc3339(), "2024-01-02T03:04:05+00:00");
    }

    #[test]
    fn test_parse_skips_other_topics_and_missing_symbols() {
        assert!(parse_message(r#"{"topic":"order","data":[{"symbol":"BTCUSDT"}]}"#, Utc::now())
            .unwrap()
            .is_empty());
        assert!(parse_message(r#"{"size":"1"}"#, Utc::now()).unwrap().is_empty());
        assert!(parse_message("not json", Utc::now()).is_err());
    }

    #[tokio::test]
    async fn test_run_feed_applies_lines_and_skips_garbage() {
        let input = concat!(
            r#"{"symbol":"BTCUSDT","side":"Buy","size":"1","avgPrice":"50000","markPrice":"50000","updatedTime":1000}"#,
            "\n",
            "garbage\n",
            "\n",
            r#"{"symbol":"BTCUSDT","side":"Buy","size":"1","avgPrice":"50000","markPrice":"51000","updatedTime":3000}"#,
            "\n",
            r#"{"symbol":"BTCUSDT","side":"Buy","size":"1","avgPrice":"50000","markPrice":"49000","updatedTime":2000}"#,
            "\n",
        );
        let store = Arc::new(PositionStore::new());
        let (_tx, rx) = watch::channel(false);

        let stats = run_feed(input.as_bytes(), store.clone(), rx).await.unwrap();

        assert_eq!(stats.lines, 4);
        assert_eq!(stats.applied, 2);
        assert_eq!(stats.stale, 1);
        assert_eq!(stats.malformed, 1);
        let pos = store.get("BTCUSDT").unwrap();
        assert_eq!(pos.mark_price, dec!(51000));
        assert_eq!(pos.highest_price_since_entry, Some(dec!(51000)));
    }
}
