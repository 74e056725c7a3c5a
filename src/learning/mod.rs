//! Performance learning loop.
//!
//! Closed trades are appended as outcome records. A periodic cycle turns the
//! recent window into a new [`PerformanceSnapshot`] (per-key win rates, learned
//! weight deltas, Kelly inputs) and publishes it whole; scans pick it up on
//! their next run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::errors::EngineError;
use crate::metrics::MetricsCalculator;
use crate::models::{
    BotSignal, KeyStats, LearnedDelta, Outcome, PerformanceKey, PerformanceRecord,
    PerformanceSnapshot, Position, Regime, StrategyStats,
};
use crate::signals::WeightEngine;
use crate::snapshot::SnapshotCell;

/// Learning key remembered for a symbol between execution and close.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeTag {
    pub signal_id: String,
    pub key: PerformanceKey,
    pub executed_at: DateTime<Utc>,
}

/// Durable storage for outcomes and open-trade tags.
#[async_trait]
pub trait PerformanceStore: Send + Sync {
    async fn append_record(&self, record: &PerformanceRecord) -> Result<()>;

    /// Records closed at or after `since`, oldest first.
    async fn records_since(&self, since: DateTime<Utc>) -> Result<Vec<PerformanceRecord>>;

    /// Replaces any tag already held for `symbol`.
    async fn save_trade_tag(&self, symbol: &str, tag: &TradeTag) -> Result<()>;

    /// Remove and return the tag for `symbol`.
    async fn take_trade_tag(&self, symbol: &str) -> Result<Option<TradeTag>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub interval_secs: u64,
    /// Only records closed within this many days count
    pub window_days: i64,
    /// Most recent records kept per key
    pub max_samples_per_key: usize,
    /// |P&L| at or below this fraction of entry notional is BREAKEVEN
    pub breakeven_tolerance: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            window_days: 30,
            max_samples_per_key: 50,
            breakeven_tolerance: 0.0005,
        }
    }
}

impl LearningConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.interval_secs == 0 || self.window_days <= 0 || self.max_samples_per_key == 0 {
            return Err(EngineError::Config(
                "learning interval, window and samples per key must be > 0".into(),
            ));
        }
        if !(0.0..0.1).contains(&self.breakeven_tolerance) {
            return Err(EngineError::Config("breakeven tolerance must be in [0, 0.1)".into()));
        }
        Ok(())
    }
}

/// WIN, LOSS, or BREAKEVEN when |pnl| is within `tolerance` of `notional`.
pub fn classify_outcome(pnl: Decimal, notional: Decimal, tolerance: f64) -> Outcome {
    let band = Decimal::from_f64(tolerance).unwrap_or(Decimal::ZERO) * notional.abs();
    if pnl.abs() <= band {
        Outcome::Breakeven
    } else if pnl > Decimal::ZERO {
        Outcome::Win
    } else {
        Outcome::Loss
    }
}

pub struct LearningLoop {
    store: Arc<dyn PerformanceStore>,
    weights: WeightEngine,
    config: LearningConfig,
    snapshot: Arc<SnapshotCell<PerformanceSnapshot>>,
}

impl LearningLoop {
    pub fn new(
        store: Arc<dyn PerformanceStore>,
        weights: WeightEngine,
        config: LearningConfig,
        snapshot: Arc<SnapshotCell<PerformanceSnapshot>>,
    ) -> Self {
        Self {
            store,
            weights,
            config,
            snapshot,
        }
    }

    pub fn snapshot(&self) -> Arc<PerformanceSnapshot> {
        self.snapshot.load()
    }

    /// Remember the learning key of an executed signal until its position closes.
    pub async fn tag_execution(&self, signal: &BotSignal, executed_at: DateTime<Utc>) -> Result<()> {
        let tag = TradeTag {
            signal_id: signal.id.clone(),
            key: PerformanceKey {
                strategy: signal.strategy.clone(),
                regime: signal.regime,
                timeframe: signal.timeframe,
            },
            executed_at,
        };
        self.store.save_trade_tag(&signal.symbol, &tag).await?;
        debug!(symbol = %signal.symbol, key = %tag.key, "Tagged executed trade");
        Ok(())
    }

    /// Append the outcome of a closed position that came from one of our signals.
    ///
    /// P&L is the realized change over the close, falling back to the last
    /// unrealized value when the feed reports none.
    pub async fn record_close(
        &self,
        previous: &Position,
        closed: &Position,
    ) -> Result<Option<PerformanceRecord>> {
        let Some(tag) = self.store.take_trade_tag(&closed.symbol).await? else {
            debug!(symbol = %closed.symbol, "Closed position has no trade tag");
            return Ok(None);
        };

        let realized = closed.realized_pnl - previous.realized_pnl;
        let pnl = if realized.is_zero() {
            previous.unrealized_pnl
        } else {
            realized
        };
        let outcome = classify_outcome(pnl, previous.entry_notional(), self.config.breakeven_tolerance);

        let record = PerformanceRecord {
            key: tag.key,
            symbol: closed.symbol.clone(),
            outcome,
            pnl,
            closed_at: closed.updated_at,
        };
        self.store.append_record(&record).await?;

        info!(
            symbol = %record.symbol,
            key = %record.key,
            outcome = record.outcome.as_str(),
            pnl = %record.pnl,
            "Recorded trade outcome"
        );
        Ok(Some(record))
    }

    /// Recompute statistics over the recent window and publish them.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<Arc<PerformanceSnapshot>> {
        let since = now - chrono::Duration::days(self.config.window_days);
        let records = self.store.records_since(since).await?;

        let mut grouped: HashMap<PerformanceKey, Vec<PerformanceRecord>> = HashMap::new();
        for record in records {
            grouped.entry(record.key.clone()).or_default().push(record);
        }
        for list in grouped.values_mut() {
            let excess = list.len().saturating_sub(self.config.max_samples_per_key);
            list.drain(..excess);
        }

        let mut by_key = HashMap::with_capacity(grouped.len());
        let mut by_regime: HashMap<(String, Regime), Vec<&PerformanceRecord>> = HashMap::new();
        let mut by_strategy: HashMap<String, Vec<&PerformanceRecord>> = HashMap::new();
        for (key, list) in &grouped {
            let refs: Vec<&PerformanceRecord> = list.iter().collect();
            let stats = MetricsCalculator::calculate(&refs);
            by_key.insert(
                key.clone(),
                KeyStats {
                    samples: stats.samples,
                    wins: stats.wins,
                    losses: stats.losses,
                    win_rate: stats.win_rate,
                    total_pnl: stats.total_pnl,
                },
            );
            by_regime
                .entry((key.strategy.clone(), key.regime))
                .or_default()
                .extend(list.iter());
            by_strategy
                .entry(key.strategy.clone())
                .or_default()
                .extend(list.iter());
        }

        let deltas = by_regime
            .into_iter()
            .map(|(k, list)| {
                let samples = list.len() as u32;
                let wins = list.iter().filter(|r| r.outcome == Outcome::Win).count();
                let win_rate = wins as f64 / samples.max(1) as f64;
                let delta = self.weights.learned_delta(win_rate, samples);
                (k, LearnedDelta { samples, win_rate, delta })
            })
            .collect();

        let strategies = by_strategy
            .into_iter()
            .map(|(name, mut list)| {
                list.sort_by_key(|r| r.closed_at);
                let stats = MetricsCalculator::calculate(&list);
                let strategy = StrategyStats {
                    samples: stats.samples,
                    win_probability: stats.win_rate,
                    payoff_ratio: stats.payoff_ratio,
                    avg_win: stats.avg_win,
                    avg_loss: stats.avg_loss,
                    profit_factor: stats.profit_factor,
                    sharpe_ratio: stats.sharpe_ratio,
                };
                (name, strategy)
            })
            .collect();

        let version = self.snapshot.load().version + 1;
        self.snapshot.publish(PerformanceSnapshot {
            version,
            computed_at: Some(now),
            by_key,
            deltas,
            strategies,
        });
        let published = self.snapshot.load();

        info!(
            version,
            keys = published.by_key.len(),
            learned = published.deltas.values().filter(|d| d.delta != 0.0).count(),
            "Published performance snapshot"
        );
        Ok(published)
    }

    /// Periodic learning cycle until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle(Utc::now()).await {
                        error!(error = %e, "Learning cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Learning loop stopping");
                    break;
                }
            }
        }
    }
}
