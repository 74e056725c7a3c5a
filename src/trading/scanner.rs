//! Scan pipeline: indicators → regime → weights → confluence → fusion → risk.
//!
//! Each symbol runs independently on a bounded pool. All external calls of one
//! scan share a deadline; a late or failing factor is dropped from that
//! decision only.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::api::{AiCommentary, CommentarySource, IndicatorSnapshot, IndicatorSource};
use crate::config::EngineConfig;
use crate::models::{Factor, FusedSignal, PerformanceSnapshot, Timeframe, TimeframeSignal};
use crate::positions::normalize_symbol;
use crate::signals::{
    aggregate, fuse, score_timeframe, technical_consensus, ConfluenceConfig, FactorInputs,
    RegimeClassifier, RegimeFeatures, ScoringConfig, WeightEngine,
};
use crate::snapshot::SnapshotCell;

use super::config::ScanConfig;
use super::risk_manager::{MarketContext, ProposalRejection, RiskManager, TradeProposal};

/// Something worth reporting about one symbol's decision.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanNote {
    /// Factor missing from this decision; its weight was redistributed
    Degraded(Factor),
    /// A call did not finish before the scan deadline
    Timeout { source: &'static str, timeframe: Option<Timeframe> },
    /// A call failed
    SourceError { source: &'static str, timeframe: Option<Timeframe>, error: String },
    NoData(Timeframe),
    /// No timeframe produced a vote
    InsufficientData,
    /// Direction found but the weighted factors point the other way
    FactorsDisagree { composite: f64 },
    Rejected(ProposalRejection),
}

impl fmt::Display for ScanNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tf = |t: &Option<Timeframe>| t.map(|t| format!(" {t}")).unwrap_or_default();
        match self {
            Self::Degraded(factor) => write!(f, "degraded: {factor} unavailable"),
            Self::Timeout { source, timeframe } => write!(f, "{source}{} timed out", tf(timeframe)),
            Self::SourceError { source, timeframe, error } => {
                write!(f, "{source}{} failed: {error}", tf(timeframe))
            }
            Self::NoData(t) => write!(f, "no data for {t}"),
            Self::InsufficientData => write!(f, "no timeframe had data"),
            Self::FactorsDisagree { composite } => {
                write!(f, "factors disagree (composite {composite:.3})")
            }
            Self::Rejected(reason) => write!(f, "no proposal: {reason}"),
        }
    }
}

/// Outcome of scanning one symbol.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub symbol: String,
    /// `None` when no timeframe produced a vote
    pub fused: Option<FusedSignal>,
    pub proposal: Option<TradeProposal>,
    pub notes: Vec<ScanNote>,
}

enum Fetched<T> {
    Value(T),
    Missing,
    TimedOut,
    Failed(String),
}

async fn bounded<T, F>(deadline: Instant, fut: F) -> Fetched<T>
where
    F: Future<Output = Result<Option<T>>>,
{
    match timeout_at(deadline, fut).await {
        Ok(Ok(Some(v))) => Fetched::Value(v),
        Ok(Ok(None)) => Fetched::Missing,
        Ok(Err(e)) => Fetched::Failed(format!("{e:#}")),
        Err(_) => Fetched::TimedOut,
    }
}

impl<T> Fetched<T> {
    /// Keep the value, turning failures into notes.
    fn into_value(
        self,
        source: &'static str,
        timeframe: Option<Timeframe>,
        notes: &mut Vec<ScanNote>,
    ) -> Option<T> {
        match self {
            Fetched::Value(v) => Some(v),
            Fetched::Missing => None,
            Fetched::TimedOut => {
                notes.push(ScanNote::Timeout { source, timeframe });
                None
            }
            Fetched::Failed(error) => {
                notes.push(ScanNote::SourceError { source, timeframe, error });
                None
            }
        }
    }
}

/// Runs scans over the configured data sources.
pub struct Scanner {
    indicators: Arc<dyn IndicatorSource>,
    commentary: Arc<dyn CommentarySource>,
    classifier: RegimeClassifier,
    weights: WeightEngine,
    scoring: ScoringConfig,
    confluence: ConfluenceConfig,
    config: ScanConfig,
    risk: Arc<RiskManager>,
    performance: Arc<SnapshotCell<PerformanceSnapshot>>,
}

impl Scanner {
    pub fn new(
        config: &EngineConfig,
        indicators: Arc<dyn IndicatorSource>,
        commentary: Arc<dyn CommentarySource>,
        risk: Arc<RiskManager>,
        performance: Arc<SnapshotCell<PerformanceSnapshot>>,
    ) -> Self {
        Self {
            indicators,
            commentary,
            classifier: RegimeClassifier::new(config.regime.clone()),
            weights: WeightEngine::new(config.weights.clone()),
            scoring: config.scoring.clone(),
            confluence: config.confluence.clone(),
            config: config.scan.clone(),
            risk,
            performance,
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Scan `symbols` × `timeframes`; empty slices fall back to the configured
    /// lists. Results are sorted by symbol.
    pub async fn scan(&self, symbols: &[String], timeframes: &[Timeframe]) -> Vec<ScanResult> {
        let symbols: Vec<String> = if symbols.is_empty() {
            self.config.symbols.clone()
        } else {
            symbols.to_vec()
        };
        let mut symbols: Vec<String> = symbols.iter().map(|s| normalize_symbol(s)).collect();
        symbols.sort();
        symbols.dedup();

        let mut timeframes: Vec<Timeframe> = if timeframes.is_empty() {
            self.config.timeframes.clone()
        } else {
            timeframes.to_vec()
        };
        timeframes.sort();
        timeframes.dedup();

        // One snapshot for the whole scan, even if learning publishes mid-way.
        let performance = self.performance.load();
        let deadline = Instant::now() + Duration::from_secs(self.config.timeout_secs);
        let started = std::time::Instant::now();

        let mut results: Vec<ScanResult> = stream::iter(symbols)
            .map(|symbol| {
                let performance = performance.clone();
                let timeframes = &timeframes;
                async move { self.scan_symbol(symbol, timeframes, deadline, &performance).await }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        results.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let proposals = results.iter().filter(|r| r.proposal.is_some()).count();
        let degraded = results
            .iter()
            .filter(|r| r.fused.as_ref().is_some_and(FusedSignal::is_degraded))
            .count();
        info!(
            symbols = results.len(),
            proposals,
            degraded,
            weights_version = performance.version,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Scan complete"
        );

        results
    }

    async fn scan_symbol(
        &self,
        symbol: String,
        timeframes: &[Timeframe],
        deadline: Instant,
        performance: &PerformanceSnapshot,
    ) -> ScanResult {
        let mut notes = Vec::new();
        let sym = symbol.as_str();

        let per_timeframe = join_all(timeframes.iter().map(|&tf| async move {
            (tf, bounded(deadline, self.indicators.indicators(sym, tf)).await)
        }));
        let (per_timeframe, sentiment, commentary) = tokio::join!(
            per_timeframe,
            bounded(deadline, self.indicators.sentiment(sym)),
            bounded(deadline, self.commentary.commentary(sym)),
        );

        let mut snapshots: Vec<(Timeframe, IndicatorSnapshot)> = Vec::new();
        for (tf, fetched) in per_timeframe {
            match fetched.into_value("indicator source", Some(tf), &mut notes) {
                Some(snapshot) => snapshots.push((tf, snapshot)),
                None => notes.push(ScanNote::NoData(tf)),
            }
        }
        let sentiment = sentiment
            .into_value("sentiment source", None, &mut notes)
            .filter(|s| s.is_finite())
            .map(|s| s.clamp(-1.0, 1.0));
        let commentary: Option<AiCommentary> =
            commentary.into_value("commentary service", None, &mut notes);

        let mut votes: Vec<TimeframeSignal> = Vec::with_capacity(snapshots.len());
        for (tf, snapshot) in &snapshots {
            let importance = self.confluence.importance_of(*tf);
            match score_timeframe(sym, *tf, importance, snapshot, &self.scoring) {
                Some(vote) => votes.push(vote),
                None => notes.push(ScanNote::NoData(*tf)),
            }
        }

        if votes.is_empty() {
            notes.push(ScanNote::InsufficientData);
            debug!(symbol = %symbol, "No timeframe produced a vote");
            return ScanResult { symbol, fused: None, proposal: None, notes };
        }

        // Regime from the longest timeframe with data.
        let regime_source = snapshots.last().map(|(_, s)| s);
        let features = RegimeFeatures {
            trend_strength: regime_source.and_then(|s| s.trend_strength).unwrap_or(f64::NAN),
            realized_volatility: regime_source
                .and_then(|s| s.realized_volatility)
                .unwrap_or(f64::NAN),
            volume_ratio: regime_source.and_then(|s| s.volume_ratio).unwrap_or(f64::NAN),
        };
        let regime = self.classifier.classify(sym, features);

        let profile = self.weights.weights_for(
            regime,
            performance.delta_for(&self.config.strategy, regime),
            performance.version,
        );

        let confluence = aggregate(&votes, &self.confluence);
        let inputs = FactorInputs {
            technical: technical_consensus(&votes),
            ai: commentary.as_ref().and_then(|c| c.bias),
            sentiment,
        };
        let fusion = fuse(confluence.direction, inputs, &profile);
        for factor in &fusion.degraded {
            warn!(symbol = %symbol, factor = %factor, "Degraded analysis, factor unavailable");
            notes.push(ScanNote::Degraded(*factor));
        }

        let fused = FusedSignal {
            symbol: symbol.clone(),
            direction: confluence.direction,
            confluence_ratio: confluence.ratio,
            confidence: confluence.confidence,
            regime,
            contributing_weights: profile,
            effective_weights: fusion.effective_weights,
            composite_score: fusion.composite,
            timeframes: votes,
            degraded: fusion.degraded,
            generated_at: Utc::now(),
        };

        let atr = self.atr_from(&snapshots);
        if let Some(atr) = atr {
            self.risk.record_atr(sym, atr);
        }

        let proposal = if !fused.is_actionable() {
            None
        } else if fused.composite_score < self.config.min_composite_score {
            notes.push(ScanNote::FactorsDisagree { composite: fused.composite_score });
            None
        } else {
            let market = market_context(&snapshots, &fused, atr);
            match self.risk.propose(
                &fused,
                &market,
                commentary.as_ref(),
                performance.strategy(&self.config.strategy),
                &self.config.strategy,
            ) {
                Ok(proposal) => Some(proposal),
                Err(reason) => {
                    debug!(symbol = %symbol, %reason, "No proposal");
                    notes.push(ScanNote::Rejected(reason));
                    None
                }
            }
        };

        debug!(
            symbol = %symbol,
            direction = ?fused.direction,
            ratio = fused.confluence_ratio,
            regime = %regime,
            composite = fused.composite_score,
            "Scanned symbol"
        );

        ScanResult { symbol, fused: Some(fused), proposal, notes }
    }

    /// ATR from the configured timeframe, else the longest one that has it.
    fn atr_from(&self, snapshots: &[(Timeframe, IndicatorSnapshot)]) -> Option<Decimal> {
        let positive = |s: &IndicatorSnapshot| s.atr.filter(|a| *a > Decimal::ZERO);
        snapshots
            .iter()
            .find(|(tf, _)| *tf == self.risk.config().atr_timeframe)
            .and_then(|(_, s)| positive(s))
            .or_else(|| snapshots.iter().rev().find_map(|(_, s)| positive(s)))
    }
}

/// Price from the shortest timeframe, structure levels from the dominant one.
fn market_context(
    snapshots: &[(Timeframe, IndicatorSnapshot)],
    fused: &FusedSignal,
    atr: Option<Decimal>,
) -> MarketContext {
    let price = snapshots
        .iter()
        .map(|(_, s)| s.price)
        .find(|p| *p > Decimal::ZERO)
        .unwrap_or(Decimal::ZERO);
    let dominant = fused
        .dominant_timeframe()
        .and_then(|tf| snapshots.iter().find(|(t, _)| *t == tf))
        .or(snapshots.last())
        .map(|(_, s)| s);

    MarketContext {
        price,
        atr,
        volatility: snapshots
            .iter()
            .rev()
            .find_map(|(_, s)| s.realized_volatility.filter(|v| v.is_finite())),
        support: dominant.and_then(|s| s.support),
        resistance: dominant.and_then(|s| s.resistance),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::StaticMarketData;
    use crate::models::{Direction, SignalType};
    use crate::positions::PositionStore;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    struct FailingCommentary;

    #[async_trait]
    impl CommentarySource for FailingCommentary {
        async fn commentary(&self, _symbol: &str) -> Result<Option<AiCommentary>> {
            Err(anyhow::anyhow!("connection refused"))
        }
    }

    fn bullish() -> IndicatorSnapshot {
        IndicatorSnapshot {
            price: dec!(50000),
            ema_fast: Some(dec!(50500)),
            ema_slow: Some(dec!(49000)),
            rsi: Some(55.0),
            macd_histogram: Some(120.0),
            atr: Some(dec!(500)),
            trend_strength: Some(0.5),
            realized_volatility: Some(0.015),
            volume_ratio: Some(1.2),
            ..Default::default()
        }
    }

    fn bearish() -> IndicatorSnapshot {
        IndicatorSnapshot {
            ema_fast: Some(dec!(48500)),
            ema_slow: Some(dec!(49500)),
            macd_histogram: Some(-80.0),
            trend_strength: Some(-0.5),
            ..bullish()
        }
    }

    fn market(snapshot: fn() -> IndicatorSnapshot) -> StaticMarketData {
        Timeframe::DEFAULT_SCAN
            .iter()
            .fold(StaticMarketData::new(), |m, tf| m.with_indicators("BTCUSDT", *tf, snapshot()))
            .with_sentiment("BTCUSDT", 0.3)
            .with_commentary(
                "BTCUSDT",
                AiCommentary { text: "breakout".into(), bias: Some(0.5), ..Default::default() },
            )
    }

    fn build(
        indicators: Arc<dyn IndicatorSource>,
        commentary: Arc<dyn CommentarySource>,
        config: EngineConfig,
    ) -> Scanner {
        let store = Arc::new(PositionStore::new());
        let risk = Arc::new(RiskManager::new(config.risk.clone(), store));
        let performance = Arc::new(SnapshotCell::new(PerformanceSnapshot::default()));
        Scanner::new(&config, indicators, commentary, risk, performance)
    }

    #[tokio::test]
    async fn test_aligned_timeframes_produce_proposal() {
        let data = Arc::new(market(bullish));
        let scanner = build(data.clone(), data, EngineConfig::default());

        let results = scanner.scan(&["btcusdt".into()], &[]).await;

        assert_eq!(results.len(), 1);
        let r = &results[0];
        assert_eq!(r.symbol, "BTCUSDT");
        let fused = r.fused.as_ref().unwrap();
        assert_eq!(fused.direction, Direction::Buy);
        assert!((fused.confluence_ratio - 1.0).abs() < 1e-9);
        assert!(fused.degraded.is_empty());
        assert!(fused.composite_score > 0.0);

        let proposal = r.proposal.as_ref().unwrap();
        assert_eq!(proposal.signal_type, SignalType::Buy);
        assert_eq!(proposal.stop_loss, dec!(49000));
        assert_eq!(proposal.take_profit, dec!(52000));
        assert!(proposal.quantity > Decimal::ZERO);
        assert_eq!(scanner.risk.cached_atr("BTCUSDT"), Some(dec!(500)));
    }

    #[tokio::test]
    async fn test_commentary_failure_degrades_single_decision() {
        let data = Arc::new(market(bullish));
        let scanner = build(data, Arc::new(FailingCommentary), EngineConfig::default());

        let results = scanner.scan(&["BTCUSDT".into()], &[]).await;

        let r = &results[0];
        let fused = r.fused.as_ref().unwrap();
        assert_eq!(fused.degraded, vec![Factor::Ai]);
        assert_eq!(fused.effective_weights[1], 0.0);
        let sum: f64 = fused.effective_weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!(r.notes.contains(&ScanNote::Degraded(Factor::Ai)));
        assert!(r.notes.iter().any(|n| matches!(n, ScanNote::SourceError { .. })));
        let proposal = r.proposal.as_ref().unwrap();
        assert!(proposal.rationale.contains("degraded"));
    }

    #[tokio::test]
    async fn test_slow_commentary_times_out_without_failing_scan() {
        let data = Arc::new(market(bullish));
        let slow = Arc::new(market(bullish).with_delay(Duration::from_secs(5)));
        let mut config = EngineConfig::default();
        config.scan.timeout_secs = 1;
        let scanner = build(data, slow, config);

        let results = scanner.scan(&["BTCUSDT".into()], &[]).await;

        let r = &results[0];
        assert!(r.notes.contains(&ScanNote::Timeout { source: "commentary service", timeframe: None }));
        assert_eq!(r.fused.as_ref().unwrap().degraded, vec![Factor::Ai]);
        assert!(r.proposal.is_some());
    }

    #[tokio::test]
    async fn test_split_timeframes_stay_neutral() {
        let data = Arc::new(
            StaticMarketData::new()
                .with_indicators("BTCUSDT", Timeframe::M15, bullish())
                .with_indicators("BTCUSDT", Timeframe::H1, bullish())
                .with_indicators("BTCUSDT", Timeframe::H4, bearish())
                .with_indicators("BTCUSDT", Timeframe::D1, bearish()),
        );
        let scanner = build(data.clone(), data, EngineConfig::default());

        let results = scanner.scan(&["BTCUSDT".into()], &[]).await;

        // buy 1 + 2 against sell 3 + 4
        let fused = results[0].fused.as_ref().unwrap();
        assert_eq!(fused.direction, Direction::Sell);
        assert!((fused.confluence_ratio - 7.0 / 10.0).abs() < 1e-9);

        let mixed = Arc::new(
            StaticMarketData::new()
                .with_indicators("BTCUSDT", Timeframe::H4, bullish())
                .with_indicators("BTCUSDT", Timeframe::D1, bearish()),
        );
        let scanner = build(mixed.clone(), mixed, EngineConfig::default());
        let results = scanner.scan(&["BTCUSDT".into()], &[]).await;
        let fused = results[0].fused.as_ref().unwrap();
        assert_eq!(fused.direction, Direction::Neutral);
        assert!(results[0].proposal.is_none());
    }

    #[tokio::test]
    async fn test_symbol_without_data_reports_insufficient() {
        let data = Arc::new(market(bullish));
        let scanner = build(data.clone(), data, EngineConfig::default());

        let results = scanner.scan(&["DOGEUSDT".into(), "BTCUSDT".into()], &[]).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].symbol, "BTCUSDT");
        let doge = &results[1];
        assert!(doge.fused.is_none());
        assert!(doge.notes.contains(&ScanNote::InsufficientData));
        assert!(doge.notes.contains(&ScanNote::NoData(Timeframe::H1)));
    }

    #[tokio::test]
    async fn test_disagreeing_factors_block_proposal() {
        let data = Arc::new(
            market(bullish)
                .with_sentiment("BTCUSDT", -1.0)
                .with_commentary("BTCUSDT", AiCommentary { bias: Some(-1.0), ..Default::default() }),
        );
        let mut config = EngineConfig::default();
        config.scan.min_composite_score = 0.2;
        let scanner = build(data.clone(), data, config);

        let results = scanner.scan(&["BTCUSDT".into()], &[]).await;

        let r = &results[0];
        assert!(r.proposal.is_none());
        assert!(r.notes.iter().any(|n| matches!(n, ScanNote::FactorsDisagree { .. })));
    }
}
