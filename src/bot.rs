//! Orchestrator wiring the position store, scan pipeline, signal lifecycle and
//! learning loop, plus the background tasks of a long-running session.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::feed::{self, FeedStats};
use crate::api::{
    CommentaryClient, CommentarySource, IndicatorClient, IndicatorSource, StaticMarketData,
};
use crate::config::EngineConfig;
use crate::db::Database;
use crate::learning::LearningLoop;
use crate::lifecycle::{SignalLifecycle, TransitionOutcome};
use crate::models::{
    BotSignal, PerformanceRecord, PerformanceSnapshot, Position, RawPositionUpdate, Regime,
    SignalStatus, Timeframe, WeightProfile,
};
use crate::positions::{ApplyResult, ClosedPosition, PositionEvent, PositionStore};
use crate::signals::WeightEngine;
use crate::snapshot::SnapshotCell;
use crate::trading::{ExitAction, RiskManager, ScanResult, Scanner, TradeProposal};

/// Scan result together with the signal generated from it, if any.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub result: ScanResult,
    pub signal: Option<BotSignal>,
}

/// Exit-management actions a position event caused.
#[derive(Debug, Default, Clone)]
pub struct EventEffects {
    pub actions: Vec<ExitAction>,
}

/// Totals of a feed replay.
#[derive(Debug, Default, Clone)]
pub struct ReplaySummary {
    pub feed: FeedStats,
    pub actions: Vec<ExitAction>,
    pub recorded: Vec<PerformanceRecord>,
}

/// The decision engine.
pub struct Bot {
    config: EngineConfig,
    store: Arc<PositionStore>,
    closes: Mutex<mpsc::UnboundedReceiver<ClosedPosition>>,
    risk: Arc<RiskManager>,
    scanner: Scanner,
    lifecycle: Arc<SignalLifecycle>,
    learning: Arc<LearningLoop>,
    weights: WeightEngine,
    performance: Arc<SnapshotCell<PerformanceSnapshot>>,
    db: Arc<Database>,
    shutdown: watch::Sender<bool>,
}

impl Bot {
    pub fn new(
        config: EngineConfig,
        db: Arc<Database>,
        indicators: Arc<dyn IndicatorSource>,
        commentary: Arc<dyn CommentarySource>,
    ) -> Self {
        let (store, closes) = PositionStore::with_closes();
        let store = Arc::new(store);
        let performance = Arc::new(SnapshotCell::new(PerformanceSnapshot::default()));
        let weights = WeightEngine::new(config.weights.clone());
        let risk = Arc::new(RiskManager::new(config.risk.clone(), store.clone()));
        let scanner = Scanner::new(&config, indicators, commentary, risk.clone(), performance.clone());
        let lifecycle = Arc::new(SignalLifecycle::new(db.clone(), config.lifecycle.clone()));
        let learning = Arc::new(LearningLoop::new(
            db.clone(),
            weights.clone(),
            config.learning.clone(),
            performance.clone(),
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            store,
            closes: Mutex::new(closes),
            risk,
            scanner,
            lifecycle,
            learning,
            weights,
            performance,
            db,
            shutdown,
        }
    }

    /// Open the database and the data sources named by `config`, then load
    /// the first performance snapshot.
    ///
    /// With `fixtures`, market data comes from that JSON file instead of the
    /// HTTP services.
    pub async fn connect(config: EngineConfig, database_url: &str, fixtures: Option<&Path>) -> Result<Self> {
        let db = Arc::new(Database::new(database_url).await?);

        let (indicators, commentary): (Arc<dyn IndicatorSource>, Arc<dyn CommentarySource>) =
            match fixtures {
                Some(path) => {
                    let data = Arc::new(StaticMarketData::from_file(path)?);
                    info!(path = %path.display(), symbols = data.symbols().len(), "Using fixture market data");
                    (data.clone(), data)
                }
                None => {
                    let retry = Duration::from_secs(config.endpoints.retry_secs);
                    (
                        Arc::new(IndicatorClient::new(&config.endpoints.indicator_url, retry)?),
                        Arc::new(CommentaryClient::new(&config.endpoints.commentary_url, retry)?),
                    )
                }
            };

        let bot = Self::new(config, db, indicators, commentary);
        bot.learning.run_cycle(Utc::now()).await?;
        Ok(bot)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // ==================== Positions ====================

    pub fn get_position(&self, symbol: &str) -> Option<Arc<Position>> {
        self.store.get(symbol)
    }

    pub fn get_all_positions(&self) -> Vec<Arc<Position>> {
        self.store.get_all()
    }

    pub fn apply_position_update(
        &self,
        symbol: &str,
        raw: &RawPositionUpdate,
        source_ts: DateTime<Utc>,
    ) -> ApplyResult {
        self.store.apply_update(symbol, raw, source_ts)
    }

    /// Run exit management for an opened or updated position.
    ///
    /// Closes are handled from the store's close queue instead, see
    /// [`Bot::process_pending_closes`].
    pub fn handle_event(&self, event: PositionEvent) -> EventEffects {
        let mut effects = EventEffects::default();
        match event {
            PositionEvent::Opened(pos) | PositionEvent::Updated(pos) => {
                if pos.is_open() {
                    effects.actions = self.risk.on_mark_update(&pos.symbol);
                }
            }
            PositionEvent::Closed { closed, .. } => {
                debug!(symbol = %closed.symbol, "Close queued for learning");
            }
        }
        effects
    }

    /// Record the outcome of a closed position, if it was a tagged trade.
    pub async fn on_position_closed(&self, close: ClosedPosition) -> Result<Option<PerformanceRecord>> {
        self.learning
            .record_close(&close.previous, &close.closed)
            .await
            .with_context(|| format!("Failed to record close of {}", close.closed.symbol))
    }

    /// Drain every queued close without waiting.
    pub async fn process_pending_closes(&self) -> Result<Vec<PerformanceRecord>> {
        let mut closes = self.closes.lock().await;
        let mut recorded = Vec::new();
        while let Ok(close) = closes.try_recv() {
            recorded.extend(self.on_position_closed(close).await?);
        }
        Ok(recorded)
    }

    /// Re-run exit management over every open position.
    ///
    /// Used after the event consumer falls behind, since the updates it
    /// missed are gone but the committed positions are not.
    pub fn reconcile_marks(&self) -> Vec<ExitAction> {
        self.store
            .open_positions()
            .iter()
            .flat_map(|pos| self.risk.on_mark_update(&pos.symbol))
            .collect()
    }

    // ==================== Scans & signals ====================

    pub async fn scan(&self, symbols: &[String], timeframes: &[Timeframe]) -> Vec<ScanResult> {
        self.scanner.scan(symbols, timeframes).await
    }

    /// Persist a proposal as a PENDING signal.
    pub async fn generate_signal(&self, proposal: &TradeProposal) -> Result<BotSignal> {
        self.lifecycle.generate(proposal, Utc::now()).await
    }

    /// Scan, then persist a PENDING signal for every proposal.
    pub async fn scan_and_generate(
        &self,
        symbols: &[String],
        timeframes: &[Timeframe],
    ) -> Result<Vec<ScanOutcome>> {
        let results = self.scan(symbols, timeframes).await;
        let mut outcomes = Vec::with_capacity(results.len());
        for result in results {
            let signal = match &result.proposal {
                Some(proposal) => Some(self.generate_signal(proposal).await?),
                None => None,
            };
            outcomes.push(ScanOutcome { result, signal });
        }
        Ok(outcomes)
    }

    pub async fn get_signal(&self, id: &str) -> Result<Option<BotSignal>> {
        self.lifecycle.get(id).await
    }

    pub async fn list_signals(&self, status: Option<SignalStatus>, limit: u32) -> Result<Vec<BotSignal>> {
        self.lifecycle.list(status, limit).await
    }

    /// Guarded lifecycle transition. An EXECUTED signal is tagged for learning.
    pub async fn transition(
        &self,
        id: &str,
        to: SignalStatus,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<TransitionOutcome> {
        let outcome = self.lifecycle.transition(id, to, actor, reason).await?;
        self.after_transition(&outcome).await?;
        Ok(outcome)
    }

    pub async fn approve(&self, id: &str, actor: &str) -> Result<TransitionOutcome> {
        self.lifecycle.approve(id, actor).await
    }

    pub async fn reject(&self, id: &str, actor: &str, reason: &str) -> Result<TransitionOutcome> {
        self.lifecycle.reject(id, actor, reason).await
    }

    pub async fn execute(&self, id: &str, actor: &str) -> Result<TransitionOutcome> {
        let outcome = self.lifecycle.execute(id, actor).await?;
        self.after_transition(&outcome).await?;
        Ok(outcome)
    }

    async fn after_transition(&self, outcome: &TransitionOutcome) -> Result<()> {
        if let TransitionOutcome::Applied(signal) = outcome {
            if signal.status == SignalStatus::Executed {
                let at = signal.processed_at.unwrap_or_else(Utc::now);
                self.learning.tag_execution(signal, at).await?;
            }
        }
        Ok(())
    }

    pub async fn expire_stale(&self) -> Result<Vec<BotSignal>> {
        self.lifecycle.expire_stale(Utc::now()).await
    }

    // ==================== Weights & learning ====================

    /// Profile a scan would use for `regime` right now.
    pub fn current_weights(&self, regime: Regime) -> WeightProfile {
        let snapshot = self.performance.load();
        self.weights.weights_for(
            regime,
            snapshot.delta_for(&self.config.scan.strategy, regime),
            snapshot.version,
        )
    }

    pub fn performance(&self) -> Arc<PerformanceSnapshot> {
        self.performance.load()
    }

    pub async fn run_learning_cycle(&self) -> Result<Arc<PerformanceSnapshot>> {
        self.learning.run_cycle(Utc::now()).await
    }

    // ==================== Sessions ====================

    /// Apply a line-delimited feed and react to every resulting event, in order.
    pub async fn replay<R>(&self, reader: R) -> Result<ReplaySummary>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut events = self.store.subscribe();
        let mut summary = ReplaySummary::default();
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await.context("Failed to read replay input")? {
            if line.trim().is_empty() {
                continue;
            }
            summary.feed.lines += 1;

            let updates = match feed::parse_message(&line, Utc::now()) {
                Ok(updates) => updates,
                Err(e) => {
                    summary.feed.malformed += 1;
                    warn!(line = summary.feed.lines, error = %e, "Skipping malformed replay line");
                    continue;
                }
            };
            for update in updates {
                match self.store.apply_update(&update.symbol, &update.raw, update.source_ts) {
                    ApplyResult::Applied { .. } => summary.feed.applied += 1,
                    ApplyResult::Stale => summary.feed.stale += 1,
                }
                loop {
                    match events.try_recv() {
                        Ok(event) => summary.actions.extend(self.handle_event(event).actions),
                        Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                            warn!(missed, "Replay fell behind position events");
                            summary.actions.extend(self.reconcile_marks());
                        }
                        Err(_) => break,
                    }
                }
                summary.recorded.extend(self.process_pending_closes().await?);
            }
        }

        info!(
            lines = summary.feed.lines,
            applied = summary.feed.applied,
            actions = summary.actions.len(),
            recorded = summary.recorded.len(),
            "Replay finished"
        );
        Ok(summary)
    }

    /// Ask every background task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Long-running session: position feed, event reactions, expiry sweep,
    /// learning loop and optional periodic scans, until Ctrl+C.
    pub async fn run<R>(self: Arc<Self>, feed: Option<R>, scan_every: Option<Duration>) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        info!(
            feed = feed.is_some(),
            scan_every_secs = scan_every.map(|d| d.as_secs()),
            "Starting session"
        );

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let events = self.store.subscribe();
        tasks.push(tokio::spawn(self.clone().consume_events(events, self.shutdown.subscribe())));
        tasks.push(tokio::spawn(self.clone().consume_closes(self.shutdown.subscribe())));
        tasks.push(tokio::spawn(self.lifecycle.clone().run_expiry(self.shutdown.subscribe())));
        tasks.push(tokio::spawn(self.learning.clone().run(self.shutdown.subscribe())));

        if let Some(reader) = feed {
            let store = self.store.clone();
            let shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                match feed::run_feed(reader, store, shutdown).await {
                    Ok(stats) => info!(lines = stats.lines, applied = stats.applied, "Position feed ended"),
                    Err(e) => error!(error = %e, "Position feed failed"),
                }
            }));
        }

        if let Some(every) = scan_every {
            tasks.push(tokio::spawn(self.clone().scan_loop(every, self.shutdown.subscribe())));
        }

        tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
        info!("Shutdown signal received");
        self.shutdown();

        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Background task panicked");
            }
        }
        info!("Session stopped");
        Ok(())
    }

    async fn consume_events(
        self: Arc<Self>,
        mut events: broadcast::Receiver<PositionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        self.handle_event(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        let actions = self.reconcile_marks();
                        warn!(missed, reconciled = actions.len(), "Position event consumer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("Position event consumer stopped");
    }

    async fn consume_closes(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut closes = self.closes.lock().await;
        loop {
            tokio::select! {
                close = closes.recv() => match close {
                    Some(close) => {
                        if let Err(e) = self.on_position_closed(close).await {
                            error!(error = %e, "Failed to record closed position");
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        // Closes committed before shutdown still count.
        while let Ok(close) = closes.try_recv() {
            if let Err(e) = self.on_position_closed(close).await {
                error!(error = %e, "Failed to record closed position");
            }
        }
        debug!("Close consumer stopped");
    }

    async fn scan_loop(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.scan_and_generate(&[], &[]).await {
                        Ok(outcomes) => {
                            let generated = outcomes.iter().filter(|o| o.signal.is_some()).count();
                            info!(scanned = outcomes.len(), generated, "Periodic scan finished");
                        }
                        Err(e) => error!(error = %e, "Periodic scan failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{AiCommentary, IndicatorSnapshot};
    use crate::models::{Outcome, Side};
    use rust_decimal_macros::dec;

    fn market() -> StaticMarketData {
        let snapshot = IndicatorSnapshot {
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
        };
        Timeframe::DEFAULT_SCAN
            .iter()
            .fold(StaticMarketData::new(), |m, tf| m.with_indicators("BTCUSDT", *tf, snapshot.clone()))
            .with_sentiment("BTCUSDT", 0.3)
            .with_commentary(
                "BTCUSDT",
                AiCommentary { text: "breakout".into(), bias: Some(0.5), ..Default::default() },
            )
    }

    async fn bot() -> Bot {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let data = Arc::new(market());
        Bot::new(EngineConfig::default(), db, data.clone(), data)
    }

    #[tokio::test]
    async fn test_signal_to_learning_round_trip() {
        let bot = bot().await;

        let outcomes = bot.scan_and_generate(&["BTCUSDT".into()], &[]).await.unwrap();
        let signal = outcomes[0].signal.clone().unwrap();
        assert_eq!(signal.status, SignalStatus::Pending);

        assert!(bot.approve(&signal.id, "alice").await.unwrap().is_applied());
        assert!(bot
            .transition(&signal.id, SignalStatus::Executed, "alice", None)
            .await
            .unwrap()
            .is_applied());

        let t0 = Utc::now().timestamp_millis() - 60_000;
        let feed = format!(
            "{}\n{}\n{}\n",
            format_args!(
                r#"{{"topic":"position","data":[{{"symbol":"BTCUSDT","side":"Buy","size":"0.04","avgPrice":"50000","markPrice":"50000","cumRealisedPnl":"0","updatedTime":{}}}]}}"#,
                t0
            ),
            format_args!(
                r#"{{"topic":"position","data":[{{"symbol":"BTCUSDT","side":"Buy","size":"0.04","markPrice":"51000","unrealisedPnl":"40","updatedTime":{}}}]}}"#,
                t0 + 1000
            ),
            format_args!(
                r#"{{"topic":"position","data":[{{"symbol":"BTCUSDT","side":"","size":"0","markPrice":"51000","cumRealisedPnl":"40","updatedTime":{}}}]}}"#,
                t0 + 2000
            ),
        );
        let summary = bot.replay(feed.as_bytes()).await.unwrap();

        assert_eq!(summary.feed.applied, 3);
        assert!(summary
            .actions
            .iter()
            .any(|a| matches!(a, ExitAction::StopMoved { .. })));
        assert_eq!(summary.recorded.len(), 1);
        assert_eq!(summary.recorded[0].outcome, Outcome::Win);
        assert_eq!(summary.recorded[0].pnl, dec!(40));
        assert_eq!(summary.recorded[0].key.regime, signal.regime);

        let pos = bot.get_position("btcusdt").unwrap();
        assert_eq!(pos.side, Side::Flat);

        let snapshot = bot.run_learning_cycle().await.unwrap();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.strategy("mtf_confluence").unwrap().samples, 1);
    }

    #[tokio::test]
    async fn test_close_recorded_after_event_backlog() {
        let bot = bot().await;
        let outcomes = bot.scan_and_generate(&["BTCUSDT".into()], &[]).await.unwrap();
        let signal = outcomes[0].signal.clone().unwrap();
        bot.approve(&signal.id, "alice").await.unwrap();
        assert!(bot.execute(&signal.id, "alice").await.unwrap().is_applied());

        // Subscribed but never drained, so the broadcast buffer overflows.
        let mut events = bot.store.subscribe();
        let t0 = Utc::now() - chrono::Duration::minutes(5);
        let open: RawPositionUpdate = serde_json::from_value(serde_json::json!({
            "side": "Buy", "size": "0.04", "avgPrice": "50000", "markPrice": "50000", "cumRealisedPnl": "0"
        }))
        .unwrap();
        bot.apply_position_update("BTCUSDT", &open, t0);
        for i in 1..=1500i64 {
            let mark: RawPositionUpdate = serde_json::from_value(serde_json::json!({
                "markPrice": (50000 + i % 200).to_string(), "unrealisedPnl": "4"
            }))
            .unwrap();
            bot.apply_position_update("BTCUSDT", &mark, t0 + chrono::Duration::milliseconds(i));
        }
        let close: RawPositionUpdate = serde_json::from_value(serde_json::json!({
            "side": "", "size": "0", "markPrice": "50100", "cumRealisedPnl": "4"
        }))
        .unwrap();
        bot.apply_position_update("BTCUSDT", &close, t0 + chrono::Duration::seconds(2));

        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(_))
        ));

        let recorded = bot.process_pending_closes().await.unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].pnl, dec!(4));
        assert_eq!(recorded[0].outcome, Outcome::Win);
        assert!(bot.process_pending_closes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_marks_trails_open_positions() {
        let bot = bot().await;
        // Scanning caches the ATR the trailing stop needs.
        bot.scan(&["BTCUSDT".into()], &[]).await;
        let open: RawPositionUpdate = serde_json::from_value(serde_json::json!({
            "side": "Buy", "size": "0.04", "avgPrice": "50000", "markPrice": "50200"
        }))
        .unwrap();
        bot.apply_position_update("BTCUSDT", &open, Utc::now());
        assert!(bot.get_position("BTCUSDT").unwrap().strategy_stop_price.is_none());

        let actions = bot.reconcile_marks();

        assert!(actions.iter().any(|a| matches!(a, ExitAction::StopMoved { .. })));
        assert!(bot.get_position("BTCUSDT").unwrap().strategy_stop_price.is_some());
    }

    #[tokio::test]
    async fn test_current_weights_follow_snapshot_version() {
        let bot = bot().await;

        let before = bot.current_weights(Regime::Volatile);
        bot.run_learning_cycle().await.unwrap();
        let after = bot.current_weights(Regime::Volatile);

        assert_eq!(before.version(), 0);
        assert_eq!(after.version(), 1);
        let sum: f64 = after.as_array().iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rejected_signal_cannot_execute() {
        let bot = bot().await;
        let outcomes = bot.scan_and_generate(&["BTCUSDT".into()], &[]).await.unwrap();
        let id = outcomes[0].signal.as_ref().unwrap().id.clone();

        assert!(bot.reject(&id, "bob", "not now").await.unwrap().is_applied());

        assert_eq!(
            bot.execute(&id, "alice").await.unwrap(),
            TransitionOutcome::Conflict { current: SignalStatus::Rejected }
        );
        assert_eq!(bot.list_signals(Some(SignalStatus::Rejected), 10).await.unwrap().len(), 1);
    }
}
