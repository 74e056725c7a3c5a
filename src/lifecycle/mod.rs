//! Signal lifecycle: PENDING → APPROVED | REJECTED | EXPIRED, APPROVED → EXECUTED.
//!
//! Every transition is a compare-and-swap on the stored status, so concurrent
//! approve/reject calls on one signal resolve to exactly one winner.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::models::{BotSignal, SignalStatus};
use crate::trading::TradeProposal;

/// Actor recorded for clock-driven transitions.
pub const SYSTEM_ACTOR: &str = "system";

/// Durable storage for signals.
#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn insert_signal(&self, signal: &BotSignal) -> Result<()>;

    async fn get_signal(&self, id: &str) -> Result<Option<BotSignal>>;

    /// Newest first.
    async fn list_signals(&self, status: Option<SignalStatus>, limit: u32) -> Result<Vec<BotSignal>>;

    /// Write `to` plus the processing fields only if the stored status is
    /// still `from`. Returns whether the write happened.
    async fn compare_and_set_status(
        &self,
        id: &str,
        from: SignalStatus,
        to: SignalStatus,
        at: DateTime<Utc>,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<bool>;

    /// Ids of PENDING signals generated before `cutoff`.
    async fn pending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// PENDING signals older than this expire
    pub signal_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            signal_ttl_secs: 900,
            sweep_interval_secs: 60,
        }
    }
}

impl LifecycleConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.signal_ttl_secs == 0 || self.sweep_interval_secs == 0 {
            return Err(EngineError::Config("lifecycle TTL and sweep interval must be > 0".into()));
        }
        Ok(())
    }
}

/// Result of a transition attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(BotSignal),
    /// Status was not what the caller expected (already processed)
    Conflict { current: SignalStatus },
    /// The lifecycle graph has no such edge
    Illegal { from: SignalStatus, to: SignalStatus },
    NotFound,
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Guarded transitions over a [`SignalStore`].
pub struct SignalLifecycle {
    store: Arc<dyn SignalStore>,
    config: LifecycleConfig,
}

impl SignalLifecycle {
    pub fn new(store: Arc<dyn SignalStore>, config: LifecycleConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Persist a proposal as a new PENDING signal.
    pub async fn generate(&self, proposal: &TradeProposal, now: DateTime<Utc>) -> Result<BotSignal> {
        let signal = BotSignal {
            id: Uuid::new_v4().to_string(),
            symbol: proposal.symbol.clone(),
            signal_type: proposal.signal_type,
            status: SignalStatus::Pending,
            entry_price: proposal.entry_price,
            quantity: proposal.quantity,
            stop_loss: proposal.stop_loss,
            take_profit: proposal.take_profit,
            leverage: proposal.leverage,
            confidence: proposal.confidence,
            rationale: proposal.rationale.clone(),
            risk_reward_ratio: proposal.risk_reward,
            strategy: proposal.strategy.clone(),
            regime: proposal.regime,
            timeframe: proposal.timeframe,
            generated_at: now,
            processed_at: None,
            processed_by: None,
            rejection_reason: None,
        };
        self.store.insert_signal(&signal).await?;

        info!(
            id = %signal.id,
            symbol = %signal.symbol,
            side = signal.signal_type.as_str(),
            leverage = signal.leverage,
            "Signal generated"
        );
        Ok(signal)
    }

    pub async fn get(&self, id: &str) -> Result<Option<BotSignal>> {
        self.store.get_signal(id).await
    }

    pub async fn list(&self, status: Option<SignalStatus>, limit: u32) -> Result<Vec<BotSignal>> {
        self.store.list_signals(status, limit).await
    }

    /// Move `id` from `from` to `to`; succeeds only if `from` is still current.
    pub async fn transition_from(
        &self,
        id: &str,
        from: SignalStatus,
        to: SignalStatus,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<TransitionOutcome> {
        if !from.can_transition_to(to) {
            return Ok(TransitionOutcome::Illegal { from, to });
        }

        let now = Utc::now();
        let reason = if to == SignalStatus::Rejected { reason } else { None };
        if self
            .store
            .compare_and_set_status(id, from, to, now, actor, reason)
            .await?
        {
            let Some(signal) = self.store.get_signal(id).await? else {
                return Ok(TransitionOutcome::NotFound);
            };
            info!(id, from = %from, to = %to, actor, "Signal transitioned");
            return Ok(TransitionOutcome::Applied(signal));
        }

        match self.store.get_signal(id).await? {
            None => Ok(TransitionOutcome::NotFound),
            Some(current) => {
                warn!(id, expected = %from, current = %current.status, to = %to, actor, "Signal transition conflict");
                Ok(TransitionOutcome::Conflict { current: current.status })
            }
        }
    }

    /// Move `id` to `to` from whatever status it holds now.
    pub async fn transition(
        &self,
        id: &str,
        to: SignalStatus,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<TransitionOutcome> {
        let Some(current) = self.store.get_signal(id).await? else {
            return Ok(TransitionOutcome::NotFound);
        };
        if current.status.is_terminal() {
            warn!(id, current = %current.status, to = %to, actor, "Signal already processed");
            return Ok(TransitionOutcome::Conflict { current: current.status });
        }
        self.transition_from(id, current.status, to, actor, reason).await
    }

    pub async fn approve(&self, id: &str, actor: &str) -> Result<TransitionOutcome> {
        self.transition_from(id, SignalStatus::Pending, SignalStatus::Approved, actor, None)
            .await
    }

    pub async fn reject(&self, id: &str, actor: &str, reason: &str) -> Result<TransitionOutcome> {
        self.transition_from(id, SignalStatus::Pending, SignalStatus::Rejected, actor, Some(reason))
            .await
    }

    pub async fn execute(&self, id: &str, actor: &str) -> Result<TransitionOutcome> {
        self.transition_from(id, SignalStatus::Approved, SignalStatus::Executed, actor, None)
            .await
    }

    /// Expire PENDING signals older than the TTL. Returns the expired signals.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<BotSignal>> {
        let ttl = chrono::Duration::seconds(self.config.signal_ttl_secs as i64);
        let ids = self.store.pending_before(now - ttl).await?;

        let mut expired = Vec::new();
        for id in ids {
            match self
                .transition_from(&id, SignalStatus::Pending, SignalStatus::Expired, SYSTEM_ACTOR, None)
                .await?
            {
                TransitionOutcome::Applied(signal) => expired.push(signal),
                other => debug!(id = %id, ?other, "Signal left PENDING before expiry"),
            }
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "Expired stale signals");
        }
        Ok(expired)
    }

    /// Periodic expiry sweep until shutdown.
    pub async fn run_expiry(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.sweep_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.expire_stale(Utc::now()).await {
                        error!(error = %e, "Expiry sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Expiry sweep stopping");
                    break;
                }
            }
        }
    }
}
