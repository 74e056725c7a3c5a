//! Turns fused signals into sized, leveraged proposals and manages exits of
//! open positions.

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::api::AiCommentary;
use crate::models::{FusedSignal, Regime, SignalType, StrategyStats, Timeframe};
use crate::positions::{normalize_symbol, PositionStore};

use super::exits::{self, EntryLevels, LevelSource, ProfitTake};
use super::leverage::{LeverageDecision, LeverageInputs, LeverageSelector};
use super::position_sizer::{KellySizing, PositionSizer, SizingMethod};
use super::RiskConfig;

/// Price context for a proposal, from the scan's indicator data.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarketContext {
    pub price: Decimal,
    pub atr: Option<Decimal>,
    pub volatility: Option<f64>,
    pub support: Option<Decimal>,
    pub resistance: Option<Decimal>,
}

/// A sized, leveraged trade proposal with its explanation.
#[derive(Debug, Clone)]
pub struct TradeProposal {
    pub symbol: String,
    pub signal_type: SignalType,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub leverage: u32,
    pub kelly: KellySizing,
    pub risk_reward: f64,
    pub confidence: f64,
    pub regime: Regime,
    pub timeframe: Timeframe,
    pub strategy: String,
    pub rationale: String,
}

/// Why no proposal was produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ProposalRejection {
    NoDirection,
    NoPrice,
    NoLevels,
    RiskRewardTooLow { ratio: f64, min: f64 },
    LeverageBlocked(String),
    ZeroQuantity,
}

impl std::fmt::Display for ProposalRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoDirection => write!(f, "no tradable direction"),
            Self::NoPrice => write!(f, "no usable price"),
            Self::NoLevels => write!(f, "no valid stop/target (missing ATR)"),
            Self::RiskRewardTooLow { ratio, min } => {
                write!(f, "risk/reward {ratio:.2} below minimum {min:.2}")
            }
            Self::LeverageBlocked(reason) => write!(f, "blocked: {reason}"),
            Self::ZeroQuantity => write!(f, "size rounds to zero"),
        }
    }
}

/// Exit actions for the execution collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitAction {
    StopMoved { symbol: String, stop: Decimal },
    BreakevenSecured { symbol: String, stop: Decimal },
    TakeProfit { symbol: String, take: ProfitTake },
    StopHit { symbol: String, stop: Decimal, mark: Decimal },
}

/// Position sizing and risk management over the live position store.
pub struct RiskManager {
    config: RiskConfig,
    store: Arc<PositionStore>,
    sizer: PositionSizer,
    leverage: LeverageSelector,
    /// ATR per symbol from the latest scan, used by the trailing stop
    atr_cache: DashMap<String, (Decimal, DateTime<Utc>)>,
}

impl RiskManager {
    pub fn new(config: RiskConfig, store: Arc<PositionStore>) -> Self {
        Self {
            sizer: PositionSizer::new(config.clone()),
            leverage: LeverageSelector::new(config.clone()),
            config,
            store,
            atr_cache: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn sizer(&self) -> &PositionSizer {
        &self.sizer
    }

    pub fn record_atr(&self, symbol: &str, atr: Decimal) {
        if atr > Decimal::ZERO {
            self.atr_cache.insert(normalize_symbol(symbol), (atr, Utc::now()));
        }
    }

    pub fn cached_atr(&self, symbol: &str) -> Option<Decimal> {
        self.atr_cache.get(&normalize_symbol(symbol)).map(|e| e.0)
    }

    /// Build a proposal for an actionable fused signal.
    ///
    /// Open positions are read from the store here, at decision time.
    pub fn propose(
        &self,
        fused: &FusedSignal,
        market: &MarketContext,
        commentary: Option<&AiCommentary>,
        stats: Option<&StrategyStats>,
        strategy: &str,
    ) -> Result<TradeProposal, ProposalRejection> {
        let signal_type =
            SignalType::from_direction(fused.direction).ok_or(ProposalRejection::NoDirection)?;
        let entry = market.price;
        if entry <= Decimal::ZERO {
            return Err(ProposalRejection::NoPrice);
        }

        let levels = exits::entry_levels(signal_type, entry, market.atr, commentary, &self.config)
            .ok_or(ProposalRejection::NoLevels)?;
        if levels.risk_reward + 1e-9 < self.config.min_risk_reward {
            return Err(ProposalRejection::RiskRewardTooLow {
                ratio: levels.risk_reward,
                min: self.config.min_risk_reward,
            });
        }

        let open = self.store.open_positions();
        let inputs = LeverageInputs {
            price: entry,
            volatility: market.volatility,
            confidence: fused.confidence,
            support: market.support,
            resistance: market.resistance,
            stop_distance_pct: levels.stop_distance_pct(entry),
        };
        let (leverage, leverage_notes) = match self.leverage.select(&fused.symbol, &inputs, &open) {
            LeverageDecision::Selected { leverage, notes } => (leverage, notes),
            LeverageDecision::Blocked { reason } => {
                return Err(ProposalRejection::LeverageBlocked(reason))
            }
        };

        let kelly = self.sizer.kelly_fraction(stats);
        let quantity = self.sizer.quantity(kelly.fraction, leverage, entry);
        if quantity <= Decimal::ZERO {
            return Err(ProposalRejection::ZeroQuantity);
        }

        let timeframe = fused
            .dominant_timeframe()
            .unwrap_or(self.config.atr_timeframe);
        let rationale = rationale(fused, &levels, &kelly, leverage, &leverage_notes);

        debug!(symbol = %fused.symbol, leverage, %quantity, "Built proposal");

        Ok(TradeProposal {
            symbol: fused.symbol.clone(),
            signal_type,
            entry_price: entry,
            quantity,
            stop_loss: levels.stop_loss,
            take_profit: levels.take_profit,
            leverage,
            kelly,
            risk_reward: levels.risk_reward,
            confidence: fused.confidence,
            regime: fused.regime,
            timeframe,
            strategy: strategy.to_string(),
            rationale,
        })
    }

    /// Trailing stop, profit targets and stop check for one symbol after a
    /// mark update. Uses the ATR cached by the last scan.
    pub fn on_mark_update(&self, symbol: &str) -> Vec<ExitAction> {
        let mut actions = Vec::new();
        let symbol = normalize_symbol(symbol);
        let atr = self.cached_atr(&symbol);
        let k = self.config.trailing_atr_multiplier;
        let config = &self.config;

        let amended = self.store.amend(&symbol, |pos| {
            let mut changed = false;
            let mut next = pos.clone();

            if let Some(update) = exits::evaluate_profit_targets(&next, config) {
                if let Some(stop) = update.breakeven_stop {
                    actions.push(ExitAction::BreakevenSecured {
                        symbol: symbol.clone(),
                        stop,
                    });
                }
                for take in update.takes {
                    actions.push(ExitAction::TakeProfit {
                        symbol: symbol.clone(),
                        take,
                    });
                }
                next = update.position;
                changed = true;
            }

            if let Some(atr) = atr {
                if let Some(trailed) = exits::apply_trailing_stop(&next, atr, k) {
                    if let Some(stop) = trailed.strategy_stop_price {
                        actions.push(ExitAction::StopMoved {
                            symbol: symbol.clone(),
                            stop,
                        });
                    }
                    next = trailed;
                    changed = true;
                }
            }

            changed.then_some(next)
        });

        let current = amended.or_else(|| self.store.get(&symbol));
        if let Some(pos) = current {
            if exits::stop_hit(&pos) {
                if let Some(stop) = pos.strategy_stop_price {
                    actions.push(ExitAction::StopHit {
                        symbol: symbol.clone(),
                        stop,
                        mark: pos.mark_price,
                    });
                }
            }
        }

        for action in &actions {
            info!(action = ?action, "Exit action");
        }
        actions
    }
}

fn rationale(
    fused: &FusedSignal,
    levels: &EntryLevels,
    kelly: &KellySizing,
    leverage: u32,
    leverage_notes: &[String],
) -> String {
    let agreeing = fused
        .timeframes
        .iter()
        .filter(|t| t.direction == fused.direction)
        .count();
    let w = fused.contributing_weights.as_array();

    let mut text = format!(
        "{} {}: {}/{} timeframes agree, confluence {}% (confidence {}%), regime {}",
        fused.direction,
        fused.symbol,
        agreeing,
        fused.timeframes.len(),
        exits::pct(fused.confluence_ratio),
        exits::pct(fused.confidence),
        fused.regime,
    );
    let _ = write!(
        text,
        "; weights T{:.2}/A{:.2}/S{:.2}, composite {:.2}",
        w[0], w[1], w[2], fused.composite_score
    );
    let sizing = match kelly.method {
        SizingMethod::Kelly => "Kelly",
        SizingMethod::Fallback => "fallback",
    };
    let _ = write!(
        text,
        "; size {}% equity ({sizing}), {leverage}x [{}]",
        exits::pct(kelly.fraction),
        leverage_notes.join(", ")
    );
    let source = |s: LevelSource| match s {
        LevelSource::Atr => "ATR",
        LevelSource::Commentary => "AI",
    };
    let _ = write!(
        text,
        "; SL {} ({}) TP {} ({}), RRR {:.2}",
        levels.stop_loss,
        source(levels.stop_source),
        levels.take_profit,
        source(levels.target_source),
        levels.risk_reward
    );
    if fused.is_degraded() {
        let dropped: Vec<String> = fused.degraded.iter().map(|f| f.to_string()).collect();
        let _ = write!(text, "; degraded: {} unavailable", dropped.join(", "));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, Factor, RawPositionUpdate, TimeframeSignal, WeightProfile};
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn fused(direction: Direction, confidence: f64) -> FusedSignal {
        let votes = [Timeframe::M15, Timeframe::H1, Timeframe::H4]
            .into_iter()
            .map(|tf| TimeframeSignal {
                symbol: "BTCUSDT".into(),
                timeframe: tf,
                direction,
                strength: 0.6,
                importance: tf.default_importance(),
                score: direction.sign() * 0.6,
            })
            .collect();
        FusedSignal {
            symbol: "BTCUSDT".into(),
            direction,
            confluence_ratio: 1.0,
            confidence,
            regime: Regime::Bull,
            contributing_weights: WeightProfile::new([0.5, 0.3, 0.2], Regime::Bull, 0),
            effective_weights: [0.5 / 0.7, 0.0, 0.2 / 0.7],
            composite_score: 0.5,
            timeframes: votes,
            degraded: vec![Factor::Ai],
            generated_at: Utc::now(),
        }
    }

    fn market() -> MarketContext {
        MarketContext {
            price: dec!(50000),
            atr: Some(dec!(500)),
            volatility: Some(0.03),
            support: None,
            resistance: None,
        }
    }

    #[test]
    fn test_proposal_is_sized_and_explained() {
        let store = Arc::new(PositionStore::new());
        let rm = RiskManager::new(RiskConfig::default(), store);

        let p = rm
            .propose(&fused(Direction::Buy, 0.72), &market(), None, None, "mtf_confluence")
            .unwrap();

        assert_eq!(p.signal_type, SignalType::Buy);
        assert_eq!(p.stop_loss, dec!(49000));
        assert_eq!(p.take_profit, dec!(52000));
        assert_eq!(p.leverage, 8); // 7 base + 1 confidence
        assert_eq!(p.kelly.method, SizingMethod::Fallback);
        // 10000 * 0.02 * 8 / 50000
        assert_eq!(p.quantity, dec!(0.032));
        assert_eq!(p.timeframe, Timeframe::H4);
        assert!(p.rationale.contains("degraded"));
        assert!(p.rationale.contains("regime BULL"));
    }

    #[test]
    fn test_low_risk_reward_is_rejected() {
        let config = RiskConfig {
            atr_target_multiplier: dec!(2),
            ..Default::default()
        };
        let rm = RiskManager::new(config, Arc::new(PositionStore::new()));

        let err = rm
            .propose(&fused(Direction::Sell, 0.6), &market(), None, None, "s")
            .unwrap_err();
        assert!(matches!(err, ProposalRejection::RiskRewardTooLow { .. }));
    }

    #[test]
    fn test_correlated_exposure_read_from_store() {
        let store = Arc::new(PositionStore::new());
        let rm = RiskManager::new(RiskConfig::default(), store.clone());
        let before = rm
            .propose(&fused(Direction::Buy, 0.6), &market(), None, None, "s")
            .unwrap();

        let raw: RawPositionUpdate =
            serde_json::from_value(json!({"side":"Buy","size":"1","avgPrice":"50000"})).unwrap();
        store.apply_update("BTCUSDT", &raw, Utc::now());

        let after = rm
            .propose(&fused(Direction::Buy, 0.6), &market(), None, None, "s")
            .unwrap();
        assert_eq!(after.leverage, before.leverage - 1);
    }

    #[test]
    fn test_mark_updates_trail_stop_and_take_profit() {
        let store = Arc::new(PositionStore::new());
        let rm = RiskManager::new(RiskConfig::default(), store.clone());
        rm.record_atr("BTCUSDT", dec!(500));
        let t0 = Utc::now();

        let open: RawPositionUpdate = serde_json::from_value(
            json!({"side":"Buy","size":"1","avgPrice":"50000","markPrice":"50000"}),
        )
        .unwrap();
        store.apply_update("BTCUSDT", &open, t0);
        let actions = rm.on_mark_update("BTCUSDT");
        assert_eq!(
            actions,
            vec![ExitAction::StopMoved {
                symbol: "BTCUSDT".into(),
                stop: dec!(49000)
            }]
        );

        let up: RawPositionUpdate = serde_json::from_value(json!({"markPrice":"52000"})).unwrap();
        store.apply_update("BTCUSDT", &up, t0 + chrono::Duration::seconds(1));
        let actions = rm.on_mark_update("BTCUSDT");
        // 4% return crosses the 1.5% and 3% targets
        assert!(actions.contains(&ExitAction::BreakevenSecured {
            symbol: "BTCUSDT".into(),
            stop: dec!(50000)
        }));
        assert_eq!(
            actions
                .iter()
                .filter(|a| matches!(a, ExitAction::TakeProfit { .. }))
                .count(),
            2
        );
        assert_eq!(store.get("BTCUSDT").unwrap().strategy_stop_price, Some(dec!(51000)));

        let down: RawPositionUpdate = serde_json::from_value(json!({"markPrice":"50900"})).unwrap();
        store.apply_update("BTCUSDT", &down, t0 + chrono::Duration::seconds(2));
        let actions = rm.on_mark_update("BTCUSDT");
        assert!(matches!(actions.as_slice(), [ExitAction::StopHit { .. }]));
        assert_eq!(store.get("BTCUSDT").unwrap().strategy_stop_price, Some(dec!(51000)));
    }
}
