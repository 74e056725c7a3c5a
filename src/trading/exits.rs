//! Exit management: initial stop/target levels, the ATR trailing stop and
//! partial profit-taking.
//!
//! Everything here is a pure function of a position snapshot; the risk manager
//! applies results through the position store's atomic `amend`.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::api::AiCommentary;
use crate::models::{Position, Side, SignalType};

use super::RiskConfig;

/// Trailing stop candidate: extremum - k*ATR for LONG, + k*ATR for SHORT.
pub fn trailing_candidate(side: Side, extremum: Decimal, atr: Decimal, k: Decimal) -> Option<Decimal> {
    if atr <= Decimal::ZERO || extremum <= Decimal::ZERO {
        return None;
    }
    match side {
        Side::Long => Some(extremum - k * atr),
        Side::Short => Some(extremum + k * atr),
        Side::Flat => None,
    }
}

/// True if `candidate` is strictly more protective than `current`.
pub fn is_tighter(side: Side, current: Option<Decimal>, candidate: Decimal) -> bool {
    match (side, current) {
        (Side::Flat, _) => false,
        (_, None) => true,
        (Side::Long, Some(cur)) => candidate > cur,
        (Side::Short, Some(cur)) => candidate < cur,
    }
}

/// Ratchet the strategy stop from the favourable extremum.
///
/// Returns the updated position only when the stop moved.
pub fn apply_trailing_stop(pos: &Position, atr: Decimal, k: Decimal) -> Option<Position> {
    if !pos.is_open() {
        return None;
    }
    let candidate = trailing_candidate(pos.side, pos.extremum()?, atr, k)?;
    if !is_tighter(pos.side, pos.strategy_stop_price, candidate) {
        return None;
    }
    let mut next = pos.clone();
    next.strategy_stop_price = Some(candidate);
    Some(next)
}

/// One partial close to hand to the execution collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfitTake {
    pub index: usize,
    pub threshold: f64,
    pub quantity: Decimal,
}

/// Result of a profit-target evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfitTargetUpdate {
    pub position: Position,
    pub takes: Vec<ProfitTake>,
    /// Stop moved to breakeven by this evaluation
    pub breakeven_stop: Option<Decimal>,
}

/// Fire every profit threshold crossed for the first time.
///
/// Each threshold fires at most once per position lifecycle. The first one to
/// fire also moves the stop to entry when that is tighter.
pub fn evaluate_profit_targets(pos: &Position, config: &RiskConfig) -> Option<ProfitTargetUpdate> {
    if !pos.is_open() {
        return None;
    }
    let ret = pos.return_pct();
    let mut next = pos.clone();
    let mut takes = Vec::new();
    let mut remaining = pos.size;

    for (index, threshold) in config.profit_targets.iter().enumerate().take(8) {
        if ret < *threshold || next.profit_target_taken(index) {
            continue;
        }
        next.profit_targets_taken |= 1 << index;

        let base = if pos.initial_quantity > Decimal::ZERO {
            pos.initial_quantity
        } else {
            pos.size
        };
        let quantity = (base * config.profit_take_fraction)
            .round_dp_with_strategy(config.quantity_decimals, rust_decimal::RoundingStrategy::ToZero)
            .min(remaining);
        remaining -= quantity;

        takes.push(ProfitTake {
            index,
            threshold: *threshold,
            quantity,
        });
    }

    if takes.is_empty() {
        return None;
    }

    let mut breakeven_stop = None;
    if !next.first_profit_target_taken {
        next.first_profit_target_taken = true;
        if next.entry_price > Decimal::ZERO
            && is_tighter(next.side, next.strategy_stop_price, next.entry_price)
        {
            next.strategy_stop_price = Some(next.entry_price);
            breakeven_stop = Some(next.entry_price);
        }
        next.secure_profit_stop_applied = secures_entry(&next);
    }

    Some(ProfitTargetUpdate {
        position: next,
        takes,
        breakeven_stop,
    })
}

/// True when the strategy stop sits at entry or on the profitable side of it.
pub fn secures_entry(pos: &Position) -> bool {
    match (pos.side, pos.strategy_stop_price) {
        (_, _) if pos.entry_price <= Decimal::ZERO => false,
        (Side::Long, Some(stop)) => stop >= pos.entry_price,
        (Side::Short, Some(stop)) => stop <= pos.entry_price,
        _ => false,
    }
}

/// True when the mark price has crossed the strategy stop.
pub fn stop_hit(pos: &Position) -> bool {
    match (pos.side, pos.strategy_stop_price) {
        (Side::Long, Some(stop)) => pos.mark_price > Decimal::ZERO && pos.mark_price <= stop,
        (Side::Short, Some(stop)) => pos.mark_price > Decimal::ZERO && pos.mark_price >= stop,
        _ => false,
    }
}

/// Where the initial stop and target came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelSource {
    Atr,
    Commentary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryLevels {
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub risk_reward: f64,
    pub stop_source: LevelSource,
    pub target_source: LevelSource,
}

impl EntryLevels {
    /// |entry - stop| / entry
    pub fn stop_distance_pct(&self, entry: Decimal) -> f64 {
        if entry <= Decimal::ZERO {
            return 0.0;
        }
        ((entry - self.stop_loss).abs() / entry).to_f64().unwrap_or(0.0)
    }
}

/// Initial stop and target for a new position.
///
/// ATR multiples by default; commentary levels replace them when they lie on
/// the correct side of entry.
pub fn entry_levels(
    signal_type: SignalType,
    entry: Decimal,
    atr: Option<Decimal>,
    commentary: Option<&AiCommentary>,
    config: &RiskConfig,
) -> Option<EntryLevels> {
    if entry <= Decimal::ZERO {
        return None;
    }
    let long = signal_type == SignalType::Buy;
    let valid_stop = |s: Decimal| s > Decimal::ZERO && if long { s < entry } else { s > entry };
    let valid_target = |t: Decimal| t > Decimal::ZERO && if long { t > entry } else { t < entry };

    let atr = atr.filter(|a| *a > Decimal::ZERO);
    let atr_stop = atr.map(|a| {
        let d = a * config.atr_stop_multiplier;
        if long { entry - d } else { entry + d }
    });
    let atr_target = atr.map(|a| {
        let d = a * config.atr_target_multiplier;
        if long { entry + d } else { entry - d }
    });

    let ai_stop = commentary.and_then(|c| c.stop_loss).filter(|s| valid_stop(*s));
    let ai_target = commentary.and_then(|c| c.take_profit).filter(|t| valid_target(*t));

    let (stop_loss, stop_source) = match (ai_stop, atr_stop.filter(|s| valid_stop(*s))) {
        (Some(s), _) => (s, LevelSource::Commentary),
        (None, Some(s)) => (s, LevelSource::Atr),
        (None, None) => return None,
    };
    let (take_profit, target_source) = match (ai_target, atr_target.filter(|t| valid_target(*t))) {
        (Some(t), _) => (t, LevelSource::Commentary),
        (None, Some(t)) => (t, LevelSource::Atr),
        (None, None) => return None,
    };

    let risk = (entry - stop_loss).abs();
    let reward = (take_profit - entry).abs();
    let risk_reward = if risk > Decimal::ZERO {
        (reward / risk).to_f64().unwrap_or(0.0)
    } else {
        0.0
    };

    Some(EntryLevels {
        stop_loss,
        take_profit,
        risk_reward,
        stop_source,
        target_source,
    })
}

/// Percentage helper for rationale text.
pub(crate) fn pct(v: f64) -> Decimal {
    Decimal::from_f64(v * 100.0).unwrap_or(Decimal::ZERO).round_dp(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn long(entry: Decimal, mark: Decimal) -> Position {
        let mut p = Position::flat("BTCUSDT", Utc::now());
        p.side = Side::Long;
        p.size = dec!(1);
        p.initial_quantity = dec!(1);
        p.entry_price = entry;
        p.mark_price = mark;
        p.highest_price_since_entry = Some(entry.max(mark));
        p
    }

    fn tick(p: &Position, mark: Decimal) -> Position {
        let mut next = p.clone();
        next.mark_price = mark;
        next.highest_price_since_entry = next.highest_price_since_entry.map(|h| h.max(mark));
        next
    }

    #[test]
    fn test_trailing_stop_ratchets_and_never_loosens() {
        let k = dec!(2);
        let atr = dec!(500);

        let p = long(dec!(50000), dec!(50000));
        let p = apply_trailing_stop(&p, atr, k).unwrap();
        assert_eq!(p.strategy_stop_price, Some(dec!(49000)));

        let p = tick(&p, dec!(52000));
        let p = apply_trailing_stop(&p, atr, k).unwrap();
        assert_eq!(p.strategy_stop_price, Some(dec!(51000)));

        let p = tick(&p, dec!(50500));
        assert!(apply_trailing_stop(&p, atr, k).is_none());
        assert_eq!(p.strategy_stop_price, Some(dec!(51000)));
    }

    #[test]
    fn test_trailing_stop_non_decreasing_over_rising_marks() {
        let mut p = long(dec!(100), dec!(100));
        let mut last = Decimal::MIN;
        for step in 0..50 {
            p = tick(&p, dec!(100) + Decimal::from(step));
            if let Some(next) = apply_trailing_stop(&p, dec!(1.5), dec!(2)) {
                p = next;
            }
            let stop = p.strategy_stop_price.unwrap();
            assert!(stop >= last);
            last = stop;
        }
    }

    #[test]
    fn test_short_trailing_stop_moves_down() {
        let mut p = Position::flat("ETHUSDT", Utc::now());
        p.side = Side::Short;
        p.size = dec!(1);
        p.lowest_price_since_entry = Some(dec!(1900));
        p.strategy_stop_price = Some(dec!(2100));

        let next = apply_trailing_stop(&p, dec!(20), dec!(2)).unwrap();
        assert_eq!(next.strategy_stop_price, Some(dec!(1940)));
    }

    #[test]
    fn test_profit_target_fires_once() {
        let config = RiskConfig::default();

        let p = long(dec!(100), dec!(101.6));
        let update = evaluate_profit_targets(&p, &config).unwrap();
        assert_eq!(update.takes.len(), 1);
        assert_eq!(update.takes[0].quantity, dec!(0.25));
        assert_eq!(update.breakeven_stop, Some(dec!(100)));
        assert!(update.position.first_profit_target_taken);
        assert!(update.position.secure_profit_stop_applied);

        // retrace below and re-cross the first threshold
        let p = tick(&update.position, dec!(100.5));
        assert!(evaluate_profit_targets(&p, &config).is_none());
        let p = tick(&p, dec!(101.7));
        assert!(evaluate_profit_targets(&p, &config).is_none());
    }

    #[test]
    fn test_gap_through_several_targets_fires_each() {
        let config = RiskConfig::default();
        let p = long(dec!(100), dec!(106));

        let update = evaluate_profit_targets(&p, &config).unwrap();

        let fired: Vec<_> = update.takes.iter().map(|t| t.index).collect();
        assert_eq!(fired, vec![0, 1, 2]);
        assert_eq!(update.position.profit_targets_taken, 0b111);
        assert!(evaluate_profit_targets(&update.position, &config).is_none());
    }

    #[test]
    fn test_breakeven_does_not_loosen_a_tighter_stop() {
        let config = RiskConfig::default();
        let mut p = long(dec!(100), dec!(102));
        p.strategy_stop_price = Some(dec!(101));

        let update = evaluate_profit_targets(&p, &config).unwrap();

        assert_eq!(update.breakeven_stop, None);
        assert_eq!(update.position.strategy_stop_price, Some(dec!(101)));
        assert!(update.position.secure_profit_stop_applied);
    }

    #[test]
    fn test_secure_flag_follows_stop_position() {
        let mut p = long(dec!(100), dec!(102));
        assert!(!secures_entry(&p));
        p.strategy_stop_price = Some(dec!(99.9));
        assert!(!secures_entry(&p));
        p.strategy_stop_price = Some(dec!(100));
        assert!(secures_entry(&p));

        p.side = Side::Short;
        p.strategy_stop_price = Some(dec!(100.1));
        assert!(!secures_entry(&p));
        p.strategy_stop_price = Some(dec!(98));
        assert!(secures_entry(&p));

        p.entry_price = Decimal::ZERO;
        assert!(!secures_entry(&p));
    }

    #[test]
    fn test_entry_levels_from_atr_and_commentary() {
        let config = RiskConfig::default();

        let levels = entry_levels(SignalType::Buy, dec!(100), Some(dec!(2)), None, &config).unwrap();
        assert_eq!(levels.stop_loss, dec!(96));
        assert_eq!(levels.take_profit, dec!(108));
        assert!((levels.risk_reward - 2.0).abs() < 1e-9);

        let ai = AiCommentary {
            stop_loss: Some(dec!(97)),
            take_profit: Some(dec!(90)), // wrong side for a long: ignored
            ..Default::default()
        };
        let levels = entry_levels(SignalType::Buy, dec!(100), Some(dec!(2)), Some(&ai), &config).unwrap();
        assert_eq!(levels.stop_loss, dec!(97));
        assert_eq!(levels.stop_source, LevelSource::Commentary);
        assert_eq!(levels.take_profit, dec!(108));
        assert_eq!(levels.target_source, LevelSource::Atr);

        let short = entry_levels(SignalType::Sell, dec!(100), Some(dec!(2)), None, &config).unwrap();
        assert_eq!(short.stop_loss, dec!(104));
        assert_eq!(short.take_profit, dec!(92));

        assert!(entry_levels(SignalType::Buy, dec!(100), None, None, &config).is_none());
    }

    #[test]
    fn test_stop_hit() {
        let mut p = long(dec!(100), dec!(99));
        p.strategy_stop_price = Some(dec!(99.5));
        assert!(stop_hit(&p));
        p.mark_price = dec!(100);
        assert!(!stop_hit(&p));
    }
}
