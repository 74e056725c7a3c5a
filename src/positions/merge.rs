//! Pure merge of an exchange update into a stored position.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use crate::errors::FieldError;
use crate::models::{Position, RawPositionUpdate, Side};

/// How the merged position relates to the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Size went from zero (or nothing) to positive, or the side flipped.
    Opened,
    Updated,
    /// Size went from positive to zero.
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Applied {
        position: Position,
        transition: Transition,
    },
    /// Update older than the stored state; nothing changes.
    Stale { stored_at: DateTime<Utc> },
}

/// Merge result plus the fields that could not be used.
#[derive(Debug, Clone, PartialEq)]
pub struct Merged {
    pub outcome: MergeOutcome,
    pub field_errors: Vec<FieldError>,
}

/// Compute the position that results from applying `raw` at `ts` over `old`.
///
/// Updates with `ts` earlier than the stored `updated_at` are rejected. Absent
/// fields keep their previous value, as do malformed ones (reported in
/// `field_errors`).
pub fn merge(
    old: Option<&Position>,
    symbol: &str,
    raw: &RawPositionUpdate,
    ts: DateTime<Utc>,
) -> Merged {
    if let Some(prev) = old {
        if ts < prev.updated_at {
            return Merged {
                outcome: MergeOutcome::Stale {
                    stored_at: prev.updated_at,
                },
                field_errors: Vec::new(),
            };
        }
    }

    let mut errors = Vec::new();
    let mut next = old.cloned().unwrap_or_else(|| Position::flat(symbol, ts));

    if let Some(side) = field(&mut errors, parse_side(raw.side.as_ref())) {
        next.side = side;
    }
    if let Some(size) = field(&mut errors, parse_size(raw.size.as_ref())) {
        next.size = size;
    }
    set_decimal(&mut errors, &mut next.entry_price, "avgPrice", raw.avg_price.as_ref());
    set_decimal(&mut errors, &mut next.mark_price, "markPrice", raw.mark_price.as_ref());
    set_decimal(&mut errors, &mut next.position_value, "positionValue", raw.position_value.as_ref());
    set_decimal(&mut errors, &mut next.unrealized_pnl, "unrealisedPnl", raw.unrealised_pnl.as_ref());
    set_decimal(&mut errors, &mut next.realized_pnl, "cumRealisedPnl", raw.cum_realised_pnl.as_ref());
    set_decimal(&mut errors, &mut next.leverage, "leverage", raw.leverage.as_ref());
    set_decimal(&mut errors, &mut next.initial_margin, "positionIM", raw.position_im.as_ref());
    set_level(&mut errors, &mut next.exchange_stop_loss, "stopLoss", raw.stop_loss.as_ref());
    set_level(&mut errors, &mut next.exchange_take_profit, "takeProfit", raw.take_profit.as_ref());
    set_level(&mut errors, &mut next.liquidation_price, "liqPrice", raw.liq_price.as_ref());
    if let Some(Value::String(status)) = raw.position_status.as_ref() {
        next.position_status = status.clone();
    }
    next.updated_at = ts;

    let was_open = old.is_some_and(Position::is_open);
    if next.size.is_zero() {
        next.side = Side::Flat;
    } else if next.side == Side::Flat {
        errors.push(FieldError::MissingSide {
            size: next.size.to_string(),
        });
    }
    let now_open = next.is_open();
    let flipped = was_open && now_open && old.is_some_and(|p| p.side != next.side);

    let mark = next.mark_price;
    let transition = if now_open && (!was_open || flipped) {
        next.reset_strategy_state();
        next.initial_quantity = next.size;
        let seed = if next.entry_price > Decimal::ZERO {
            next.entry_price
        } else {
            mark
        };
        extend_extremum(&mut next, seed);
        extend_extremum(&mut next, mark);
        Transition::Opened
    } else if now_open {
        if next.initial_quantity.is_zero() {
            next.initial_quantity = next.size;
        }
        extend_extremum(&mut next, mark);
        Transition::Updated
    } else if was_open {
        next.reset_strategy_state();
        Transition::Closed
    } else {
        Transition::Updated
    };

    Merged {
        outcome: MergeOutcome::Applied {
            position: next,
            transition,
        },
        field_errors: errors,
    }
}

/// Move the favourable extremum towards `price`; never retract it.
fn extend_extremum(pos: &mut Position, price: Decimal) {
    if price <= Decimal::ZERO {
        return;
    }
    match pos.side {
        Side::Long => {
            let high = pos.highest_price_since_entry.map_or(price, |h| h.max(price));
            pos.highest_price_since_entry = Some(high);
        }
        Side::Short => {
            let low = pos.lowest_price_since_entry.map_or(price, |l| l.min(price));
            pos.lowest_price_since_entry = Some(low);
        }
        Side::Flat => {}
    }
}

fn field<T>(errors: &mut Vec<FieldError>, parsed: Result<Option<T>, FieldError>) -> Option<T> {
    match parsed {
        Ok(value) => value,
        Err(e) => {
            errors.push(e);
            None
        }
    }
}

fn set_decimal(
    errors: &mut Vec<FieldError>,
    slot: &mut Decimal,
    name: &'static str,
    raw: Option<&Value>,
) {
    if let Some(v) = field(errors, parse_decimal(name, raw)) {
        *slot = v;
    }
}

/// Stop, target and liquidation levels: zero means "not set" on the exchange.
fn set_level(
    errors: &mut Vec<FieldError>,
    slot: &mut Option<Decimal>,
    name: &'static str,
    raw: Option<&Value>,
) {
    if let Some(v) = field(errors, parse_decimal(name, raw)) {
        *slot = (v > Decimal::ZERO).then_some(v);
    }
}

/// Parse a numeric field given as a JSON number or string.
///
/// `Ok(None)` means the field is absent (missing, null or empty string).
pub fn parse_decimal(name: &'static str, raw: Option<&Value>) -> Result<Option<Decimal>, FieldError> {
    let text = match raw {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => {
            return Err(FieldError::NotNumeric {
                field: name,
                raw: other.to_string(),
            })
        }
    };

    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map(Some)
        .map_err(|_| FieldError::NotNumeric {
            field: name,
            raw: text,
        })
}

fn parse_size(raw: Option<&Value>) -> Result<Option<Decimal>, FieldError> {
    match parse_decimal("size", raw)? {
        Some(size) if size < Decimal::ZERO => Err(FieldError::Negative {
            field: "size",
            raw: size.to_string(),
        }),
        other => Ok(other),
    }
}

fn parse_side(raw: Option<&Value>) -> Result<Option<Side>, FieldError> {
    let Some(value) = raw else {
        return Ok(None);
    };
    let Value::String(s) = value else {
        return Err(FieldError::Unknown {
            field: "side",
            raw: value.to_string(),
        });
    };
    match s.trim().to_lowercase().as_str() {
        "buy" | "long" => Ok(Some(Side::Long)),
        "sell" | "short" => Ok(Some(Side::Short)),
        "" | "none" | "flat" => Ok(Some(Side::Flat)),
        _ => Err(FieldError::Unknown {
            field: "side",
            raw: s.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn update(v: serde_json::Value) -> RawPositionUpdate {
        serde_json::from_value(v).unwrap()
    }

    fn applied(m: Merged) -> (Position, Transition) {
        match m.outcome {
            MergeOutcome::Applied { position, transition } => (position, transition),
            MergeOutcome::Stale { .. } => panic!("expected applied"),
        }
    }

    #[test]
    fn test_fresh_open_seeds_quantity_and_extremum() {
        let t0 = Utc::now();
        let raw = update(json!({"side":"Buy","size":"0.5","avgPrice":"50000","markPrice":"50200"}));

        let (pos, transition) = applied(merge(None, "BTCUSDT", &raw, t0));

        assert_eq!(transition, Transition::Opened);
        assert_eq!(pos.side, Side::Long);
        assert_eq!(pos.initial_quantity, dec!(0.5));
        assert_eq!(pos.highest_price_since_entry, Some(dec!(50200)));
        assert_eq!(pos.lowest_price_since_entry, None);
        assert_eq!(pos.updated_at, t0);
    }

    #[test]
    fn test_extremum_never_retracts() {
        let t0 = Utc::now();
        let open = update(json!({"side":"Sell","size":"1","avgPrice":"2000","markPrice":"2000"}));
        let (pos, _) = applied(merge(None, "ETHUSDT", &open, t0));

        let down = update(json!({"markPrice":"1900"}));
        let (pos, _) = applied(merge(Some(&pos), "ETHUSDT", &down, t0 + Duration::seconds(1)));
        assert_eq!(pos.lowest_price_since_entry, Some(dec!(1900)));

        let up = update(json!({"markPrice":"1980"}));
        let (pos, _) = applied(merge(Some(&pos), "ETHUSDT", &up, t0 + Duration::seconds(2)));
        assert_eq!(pos.lowest_price_since_entry, Some(dec!(1900)));
        assert_eq!(pos.mark_price, dec!(1980));
    }

    #[test]
    fn test_stale_update_is_rejected() {
        let t0 = Utc::now();
        let raw = update(json!({"side":"Buy","size":"1","avgPrice":"100","markPrice":"100"}));
        let (pos, _) = applied(merge(None, "SOLUSDT", &raw, t0));

        let late = update(json!({"markPrice":"90","size":"3"}));
        let merged = merge(Some(&pos), "SOLUSDT", &late, t0 - Duration::milliseconds(1));

        assert_eq!(merged.outcome, MergeOutcome::Stale { stored_at: t0 });
    }

    #[test]
    fn test_equal_timestamp_is_applied() {
        let t0 = Utc::now();
        let raw = update(json!({"side":"Buy","size":"1","avgPrice":"100","markPrice":"100"}));
        let (pos, _) = applied(merge(None, "SOLUSDT", &raw, t0));

        let same = update(json!({"markPrice":"101"}));
        let (pos, _) = applied(merge(Some(&pos), "SOLUSDT", &same, t0));
        assert_eq!(pos.mark_price, dec!(101));
    }

    #[test]
    fn test_close_resets_strategy_fields() {
        let t0 = Utc::now();
        let raw = update(json!({"side":"Buy","size":"2","avgPrice":"100","markPrice":"110"}));
        let (mut pos, _) = applied(merge(None, "SOLUSDT", &raw, t0));
        pos.first_profit_target_taken = true;
        pos.secure_profit_stop_applied = true;
        pos.profit_targets_taken = 0b1;
        pos.strategy_stop_price = Some(dec!(100));

        let close = update(json!({"side":"","size":"0"}));
        let (pos, transition) = applied(merge(Some(&pos), "SOLUSDT", &close, t0 + Duration::seconds(1)));

        assert_eq!(transition, Transition::Closed);
        assert_eq!(pos.side, Side::Flat);
        assert_eq!(pos.initial_quantity, Decimal::ZERO);
        assert!(!pos.first_profit_target_taken);
        assert!(!pos.secure_profit_stop_applied);
        assert_eq!(pos.profit_targets_taken, 0);
        assert_eq!(pos.strategy_stop_price, None);
        assert_eq!(pos.highest_price_since_entry, None);
    }

    #[test]
    fn test_reopen_after_close_is_fresh() {
        let t0 = Utc::now();
        let open = update(json!({"side":"Buy","size":"1","avgPrice":"100","markPrice":"130"}));
        let (pos, _) = applied(merge(None, "X", &open, t0));
        let close = update(json!({"size":"0"}));
        let (pos, _) = applied(merge(Some(&pos), "X", &close, t0 + Duration::seconds(1)));

        let reopen = update(json!({"side":"Buy","size":"3","avgPrice":"90","markPrice":"90"}));
        let (pos, transition) = applied(merge(Some(&pos), "X", &reopen, t0 + Duration::seconds(2)));

        assert_eq!(transition, Transition::Opened);
        assert_eq!(pos.initial_quantity, dec!(3));
        assert_eq!(pos.highest_price_since_entry, Some(dec!(90)));
    }

    #[test]
    fn test_side_flip_starts_new_lifecycle() {
        let t0 = Utc::now();
        let open = update(json!({"side":"Buy","size":"1","avgPrice":"100","markPrice":"120"}));
        let (mut pos, _) = applied(merge(None, "X", &open, t0));
        pos.first_profit_target_taken = true;

        let flip = update(json!({"side":"Sell","size":"2","avgPrice":"119","markPrice":"119"}));
        let (pos, transition) = applied(merge(Some(&pos), "X", &flip, t0 + Duration::seconds(1)));

        assert_eq!(transition, Transition::Opened);
        assert!(!pos.first_profit_target_taken);
        assert_eq!(pos.highest_price_since_entry, None);
        assert_eq!(pos.lowest_price_since_entry, Some(dec!(119)));
        assert_eq!(pos.initial_quantity, dec!(2));
    }

    #[test]
    fn test_malformed_field_keeps_prior_value() {
        let t0 = Utc::now();
        let open = update(json!({"side":"Buy","size":"1","avgPrice":"100","markPrice":"100","leverage":"10"}));
        let (pos, _) = applied(merge(None, "X", &open, t0));

        let bad = update(json!({"markPrice":"abc","leverage":"12","size":"-1"}));
        let merged = merge(Some(&pos), "X", &bad, t0 + Duration::seconds(1));
        assert_eq!(merged.field_errors.len(), 2);

        let (pos, _) = applied(merged);
        assert_eq!(pos.mark_price, dec!(100));
        assert_eq!(pos.size, dec!(1));
        assert_eq!(pos.leverage, dec!(12));
    }

    #[test]
    fn test_size_without_side_is_reported() {
        let t0 = Utc::now();
        let merged = merge(None, "X", &update(json!({"size":"2","avgPrice":"100"})), t0);
        assert_eq!(
            merged.field_errors,
            vec![FieldError::MissingSide { size: "2".into() }]
        );
        let (pos, _) = applied(merged);
        assert!(!pos.is_open());

        let merged = merge(None, "Y", &update(json!({"side":"Up","size":"1"})), t0);
        assert_eq!(merged.field_errors.len(), 2);

        let merged = merge(None, "Z", &update(json!({"side":"Sell","size":"1"})), t0);
        assert!(merged.field_errors.is_empty());
    }

    #[test]
    fn test_parse_decimal_accepts_numbers_and_strings() {
        assert_eq!(parse_decimal("x", Some(&json!(1.5))), Ok(Some(dec!(1.5))));
        assert_eq!(parse_decimal("x", Some(&json!("2.25"))), Ok(Some(dec!(2.25))));
        assert_eq!(parse_decimal("x", Some(&json!("1e-3"))), Ok(Some(dec!(0.001))));
        assert_eq!(parse_decimal("x", Some(&json!(""))), Ok(None));
        assert_eq!(parse_decimal("x", None), Ok(None));
        assert!(parse_decimal("x", Some(&json!(true))).is_err());
    }
}
