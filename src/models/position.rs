//! Live leveraged position as tracked by the position store.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Side of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
    Flat,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
            Self::Flat => "FLAT",
        }
    }
}

/// Current position in a perpetual contract.
///
/// Exchange fields are overwritten by the stream; strategy fields
/// (`strategy_stop_price` through `profit_targets_taken`) are owned by the
/// risk manager and reset whenever the position closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Contract symbol, e.g. BTCUSDT
    pub symbol: String,

    pub side: Side,

    /// Contracts held, never negative
    pub size: Decimal,

    /// Average entry price
    pub entry_price: Decimal,

    /// Latest mark price
    pub mark_price: Decimal,

    /// Notional value reported by the exchange
    pub position_value: Decimal,

    pub unrealized_pnl: Decimal,

    /// Cumulative realized P&L for this contract
    pub realized_pnl: Decimal,

    pub leverage: Decimal,

    pub exchange_stop_loss: Option<Decimal>,
    pub exchange_take_profit: Option<Decimal>,

    /// Exchange status string (Normal, Liq, Adl)
    pub position_status: String,

    pub liquidation_price: Option<Decimal>,
    pub initial_margin: Decimal,

    /// Trailing stop maintained by the risk manager
    pub strategy_stop_price: Option<Decimal>,

    /// Highest mark since entry (LONG only)
    pub highest_price_since_entry: Option<Decimal>,

    /// Lowest mark since entry (SHORT only)
    pub lowest_price_since_entry: Option<Decimal>,

    /// Size at open, base for partial profit-taking
    pub initial_quantity: Decimal,

    pub first_profit_target_taken: bool,
    pub secure_profit_stop_applied: bool,

    /// Bit i set once profit threshold i has fired
    pub profit_targets_taken: u8,

    /// Source timestamp of the last applied update
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Empty FLAT position for a symbol with no history.
    pub fn flat(symbol: &str, updated_at: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: Side::Flat,
            size: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            mark_price: Decimal::ZERO,
            position_value: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            leverage: Decimal::ZERO,
            exchange_stop_loss: None,
            exchange_take_profit: None,
            position_status: String::new(),
            liquidation_price: None,
            initial_margin: Decimal::ZERO,
            strategy_stop_price: None,
            highest_price_since_entry: None,
            lowest_price_since_entry: None,
            initial_quantity: Decimal::ZERO,
            first_profit_target_taken: false,
            secure_profit_stop_applied: false,
            profit_targets_taken: 0,
            updated_at,
        }
    }

    pub fn is_open(&self) -> bool {
        self.size > Decimal::ZERO && self.side != Side::Flat
    }

    /// Favourable extremum for the current side.
    pub fn extremum(&self) -> Option<Decimal> {
        match self.side {
            Side::Long => self.highest_price_since_entry,
            Side::Short => self.lowest_price_since_entry,
            Side::Flat => None,
        }
    }

    /// Signed return of mark against entry, in the position's favour.
    pub fn return_pct(&self) -> f64 {
        if self.entry_price <= Decimal::ZERO || self.mark_price <= Decimal::ZERO {
            return 0.0;
        }
        let raw = (self.mark_price - self.entry_price) / self.entry_price;
        let signed = match self.side {
            Side::Long => raw,
            Side::Short => -raw,
            Side::Flat => Decimal::ZERO,
        };
        signed.to_f64().unwrap_or(0.0)
    }

    /// Entry notional.
    pub fn entry_notional(&self) -> Decimal {
        self.size * self.entry_price
    }

    pub fn profit_target_taken(&self, index: usize) -> bool {
        index < 8 && self.profit_targets_taken & (1 << index) != 0
    }

    /// Clear every strategy-tracked field.
    pub fn reset_strategy_state(&mut self) {
        self.strategy_stop_price = None;
        self.highest_price_since_entry = None;
        self.lowest_price_since_entry = None;
        self.initial_quantity = Decimal::ZERO;
        self.first_profit_target_taken = false;
        self.secure_profit_stop_applied = false;
        self.profit_targets_taken = 0;
    }
}

/// One position message from the exchange stream.
///
/// Every field is kept as raw JSON so that a single malformed value can be
/// rejected without losing the rest of the update.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPositionUpdate {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub side: Option<Value>,
    #[serde(default)]
    pub size: Option<Value>,
    #[serde(default, alias = "entryPrice")]
    pub avg_price: Option<Value>,
    #[serde(default)]
    pub mark_price: Option<Value>,
    #[serde(default)]
    pub position_value: Option<Value>,
    #[serde(default, alias = "unrealizedPnl")]
    pub unrealised_pnl: Option<Value>,
    #[serde(default, alias = "realizedPnl", alias = "curRealisedPnl")]
    pub cum_realised_pnl: Option<Value>,
    #[serde(default)]
    pub stop_loss: Option<Value>,
    #[serde(default)]
    pub take_profit: Option<Value>,
    #[serde(default)]
    pub position_status: Option<Value>,
    #[serde(default)]
    pub leverage: Option<Value>,
    #[serde(default, alias = "updatedAt")]
    pub updated_time: Option<Value>,
    #[serde(default, alias = "liquidationPrice")]
    pub liq_price: Option<Value>,
    #[serde(default, rename = "positionIM", alias = "initialMargin")]
    pub position_im: Option<Value>,
}
