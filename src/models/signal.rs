//! Signal models: per-timeframe votes, fused decisions and persisted bot signals.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Regime, Timeframe, WeightProfile};

/// Directional vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
    Neutral,
}

impl Direction {
    /// +1 for BUY, -1 for SELL, 0 for NEUTRAL.
    pub fn sign(&self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
            Self::Neutral => 0.0,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Neutral => "NEUTRAL",
        })
    }
}

/// Scored vote of one timeframe for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeSignal {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub direction: Direction,
    /// |score|, in [0, 1]
    pub strength: f64,
    /// Confluence weight of this timeframe (>= 0)
    pub importance: f64,
    /// Signed technical score in [-1, 1]
    pub score: f64,
}

/// Scoring factor that contributes to a fused decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Factor {
    Technical,
    Ai,
    Sentiment,
}

impl fmt::Display for Factor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Technical => "technical",
            Self::Ai => "ai",
            Self::Sentiment => "sentiment",
        })
    }
}

/// Multi-timeframe decision for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct FusedSignal {
    pub symbol: String,
    pub direction: Direction,
    /// Weighted agreement of the winning (or best) direction
    pub confluence_ratio: f64,
    /// Display confidence in [0, 1]; 0 when NEUTRAL
    pub confidence: f64,
    pub regime: Regime,
    /// Profile pinned for this decision
    pub contributing_weights: WeightProfile,
    /// Effective [technical, ai, sentiment] weights after dropping missing factors
    pub effective_weights: [f64; 3],
    /// Weighted alignment of all available factors with `direction`, in [-1, 1]
    pub composite_score: f64,
    /// Votes that took part
    pub timeframes: Vec<TimeframeSignal>,
    /// Factors dropped from this decision (timeout, error or no data)
    pub degraded: Vec<Factor>,
    pub generated_at: DateTime<Utc>,
}

impl FusedSignal {
    pub fn is_actionable(&self) -> bool {
        self.direction != Direction::Neutral
    }

    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }

    /// Most important timeframe that voted with the decision.
    pub fn dominant_timeframe(&self) -> Option<Timeframe> {
        self.timeframes
            .iter()
            .filter(|s| s.direction == self.direction)
            .max_by(|a, b| a.importance.total_cmp(&b.importance))
            .map(|s| s.timeframe)
    }
}

/// Tradable side of a persisted signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalType {
    Buy,
    Sell,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    pub fn from_direction(direction: Direction) -> Option<Self> {
        match direction {
            Direction::Buy => Some(Self::Buy),
            Direction::Sell => Some(Self::Sell),
            Direction::Neutral => None,
        }
    }
}

impl FromStr for SignalType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => Err(format!("unknown signal type: {other}")),
        }
    }
}

/// Lifecycle status of a persisted signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
    Expired,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Executed => "EXECUTED",
            Self::Expired => "EXPIRED",
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Executed | Self::Expired)
    }

    /// Edges of the lifecycle graph.
    pub fn can_transition_to(&self, to: SignalStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Approved)
                | (Self::Pending, Self::Rejected)
                | (Self::Pending, Self::Expired)
                | (Self::Approved, Self::Executed)
        )
    }
}

impl fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            "EXECUTED" => Ok(Self::Executed),
            "EXPIRED" => Ok(Self::Expired),
            other => Err(format!("unknown signal status: {other}")),
        }
    }
}

/// A sized trade proposal awaiting (or past) human action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotSignal {
    pub id: String,
    pub symbol: String,
    pub signal_type: SignalType,
    pub status: SignalStatus,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub leverage: u32,
    pub confidence: f64,
    pub rationale: String,
    pub risk_reward_ratio: f64,
    /// Learning tag: strategy that produced the signal
    pub strategy: String,
    /// Learning tag: regime at generation time
    pub regime: Regime,
    /// Learning tag: dominant timeframe
    pub timeframe: Timeframe,
    pub generated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processed_by: Option<String>,
    pub rejection_reason: Option<String>,
}
