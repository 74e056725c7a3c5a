//! Data models for positions, signals, weights, and trade outcomes.

mod performance;
mod position;
mod regime;
mod signal;
mod timeframe;
mod weights;

pub use performance::{
    KeyStats, LearnedDelta, Outcome, PerformanceKey, PerformanceRecord, PerformanceSnapshot,
    StrategyStats,
};
pub use position::{Position, RawPositionUpdate, Side};
pub use regime::Regime;
pub use signal::{
    BotSignal, Direction, Factor, FusedSignal, SignalStatus, SignalType, TimeframeSignal,
};
pub use timeframe::Timeframe;
pub use weights::WeightProfile;
