//! Closed-trade performance statistics.

mod calculator;

pub use calculator::{MetricsCalculator, TradeStats};
