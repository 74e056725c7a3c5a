//! Decision engine for a leveraged-trading assistant.
//!
//! Fuses multi-timeframe technical analysis, AI commentary and sentiment into
//! sized trade proposals, tracks live positions from the exchange stream,
//! moves proposals through a human-approved lifecycle, and learns factor
//! weights from closed trades.

pub mod api;
pub mod bot;
pub mod config;
pub mod db;
pub mod errors;
pub mod learning;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod positions;
pub mod signals;
pub mod snapshot;
pub mod trading;

pub use bot::Bot;
pub use config::EngineConfig;
pub use errors::EngineError;
