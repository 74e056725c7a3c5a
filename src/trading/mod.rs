//! Position sizing, leverage, stops and targets, and the scan pipeline.

mod config;
pub mod exits;
mod leverage;
mod position_sizer;
mod risk_manager;
mod scanner;

pub use config::{LeverageBucket, RiskConfig, ScanConfig};
pub use exits::{EntryLevels, LevelSource, ProfitTake};
pub use leverage::{LeverageDecision, LeverageInputs, LeverageSelector};
pub use position_sizer::{KellySizing, PositionSizer, SizingMethod};
pub use risk_manager::{ExitAction, MarketContext, ProposalRejection, RiskManager, TradeProposal};
pub use scanner::{ScanNote, ScanResult, Scanner};
