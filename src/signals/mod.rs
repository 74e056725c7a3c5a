//! Signal pipeline: regime labeling, technical scoring, adaptive weighting,
//! and multi-timeframe confluence.

pub mod confluence;
pub mod fusion;
pub mod regime;
pub mod scoring;
pub mod weights;

pub use confluence::{aggregate, Confluence, ConfluenceConfig};
pub use fusion::{fuse, technical_consensus, FactorInputs, Fusion};
pub use regime::{RegimeClassifier, RegimeConfig, RegimeFeatures};
pub use scoring::{score_timeframe, technical_score, ScoringConfig};
pub use weights::{Band, WeightConfig, WeightEngine};
