//! Candle timeframes used for multi-timeframe analysis.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Supported timeframes, ordered shortest to longest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
}

impl Timeframe {
    /// All timeframes in ascending order.
    pub const ALL: [Timeframe; 8] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
        Timeframe::W1,
    ];

    /// Timeframes scanned when the caller does not choose.
    pub const DEFAULT_SCAN: [Timeframe; 4] =
        [Timeframe::M15, Timeframe::H1, Timeframe::H4, Timeframe::D1];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::W1 => "1w",
        }
    }

    #[must_use]
    pub const fn duration_secs(&self) -> u64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::M30 => 1_800,
            Self::H1 => 3_600,
            Self::H4 => 14_400,
            Self::D1 => 86_400,
            Self::W1 => 604_800,
        }
    }

    /// Confluence vote weight; longer candles carry more evidence.
    #[must_use]
    pub const fn default_importance(&self) -> f64 {
        match self {
            Self::M1 => 0.25,
            Self::M5 => 0.5,
            Self::M15 => 1.0,
            Self::M30 => 1.5,
            Self::H1 => 2.0,
            Self::H4 => 3.0,
            Self::D1 => 4.0,
            Self::W1 => 5.0,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1m" => Ok(Self::M1),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "30m" => Ok(Self::M30),
            "1h" | "60m" => Ok(Self::H1),
            "4h" => Ok(Self::H4),
            "1d" | "d" => Ok(Self::D1),
            "1w" | "w" => Ok(Self::W1),
            other => Err(format!("unknown timeframe: {other}")),
        }
    }
}
