use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Classified market condition for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    Bull,
    Bear,
    Sideways,
    Volatile,
    LowVolume,
    Transition,
}

impl Regime {
    pub const ALL: [Regime; 6] = [
        Regime::Bull,
        Regime::Bear,
        Regime::Sideways,
        Regime::Volatile,
        Regime::LowVolume,
        Regime::Transition,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bull => "BULL",
            Self::Bear => "BEAR",
            Self::Sideways => "SIDEWAYS",
            Self::Volatile => "VOLATILE",
            Self::LowVolume => "LOW_VOLUME",
            Self::Transition => "TRANSITION",
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Regime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().replace('-', "_").as_str() {
            "BULL" => Ok(Self::Bull),
            "BEAR" => Ok(Self::Bear),
            "SIDEWAYS" => Ok(Self::Sideways),
            "VOLATILE" => Ok(Self::Volatile),
            "LOW_VOLUME" => Ok(Self::LowVolume),
            "TRANSITION" => Ok(Self::Transition),
            other => Err(format!("unknown regime: {other}")),
        }
    }
}
