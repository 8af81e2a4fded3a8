// =============================================================================
// Market Regime — classification and weight-blend selection
// =============================================================================

pub mod detector;

pub use detector::{RegimeDetector, RegimeInputs, RegimeSnapshot};

use serde::{Deserialize, Serialize};

/// High-level market regime. Drives the factor weight blend and the
/// regime-aware gate relaxations.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum Regime {
    /// Persistent directional move. Carry active, gates relaxed.
    Trending,
    /// Sideways chop. Baseline gates.
    Choppy,
    /// Volatility override. Carry disabled, gates tightened.
    HighVol,
}

impl Regime {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trending => "trending",
            Self::Choppy => "choppy",
            Self::HighVol => "highVol",
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
