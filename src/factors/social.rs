// =============================================================================
// Social Factor — bounded sentiment score
// =============================================================================
//
// Social is deliberately NOT orthogonalized: it enters the composite as a
// capped additive term after the weighted sum. This module only bounds the
// raw signal; the hard ≤ +10 clamp lives in the scorer.

use serde::{Deserialize, Serialize};

/// Ceiling on the raw social score before the scorer's own clamp.
const RAW_CEILING: f64 = 25.0;

/// Raw social observations for one symbol.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SocialInputs {
    /// Mention-count growth vs the trailing baseline, as a ratio (1.0 = no
    /// change).
    pub mention_growth: f64,
    /// Aggregate sentiment polarity in [-1, 1].
    pub sentiment: f64,
}

/// Bounded social score, >= 0. Negative sentiment contributes nothing —
/// social only ever adds.
pub fn social_score(inputs: &SocialInputs) -> f64 {
    let growth = (inputs.mention_growth - 1.0).max(0.0);
    let polarity = inputs.sentiment.clamp(0.0, 1.0);
    let raw = RAW_CEILING * (growth * polarity).tanh();
    raw.clamp(0.0, RAW_CEILING)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_symbol_scores_zero() {
        let score = social_score(&SocialInputs {
            mention_growth: 1.0,
            sentiment: 0.5,
        });
        assert!(score.abs() < 1e-9);
    }

    #[test]
    fn negative_sentiment_contributes_nothing() {
        let score = social_score(&SocialInputs {
            mention_growth: 5.0,
            sentiment: -0.9,
        });
        assert!(score.abs() < 1e-9);
    }

    #[test]
    fn viral_symbol_is_bounded() {
        let score = social_score(&SocialInputs {
            mention_growth: 1_000.0,
            sentiment: 1.0,
        });
        assert!(score <= RAW_CEILING);
        assert!(score > 20.0);
    }

    #[test]
    fn score_grows_with_buzz() {
        let mild = social_score(&SocialInputs {
            mention_growth: 1.5,
            sentiment: 0.8,
        });
        let hot = social_score(&SocialInputs {
            mention_growth: 3.0,
            sentiment: 0.8,
        });
        assert!(hot > mild);
    }
}
