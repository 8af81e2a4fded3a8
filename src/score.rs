// =============================================================================
// Composite Scorer — regime-weighted sum plus capped social additive
// =============================================================================
//
//   composite = clamp(Σ regimeWeight[factor] · factorValue, 0, 100)
//             + min(social, 10)
//
// The weight map comes from the active regime snapshot and is re-validated
// here: an invalid sum or a `social` key is fatal to the run, not a
// per-symbol rejection. Social never participates in the weighted sum.
//
// Ordering is deterministic: composite descending, ties within 1e-9 broken
// lexicographically by symbol.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{validate_weights, FactorWeights};
use crate::factors::{FactorVector, SymbolFactors};
use crate::regime::Regime;
use crate::types::ReasonCode;

/// Hard cap on the social contribution.
pub const SOCIAL_CAP: f64 = 10.0;

/// Composite equality tolerance for the deterministic tie-break.
const TIE_EPSILON: f64 = 1e-9;

/// A scored symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Score {
    pub symbol: String,
    /// In [0, 100 + SOCIAL_CAP].
    pub composite: f64,
    pub factors: FactorVector,
    pub regime: Regime,
    pub timestamp: DateTime<Utc>,
    /// The social contribution actually added (post-clamp).
    pub social_applied: f64,
}

/// Score the whole universe under one weight blend.
///
/// The returned vector is sorted composite-descending with the lexicographic
/// tie-break, ready for artifact emission.
pub fn score_universe(
    factors: &[SymbolFactors],
    weights: &FactorWeights,
    regime: Regime,
    timestamp: DateTime<Utc>,
) -> Result<Vec<Score>, ReasonCode> {
    validate_weights(weights)?;

    let mut scores: Vec<Score> = factors
        .iter()
        .map(|sf| score_one(sf, weights, regime, timestamp))
        .collect::<Result<_, _>>()?;

    scores.sort_by(|a, b| {
        if (a.composite - b.composite).abs() <= TIE_EPSILON {
            a.symbol.cmp(&b.symbol)
        } else {
            b.composite
                .partial_cmp(&a.composite)
                .unwrap_or(std::cmp::Ordering::Equal)
        }
    });

    Ok(scores)
}

fn score_one(
    sf: &SymbolFactors,
    weights: &FactorWeights,
    regime: Regime,
    timestamp: DateTime<Utc>,
) -> Result<Score, ReasonCode> {
    let mut base = 0.0;
    for (name, weight) in weights {
        // validate_weights already rejected `social`; an unknown factor name
        // means the weight table and pipeline disagree, which is fatal.
        let value = sf
            .vector
            .weighted_value(name)
            .ok_or(ReasonCode::WeightSumInvalid)?;
        base += weight * value;
    }
    let base = base.clamp(0.0, 100.0);

    let social_applied = sf.vector.social.min(SOCIAL_CAP);
    let composite = base + social_applied;

    debug!(
        symbol = %sf.symbol,
        base = format!("{base:.2}"),
        social = format!("{social_applied:.2}"),
        composite = format!("{composite:.2}"),
        "symbol scored"
    );

    Ok(Score {
        symbol: sf.symbol.clone(),
        composite,
        factors: sf.vector.clone(),
        regime,
        timestamp,
        social_applied,
    })
}
