// =============================================================================
// Momentum Core — protected multi-timeframe momentum
// =============================================================================
//
// The core blends 1h/4h/12h/24h returns, a 4h acceleration kicker, and a
// weekly carry that only participates in the trending regime. The blended
// return is mapped onto a bounded 0–100 score with tanh so a single violent
// bar cannot dominate the composite.
//
// This factor is protected: it enters the orthogonalizer as the first basis
// vector and is never residualized.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::regime::Regime;

/// Base timeframe weights for the momentum blend.
const W_1H: f64 = 0.20;
const W_4H: f64 = 0.35;
const W_12H: f64 = 0.30;
const W_24H: f64 = 0.15;

/// Weekly carry weight, active only in trending.
const W_CARRY: f64 = 0.10;

/// Acceleration kicker weight.
const W_ACCEL: f64 = 0.10;

/// Slope of the tanh mapping from blended return to score.
const SCORE_SLOPE: f64 = 8.0;

/// Trailing returns (fractions) per timeframe plus the 4h acceleration
/// (change of the 4h return between consecutive evaluations).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TimeframeReturns {
    pub r_1h: f64,
    pub r_4h: f64,
    pub r_12h: f64,
    pub r_24h: f64,
    pub r_7d: f64,
    pub accel_4h: f64,
}

/// The momentum core with its supporting detail, kept for explain artifacts
/// and the fatigue guard.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MomentumCore {
    /// Bounded score in [0, 100].
    pub score: f64,
    /// The blended fractional return behind the score.
    pub blended_return: f64,
    /// True when 4h momentum is re-accelerating (used by the fatigue guard's
    /// trending relaxation).
    pub accel_renewal: bool,
    /// Whether the weekly carry participated (trending only).
    pub carry_active: bool,
}

/// Compute the protected momentum core for one symbol.
pub fn momentum_core(returns: &TimeframeReturns, regime: Regime) -> MomentumCore {
    let carry_active = regime == Regime::Trending;

    let mut blended = W_1H * returns.r_1h
        + W_4H * returns.r_4h
        + W_12H * returns.r_12h
        + W_24H * returns.r_24h
        + W_ACCEL * returns.accel_4h;
    let mut total_weight = W_1H + W_4H + W_12H + W_24H + W_ACCEL;

    if carry_active {
        blended += W_CARRY * returns.r_7d;
        total_weight += W_CARRY;
    }

    let blended_return = blended / total_weight;
    let score = 50.0 * (1.0 + (SCORE_SLOPE * blended_return).tanh());

    MomentumCore {
        score,
        blended_return,
        accel_renewal: returns.accel_4h > 0.0,
        carry_active,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn flat() -> TimeframeReturns {
        TimeframeReturns::default()
    }

    #[test]
    fn flat_returns_score_fifty() {
        let core = momentum_core(&flat(), Regime::Choppy);
        assert!((core.score - 50.0).abs() < 1e-9);
        assert!(!core.carry_active);
    }

    #[test]
    fn positive_momentum_scores_above_fifty() {
        let r = TimeframeReturns {
            r_1h: 0.01,
            r_4h: 0.03,
            r_12h: 0.05,
            r_24h: 0.08,
            ..flat()
        };
        let core = momentum_core(&r, Regime::Choppy);
        assert!(core.score > 50.0);
        assert!(core.score <= 100.0);
    }

    #[test]
    fn negative_momentum_scores_below_fifty() {
        let r = TimeframeReturns {
            r_1h: -0.02,
            r_4h: -0.04,
            r_12h: -0.06,
            r_24h: -0.08,
            ..flat()
        };
        let core = momentum_core(&r, Regime::Choppy);
        assert!(core.score < 50.0);
        assert!(core.score >= 0.0);
    }

    #[test]
    fn weekly_carry_only_in_trending() {
        let r = TimeframeReturns {
            r_7d: 0.30,
            ..flat()
        };
        let trending = momentum_core(&r, Regime::Trending);
        let choppy = momentum_core(&r, Regime::Choppy);
        let highvol = momentum_core(&r, Regime::HighVol);

        assert!(trending.carry_active);
        assert!(!choppy.carry_active);
        assert!(!highvol.carry_active);

        // The carry moves the trending score; the others stay at 50.
        assert!(trending.score > 50.0);
        assert!((choppy.score - 50.0).abs() < 1e-9);
        assert!((highvol.score - 50.0).abs() < 1e-9);
    }

    #[test]
    fn accel_renewal_flag_follows_acceleration() {
        let accel = TimeframeReturns { accel_4h: 0.01, ..flat() };
        let decel = TimeframeReturns { accel_4h: -0.01, ..flat() };
        assert!(momentum_core(&accel, Regime::Trending).accel_renewal);
        assert!(!momentum_core(&decel, Regime::Trending).accel_renewal);
    }

    #[test]
    fn score_is_bounded_under_extreme_input() {
        let r = TimeframeReturns {
            r_1h: 5.0,
            r_4h: 5.0,
            r_12h: 5.0,
            r_24h: 5.0,
            r_7d: 5.0,
            accel_4h: 5.0,
        };
        let core = momentum_core(&r, Regime::Trending);
        assert!(core.score <= 100.0);
        let neg = TimeframeReturns {
            r_1h: -5.0,
            r_4h: -5.0,
            r_12h: -5.0,
            r_24h: -5.0,
            r_7d: -5.0,
            accel_4h: -5.0,
        };
        let core = momentum_core(&neg, Regime::Trending);
        assert!(core.score >= 0.0);
    }
}
