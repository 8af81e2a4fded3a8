// =============================================================================
// Regime Detector — 4-hour majority-vote classifier
// =============================================================================
//
// Classifies the market into one of three regimes from three votes, evaluated
// top-to-bottom:
//
//   1. realizedVol7d > 0.25       =>  highVol (override; decision ends here)
//   2. pctAbove20ma  > 60 %       =>  trending, else choppy
//   3. breadthThrust > 0.70       =>  trending, else choppy
//
// Without the override, the majority of votes 2 and 3 wins; a 1–1 split
// resolves to choppy. Confidence is winningVotes / totalVotes over the votes
// that participated in the decision.
//
// Snapshots are unique per 4-hour boundary. A forced update bypasses the
// cadence check but still writes a snapshot for the current boundary, so
// forcing with unchanged inputs reproduces the same snapshot.
// =============================================================================

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::FactorWeights;
use crate::regime::Regime;

/// Seconds per detector cycle (4 h boundary).
const CYCLE_SECS: i64 = 4 * 3600;

/// Realized-vol level above which the highVol override fires.
const VOL_OVERRIDE: f64 = 0.25;
/// Percent-above-20MA level that votes trending.
const BREADTH_MA_PCT: f64 = 60.0;
/// Breadth-thrust level that votes trending.
const THRUST_LEVEL: f64 = 0.70;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Raw market-breadth inputs to one detector evaluation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegimeInputs {
    /// Annualised 7-day realized volatility, >= 0.
    pub realized_vol_7d: f64,
    /// Percentage of universe symbols above their 20-bar MA, [0, 100].
    pub pct_above_20ma: f64,
    /// Breadth thrust, [-1, 1].
    pub breadth_thrust: f64,
}

/// Complete snapshot of one detector decision plus the selected weight blend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    /// The 4 h boundary this snapshot belongs to.
    pub ts: DateTime<Utc>,
    pub realized_vol_7d: f64,
    pub pct_above_20ma: f64,
    pub breadth_thrust: f64,
    pub regime: Regime,
    /// winningVotes / totalVotes for the decision.
    pub confidence: f64,
    /// The active factor weight blend for this regime.
    pub weights: FactorWeights,
    /// True when the regime has not changed over the last two cycles (8 h).
    pub stable: bool,
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Thread-safe regime detector that caches the latest snapshot.
///
/// Designed to be wrapped in an `Arc` and shared across the async runtime.
/// The detector is the sole writer of the active weight blend; scan runs
/// copy the weights out of the current snapshot at start.
pub struct RegimeDetector {
    /// Weight blend per regime, fixed at construction from config.
    weight_table: std::collections::BTreeMap<Regime, FactorWeights>,
    /// Most recent snapshot, if any.
    snapshot: RwLock<Option<RegimeSnapshot>>,
    /// Regimes of recent cycles, newest last. Bounded to 3.
    history: RwLock<Vec<Regime>>,
}

impl RegimeDetector {
    pub fn new(weight_table: std::collections::BTreeMap<Regime, FactorWeights>) -> Self {
        Self {
            weight_table,
            snapshot: RwLock::new(None),
            history: RwLock::new(Vec::new()),
        }
    }

    /// Truncate `now` down to its 4 h boundary.
    pub fn boundary(now: DateTime<Utc>) -> DateTime<Utc> {
        let secs = now.timestamp().div_euclid(CYCLE_SECS) * CYCLE_SECS;
        Utc.timestamp_opt(secs, 0).single().unwrap_or(now)
    }

    /// Run the detector for the boundary containing `now`, unless a snapshot
    /// for that boundary already exists. Returns the fresh snapshot when one
    /// was produced.
    pub fn update(&self, inputs: RegimeInputs, now: DateTime<Utc>) -> Option<RegimeSnapshot> {
        let boundary = Self::boundary(now);
        if let Some(existing) = self.snapshot.read().as_ref() {
            if existing.ts == boundary {
                return None;
            }
        }
        Some(self.evaluate(inputs, boundary, false))
    }

    /// Force an evaluation for the current boundary, replacing any snapshot
    /// already written for it. Unchanged inputs reproduce the same snapshot.
    pub fn force_update(&self, inputs: RegimeInputs, now: DateTime<Utc>) -> RegimeSnapshot {
        self.evaluate(inputs, Self::boundary(now), true)
    }

    /// Most recent snapshot without recomputing.
    pub fn current(&self) -> Option<RegimeSnapshot> {
        self.snapshot.read().clone()
    }

    /// The active weight blend, if a snapshot exists.
    pub fn active_weights(&self) -> Option<FactorWeights> {
        self.snapshot.read().as_ref().map(|s| s.weights.clone())
    }

    fn evaluate(&self, inputs: RegimeInputs, boundary: DateTime<Utc>, forced: bool) -> RegimeSnapshot {
        let (regime, confidence) = classify(&inputs);

        let stable = {
            let mut history = self.history.write();
            // A forced re-evaluation of the current boundary replaces the
            // boundary's history entry rather than appending a cycle.
            let replace = forced
                && self
                    .snapshot
                    .read()
                    .as_ref()
                    .is_some_and(|s| s.ts == boundary);
            if replace {
                history.pop();
            }
            history.push(regime);
            while history.len() > 3 {
                history.remove(0);
            }
            history.len() >= 3 && history.iter().all(|r| *r == regime)
        };

        let weights = self
            .weight_table
            .get(&regime)
            .cloned()
            .unwrap_or_default();

        let snapshot = RegimeSnapshot {
            ts: boundary,
            realized_vol_7d: inputs.realized_vol_7d,
            pct_above_20ma: inputs.pct_above_20ma,
            breadth_thrust: inputs.breadth_thrust,
            regime,
            confidence,
            weights,
            stable,
        };

        info!(
            regime = %regime,
            confidence = format!("{confidence:.2}"),
            vol7d = format!("{:.3}", inputs.realized_vol_7d),
            pct_above_20ma = format!("{:.1}", inputs.pct_above_20ma),
            thrust = format!("{:.2}", inputs.breadth_thrust),
            stable,
            forced,
            "regime snapshot written"
        );

        *self.snapshot.write() = Some(snapshot.clone());
        snapshot
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Apply the three votes and return the regime with its confidence.
fn classify(inputs: &RegimeInputs) -> (Regime, f64) {
    // 1. Volatility override — ends the decision.
    if inputs.realized_vol_7d > VOL_OVERRIDE {
        debug!(vol = inputs.realized_vol_7d, "vol override => highVol");
        return (Regime::HighVol, 1.0);
    }

    // 2 & 3. Breadth votes.
    let ma_vote = if inputs.pct_above_20ma > BREADTH_MA_PCT {
        Regime::Trending
    } else {
        Regime::Choppy
    };
    let thrust_vote = if inputs.breadth_thrust > THRUST_LEVEL {
        Regime::Trending
    } else {
        Regime::Choppy
    };

    if ma_vote == thrust_vote {
        (ma_vote, 1.0)
    } else {
        // 1–1 split resolves to choppy.
        (Regime::Choppy, 0.5)
    }
}
