// =============================================================================
// Volume Factor — surge, on-balance volume, divergence
// =============================================================================
//
// Three components over 1h bars:
//   - Surge: latest volume vs the trailing 24-bar average.
//   - OBV slope: direction of cumulative signed volume.
//   - Divergence: OBV confirming or contradicting the price direction.
// =============================================================================

use crate::types::Bar;

const W_SURGE: f64 = 0.45;
const W_OBV: f64 = 0.35;
const W_DIVERGENCE: f64 = 0.20;

/// Bars needed for the surge baseline.
const SURGE_WINDOW: usize = 24;

/// Raw volume score in [0, 100] from 1h bars (oldest first).
///
/// Returns `None` with fewer than 25 bars or zero baseline volume.
pub fn volume_raw(bars: &[Bar]) -> Option<f64> {
    if bars.len() < SURGE_WINDOW + 1 {
        return None;
    }

    // --- Surge ---------------------------------------------------------------
    let baseline: f64 = bars[bars.len() - 1 - SURGE_WINDOW..bars.len() - 1]
        .iter()
        .map(|b| b.volume)
        .sum::<f64>()
        / SURGE_WINDOW as f64;
    if baseline <= 0.0 {
        return None;
    }
    let surge_ratio = bars.last()?.volume / baseline;
    // ratio 1.0 → 50; ratio 3.0+ → near 100.
    let surge_component = 50.0 * (1.0 + ((surge_ratio - 1.0) / 2.0).tanh());

    // --- OBV slope -----------------------------------------------------------
    let obv = on_balance_volume(bars);
    let half = obv.len() / 2;
    let early_mean = obv[..half].iter().sum::<f64>() / half.max(1) as f64;
    let late_mean = obv[half..].iter().sum::<f64>() / (obv.len() - half).max(1) as f64;
    let obv_rising = late_mean > early_mean;
    let obv_component = if obv_rising { 75.0 } else { 25.0 };

    // --- Divergence ----------------------------------------------------------
    // OBV direction confirming price direction is constructive; OBV rising
    // into falling price (accumulation) is the strongest signal.
    let price_rising = bars.last()?.close >= bars[bars.len() - 1 - SURGE_WINDOW].close;
    let divergence_component = match (price_rising, obv_rising) {
        (true, true) => 75.0,
        (false, true) => 90.0,
        (true, false) => 25.0,
        (false, false) => 10.0,
    };

    let score =
        W_SURGE * surge_component + W_OBV * obv_component + W_DIVERGENCE * divergence_component;
    score.is_finite().then(|| score.clamp(0.0, 100.0))
}

/// Cumulative signed volume: volume added on up-closes, subtracted on
/// down-closes.
fn on_balance_volume(bars: &[Bar]) -> Vec<f64> {
    let mut obv = Vec::with_capacity(bars.len());
    let mut acc = 0.0;
    obv.push(acc);
    for w in bars.windows(2) {
        if w[1].close > w[0].close {
            acc += w[1].volume;
        } else if w[1].close < w[0].close {
            acc -= w[1].volume;
        }
        obv.push(acc);
    }
    obv
}
