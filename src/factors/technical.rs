// =============================================================================
// Technical Factor — RSI / MACD / Bollinger position / VWMA blend
// =============================================================================
//
// Produces a raw 0–100 technical score from 4h bars. The orthogonalizer
// later removes the component along momentum_core, so overlap with momentum
// here is acceptable — orthogonality is not this module's job.
// =============================================================================

use crate::indicators::{calculate_bollinger, calculate_macd, calculate_vwma, latest_rsi};
use crate::types::Bar;

/// Component weights inside the technical blend.
const W_RSI: f64 = 0.30;
const W_MACD: f64 = 0.25;
const W_BOLLINGER: f64 = 0.25;
const W_VWMA: f64 = 0.20;

/// Raw technical score in [0, 100] from 4h bars (oldest first).
///
/// Returns `None` when the series is too short for the slowest component
/// (MACD needs 35 bars).
pub fn technical_raw(bars: &[Bar]) -> Option<f64> {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let last_close = *closes.last()?;

    // RSI already lives on a 0–100 scale.
    let rsi_component = latest_rsi(&closes, 14)?;

    // MACD histogram relative to price, squashed into 0–100.
    let macd = calculate_macd(&closes, 12, 26, 9)?;
    let macd_component = 50.0 * (1.0 + (40.0 * macd.histogram / last_close).tanh());

    // Position inside the bands maps directly onto 0–100.
    let bb = calculate_bollinger(&closes, 20, 2.0)?;
    let bb_component = bb.position * 100.0;

    // Close above/below the 20-bar VWMA, squashed.
    let vwma = calculate_vwma(bars, 20)?;
    let vwma_component = 50.0 * (1.0 + (20.0 * (last_close - vwma) / vwma).tanh());

    let score = W_RSI * rsi_component
        + W_MACD * macd_component
        + W_BOLLINGER * bb_component
        + W_VWMA * vwma_component;

    score.is_finite().then(|| score.clamp(0.0, 100.0))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                ts: i as i64 * 14_400_000,
                open: c,
                high: c * 1.01,
                low: c * 0.99,
                close: c,
                volume: 100.0,
            })
            .collect()
    }

    #[test]
    fn too_short_is_none() {
        let bars = bars_from_closes(&[100.0; 10]);
        assert!(technical_raw(&bars).is_none());
    }

    #[test]
    fn rising_series_scores_high() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 * 1.01f64.powi(i)).collect();
        let score = technical_raw(&bars_from_closes(&closes)).unwrap();
        assert!(score > 60.0, "rising series scored {score}");
    }

    #[test]
    fn falling_series_scores_low() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 * 0.99f64.powi(i)).collect();
        let score = technical_raw(&bars_from_closes(&closes)).unwrap();
        assert!(score < 40.0, "falling series scored {score}");
    }

    #[test]
    fn flat_series_is_neutral() {
        let score = technical_raw(&bars_from_closes(&[100.0; 60])).unwrap();
        assert!((score - 50.0).abs() < 5.0, "flat series scored {score}");
    }

    #[test]
    fn score_is_bounded() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 * 1.10f64.powi(i)).collect();
        let score = technical_raw(&bars_from_closes(&closes)).unwrap();
        assert!((0.0..=100.0).contains(&score));
    }
}
