// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing
// =============================================================================
//
// Seed average gain/loss with the SMA of the first `period` deltas, then:
//   avg_gain = (prev_avg_gain * (period - 1) + gain) / period
//   avg_loss = (prev_avg_loss * (period - 1) + loss) / period
//   RSI      = 100 - 100 / (1 + avg_gain / avg_loss)
// =============================================================================

/// Most recent RSI over `closes` (oldest first).
///
/// Returns `None` when `period` is zero, fewer than `period + 1` closes are
/// available, or the result is non-finite. A flat series yields 50, an
/// all-gains series 100, an all-losses series 0.
pub fn latest_rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let period_f = period as f64;
    let (mut avg_gain, mut avg_loss) =
        deltas[..period].iter().fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l - d)
            }
        });
    avg_gain /= period_f;
    avg_loss /= period_f;

    for &delta in &deltas[period..] {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    let rsi = if avg_gain == 0.0 && avg_loss == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    rsi.is_finite().then_some(rsi)
}
