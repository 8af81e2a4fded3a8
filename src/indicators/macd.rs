// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
// MACD line = EMA(fast) - EMA(slow); signal = EMA(MACD, signal_period);
// histogram = MACD - signal. The histogram sign and magnitude feed the
// technical factor.

use crate::indicators::ema::calculate_ema;

/// Latest MACD line, signal line, and histogram.
#[derive(Debug, Clone)]
pub struct MacdResult {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Standard parameterisation is (12, 26, 9).
///
/// Returns `None` when the close series is too short to produce both EMAs
/// and a full signal line.
pub fn calculate_macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> Option<MacdResult> {
    if fast == 0 || slow <= fast || signal_period == 0 || closes.len() < slow + signal_period {
        return None;
    }

    let fast_ema = calculate_ema(closes, fast);
    let slow_ema = calculate_ema(closes, slow);
    if slow_ema.is_empty() {
        return None;
    }

    // Align the two series on their tails: the slow EMA starts later.
    let offset = fast_ema.len().checked_sub(slow_ema.len())?;
    let macd_series: Vec<f64> = slow_ema
        .iter()
        .enumerate()
        .map(|(i, s)| fast_ema[i + offset] - s)
        .collect();

    let signal_series = calculate_ema(&macd_series, signal_period);
    let signal = *signal_series.last()?;
    let macd = *macd_series.last()?;

    Some(MacdResult {
        macd,
        signal,
        histogram: macd - signal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_series_is_none() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 12, 26, 9).is_none());
    }

    #[test]
    fn rising_series_has_positive_macd() {
        let closes: Vec<f64> = (1..=80).map(|x| x as f64).collect();
        let m = calculate_macd(&closes, 12, 26, 9).unwrap();
        assert!(m.macd > 0.0);
    }

    #[test]
    fn flat_series_is_zero() {
        let closes = vec![100.0; 80];
        let m = calculate_macd(&closes, 12, 26, 9).unwrap();
        assert!(m.macd.abs() < 1e-9);
        assert!(m.histogram.abs() < 1e-9);
    }

    #[test]
    fn degenerate_params_are_none() {
        let closes: Vec<f64> = (1..=80).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 0, 26, 9).is_none());
        assert!(calculate_macd(&closes, 26, 12, 9).is_none());
        assert!(calculate_macd(&closes, 12, 26, 0).is_none());
    }
}
