// =============================================================================
// Moving Averages — EMA and volume-weighted MA
// =============================================================================
//
// EMA:  multiplier = 2 / (period + 1),
//       EMA_t = close_t * multiplier + EMA_{t-1} * (1 - multiplier),
//       seeded with the SMA of the first `period` closes.
//
// VWMA: Σ(close·volume) / Σ(volume) over the trailing window.
// =============================================================================

use crate::types::Bar;

/// EMA series for `closes` (oldest first). One output per close starting at
/// index `period - 1`; empty on bad input.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;

    let sma: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    if !sma.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(sma);

    let mut prev = sma;
    for &close in &closes[period..] {
        let ema = close * multiplier + prev * (1.0 - multiplier);
        if !ema.is_finite() {
            break;
        }
        result.push(ema);
        prev = ema;
    }

    result
}

/// Volume-weighted moving average over the trailing `period` bars.
///
/// Returns `None` on insufficient data or zero total volume.
pub fn calculate_vwma(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period {
        return None;
    }

    let window = &bars[bars.len() - period..];
    let total_volume: f64 = window.iter().map(|b| b.volume).sum();
    if total_volume <= 0.0 {
        return None;
    }

    let weighted: f64 = window.iter().map(|b| b.close * b.volume).sum();
    let vwma = weighted / total_volume;
    vwma.is_finite().then_some(vwma)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_seeds_with_sma() {
        let closes = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let ema = calculate_ema(&closes, 3);
        assert!((ema[0] - 2.0).abs() < 1e-12);
        assert_eq!(ema.len(), 3);
    }

    #[test]
    fn ema_tracks_rising_series() {
        let closes: Vec<f64> = (1..=50).map(|x| x as f64).collect();
        let ema = calculate_ema(&closes, 10);
        let last = *ema.last().unwrap();
        // EMA lags a rising series but stays below the last close.
        assert!(last < 50.0 && last > 40.0);
    }

    #[test]
    fn ema_bad_input_is_empty() {
        assert!(calculate_ema(&[], 10).is_empty());
        assert!(calculate_ema(&[1.0, 2.0], 10).is_empty());
        assert!(calculate_ema(&[1.0, 2.0], 0).is_empty());
    }

    #[test]
    fn vwma_weights_by_volume() {
        let bars = vec![
            Bar { ts: 0, open: 0.0, high: 0.0, low: 0.0, close: 100.0, volume: 1.0 },
            Bar { ts: 1, open: 0.0, high: 0.0, low: 0.0, close: 200.0, volume: 3.0 },
        ];
        // (100*1 + 200*3) / 4 = 175.
        let vwma = calculate_vwma(&bars, 2).unwrap();
        assert!((vwma - 175.0).abs() < 1e-12);
    }

    #[test]
    fn vwma_zero_volume_is_none() {
        let bars = vec![
            Bar { ts: 0, open: 0.0, high: 0.0, low: 0.0, close: 100.0, volume: 0.0 };
            3
        ];
        assert!(calculate_vwma(&bars, 3).is_none());
    }
}
