// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band = SMA, upper/lower = SMA ± k·σ. The normalised band position
// ((close - lower) / (upper - lower)) feeds the technical factor; the band
// width ((upper - lower) / middle · 100) feeds the catalyst compression
// score.

/// Result of a Bollinger Band calculation over the trailing window.
#[derive(Debug, Clone)]
pub struct BollingerResult {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// (upper - lower) / middle * 100.
    pub width: f64,
    /// Position of the latest close within the bands, clamped to [0, 1].
    pub position: f64,
}

/// Calculate Bollinger Bands over the last `period` closes with `num_std`
/// standard deviations.
///
/// Returns `None` on insufficient data, a zero middle band, or non-finite
/// output. A flat series yields width 0 and position 0.5.
pub fn calculate_bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<BollingerResult> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    if middle == 0.0 {
        return None;
    }

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + num_std * std_dev;
    let lower = middle - num_std * std_dev;
    let width = (upper - lower) / middle * 100.0;

    let last = *window.last()?;
    let position = if upper > lower {
        ((last - lower) / (upper - lower)).clamp(0.0, 1.0)
    } else {
        0.5
    };

    (width.is_finite() && position.is_finite()).then_some(BollingerResult {
        upper,
        middle,
        lower,
        width,
        position,
    })
}
