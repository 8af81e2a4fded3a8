// =============================================================================
// Quality Factor — derivatives-quality blend
// =============================================================================
//
//   quality = w1·clip(−fundingZ, 0, 3)/3 + w2·|oiResidual| + w3·basisDispersion
//
// fundingZ: the volume-weighted median funding rate across venues, z-scored
// against a 30-day mean/σ. The sign flip rewards negative funding (shorts
// paying) — crowded longs score zero.
//
// oiResidual: the residual of ΔOI regressed on ΔPrice (OLS) over a 1h
// window, i.e. open-interest change the price move does not explain. The
// regression is rejected when R² < 0.1.
//
// basisDispersion: the spread of the spot/perp basis across venues.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::Venue;

const W_FUNDING: f64 = 0.5;
const W_OI: f64 = 0.3;
const W_BASIS: f64 = 0.2;

/// Minimum R² for the ΔOI ~ ΔPrice regression to be trusted.
const MIN_R_SQUARED: f64 = 0.1;

/// One venue's current funding observation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VenueFunding {
    pub venue: Venue,
    /// Funding rate as a decimal per interval.
    pub rate: f64,
    /// 24h volume used as the median weight.
    pub volume: f64,
}

/// Everything the quality factor consumes for one symbol.
#[derive(Debug, Clone, Default)]
pub struct QualityInputs {
    pub funding: Vec<VenueFunding>,
    /// 30-day funding mean and standard deviation.
    pub funding_mean_30d: f64,
    pub funding_sigma_30d: f64,
    /// (ΔPrice, ΔOI) pairs over the trailing 1h window.
    pub oi_deltas: Vec<(f64, f64)>,
    /// Spot/perp basis per venue, as fractions.
    pub basis: Vec<f64>,
}

/// Raw quality score in [0, 100].
pub fn quality_raw(inputs: &QualityInputs) -> f64 {
    let funding_unit = funding_component(inputs) / 3.0;
    let oi_unit = oi_component(&inputs.oi_deltas);
    let basis_unit = basis_component(&inputs.basis);

    let score = 100.0 * (W_FUNDING * funding_unit + W_OI * oi_unit + W_BASIS * basis_unit);
    score.clamp(0.0, 100.0)
}

/// clip(−fundingZ, 0, 3).
fn funding_component(inputs: &QualityInputs) -> f64 {
    let Some(vwm) = volume_weighted_median(&inputs.funding) else {
        return 0.0;
    };
    if inputs.funding_sigma_30d <= 0.0 {
        return 0.0;
    }
    let z = (vwm - inputs.funding_mean_30d) / inputs.funding_sigma_30d;
    (-z).clamp(0.0, 3.0)
}

/// Volume-weighted median of venue funding rates.
pub fn volume_weighted_median(funding: &[VenueFunding]) -> Option<f64> {
    if funding.is_empty() {
        return None;
    }
    let total: f64 = funding.iter().map(|f| f.volume.max(0.0)).sum();
    if total <= 0.0 {
        return None;
    }

    let mut sorted: Vec<&VenueFunding> = funding.iter().collect();
    sorted.sort_by(|a, b| a.rate.partial_cmp(&b.rate).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumulative = 0.0;
    for f in &sorted {
        cumulative += f.volume.max(0.0);
        if cumulative >= total / 2.0 {
            return Some(f.rate);
        }
    }
    sorted.last().map(|f| f.rate)
}

/// |standardised OLS residual| of the newest ΔOI observation, in [0, 1].
fn oi_component(deltas: &[(f64, f64)]) -> f64 {
    match oi_residual(deltas) {
        Some(residual) => residual.abs().tanh(),
        None => 0.0,
    }
}

/// Residual of the last ΔOI observation against the fitted ΔOI ~ ΔPrice
/// line, standardised by the ΔOI dispersion. `None` when the fit is
/// rejected (R² < 0.1) or the window is degenerate.
pub fn oi_residual(deltas: &[(f64, f64)]) -> Option<f64> {
    if deltas.len() < 4 {
        return None;
    }

    let n = deltas.len() as f64;
    let mean_x = deltas.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = deltas.iter().map(|(_, y)| y).sum::<f64>() / n;

    let sxx: f64 = deltas.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    let sst: f64 = deltas.iter().map(|(_, y)| (y - mean_y).powi(2)).sum();
    if sxx <= 0.0 || sst <= 0.0 {
        return None;
    }

    let sxy: f64 = deltas
        .iter()
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();
    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;

    let sse: f64 = deltas
        .iter()
        .map(|(x, y)| (y - (intercept + slope * x)).powi(2))
        .sum();
    let r_squared = 1.0 - sse / sst;

    if r_squared < MIN_R_SQUARED {
        debug!(
            r_squared = format!("{r_squared:.3}"),
            "OI regression rejected — price does not explain OI"
        );
        return None;
    }

    let (last_x, last_y) = *deltas.last()?;
    let residual = last_y - (intercept + slope * last_x);
    let sigma_y = (sst / n).sqrt();
    if sigma_y <= 0.0 {
        return None;
    }
    Some(residual / sigma_y)
}

/// Standard deviation of the cross-venue basis, squashed into [0, 1].
fn basis_component(basis: &[f64]) -> f64 {
    if basis.len() < 2 {
        return 0.0;
    }
    let n = basis.len() as f64;
    let mean = basis.iter().sum::<f64>() / n;
    let variance = basis.iter().map(|b| (b - mean).powi(2)).sum::<f64>() / n;
    (variance.sqrt() * 100.0).tanh()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn funding(rate: f64, volume: f64) -> VenueFunding {
        VenueFunding {
            venue: Venue::Binance,
            rate,
            volume,
        }
    }

    #[test]
    fn vw_median_respects_volume() {
        let rates = vec![funding(0.001, 1.0), funding(0.002, 10.0), funding(0.003, 1.0)];
        assert!((volume_weighted_median(&rates).unwrap() - 0.002).abs() < 1e-12);

        // A dominant-volume venue pulls the median to itself.
        let skewed = vec![funding(0.001, 100.0), funding(0.005, 1.0)];
        assert!((volume_weighted_median(&skewed).unwrap() - 0.001).abs() < 1e-12);
    }

    #[test]
    fn vw_median_empty_is_none() {
        assert!(volume_weighted_median(&[]).is_none());
    }

    #[test]
    fn negative_funding_scores_positive() {
        // Funding deeply below the 30d mean => negative z => positive clip.
        let inputs = QualityInputs {
            funding: vec![funding(-0.0005, 10.0)],
            funding_mean_30d: 0.0001,
            funding_sigma_30d: 0.0002,
            ..Default::default()
        };
        assert!(quality_raw(&inputs) > 0.0);
    }

    #[test]
    fn positive_funding_clips_to_zero() {
        let inputs = QualityInputs {
            funding: vec![funding(0.001, 10.0)],
            funding_mean_30d: 0.0001,
            funding_sigma_30d: 0.0002,
            ..Default::default()
        };
        assert!((quality_raw(&inputs) - 0.0).abs() < 1e-9);
    }

    #[test]
    fn funding_z_clips_at_three() {
        // z = -100: clip(-z) saturates at 3 => funding unit = 1.0.
        let inputs = QualityInputs {
            funding: vec![funding(-0.02, 10.0)],
            funding_mean_30d: 0.0,
            funding_sigma_30d: 0.0002,
            ..Default::default()
        };
        let score = quality_raw(&inputs);
        assert!((score - 100.0 * W_FUNDING).abs() < 1e-9);
    }

    #[test]
    fn oi_regression_fits_linear_data() {
        // ΔOI = 2·ΔPrice exactly, with the last point off-line.
        let mut deltas: Vec<(f64, f64)> = (0..10).map(|i| (i as f64, 2.0 * i as f64)).collect();
        deltas.push((10.0, 35.0)); // 15 above the fitted line
        let resid = oi_residual(&deltas).unwrap();
        assert!(resid > 0.5, "expected a visible residual, got {resid}");
    }

    #[test]
    fn oi_regression_rejected_on_noise() {
        // ΔPrice explains nothing about ΔOI: R² near zero.
        let deltas = vec![
            (1.0, 5.0),
            (2.0, -5.0),
            (3.0, 5.0),
            (4.0, -5.0),
            (5.0, 5.0),
            (6.0, -5.0),
        ];
        assert!(oi_residual(&deltas).is_none());
    }

    #[test]
    fn oi_short_window_is_none() {
        assert!(oi_residual(&[(1.0, 1.0), (2.0, 2.0)]).is_none());
    }

    #[test]
    fn basis_dispersion_grows_score() {
        let tight = QualityInputs {
            basis: vec![0.001, 0.001, 0.001],
            ..Default::default()
        };
        let wide = QualityInputs {
            basis: vec![-0.01, 0.0, 0.02],
            ..Default::default()
        };
        assert!(quality_raw(&wide) > quality_raw(&tight));
    }

    #[test]
    fn score_is_bounded() {
        let inputs = QualityInputs {
            funding: vec![funding(-1.0, 10.0)],
            funding_mean_30d: 0.0,
            funding_sigma_30d: 1e-6,
            oi_deltas: (0..10).map(|i| (i as f64, 100.0 * i as f64)).collect(),
            basis: vec![-1.0, 1.0],
        };
        let score = quality_raw(&inputs);
        assert!((0.0..=100.0).contains(&score));
    }
}
