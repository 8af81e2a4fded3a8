// =============================================================================
// Reconciler — outlier filtering and consensus across price/volume sources
// =============================================================================
//
// Given N samples of the same quantity from different sources:
//
//   1. Compute the initial median.
//   2. Drop samples deviating from the median by more than 1%.
//   3. Require at least 2 survivors, else the query fails with
//      INSUFFICIENT_SOURCES.
//   4. Consensus = median of survivors (or trimmed mean when configured).
//
// Confidence reflects how many sources survived and how tightly they agree.
// Attribution records which sources were used and which were dropped, so
// every artifact can name its inputs. Aggregator sources are legitimate
// here — the exchange-native restriction applies to depth/spread only.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{ReasonCode, Venue};

/// Maximum relative deviation from the median before a sample is dropped.
const OUTLIER_THRESHOLD: f64 = 0.01;

/// Minimum surviving sources for a valid consensus.
const MIN_SURVIVORS: usize = 2;

/// Consensus statistic applied to the survivors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMethod {
    Median,
    /// Mean after removing the single lowest and highest survivor (falls
    /// back to the median below 3 survivors).
    TrimmedMean,
}

/// One input sample with its origin.
#[derive(Debug, Clone, Copy)]
pub struct SourceSample {
    pub value: f64,
    pub source: Venue,
}

/// The reconciled value with full attribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Consensus {
    pub value: f64,
    /// Confidence in [0, 1] from survivor count and dispersion.
    pub confidence: f64,
    pub sources_used: Vec<Venue>,
    pub sources_dropped: Vec<Venue>,
    /// Largest relative deviation among survivors.
    pub max_deviation: f64,
}

/// Reconcile `samples` into a single value.
pub fn reconcile(samples: &[SourceSample], method: ConsensusMethod) -> Result<Consensus, ReasonCode> {
    if samples.len() < MIN_SURVIVORS {
        return Err(ReasonCode::InsufficientSources);
    }

    let initial_median = median(&mut samples.iter().map(|s| s.value).collect::<Vec<_>>());
    if initial_median <= 0.0 {
        warn!(median = initial_median, "non-positive consensus median");
        return Err(ReasonCode::InsufficientSources);
    }

    let mut survivors: Vec<SourceSample> = Vec::with_capacity(samples.len());
    let mut dropped: Vec<Venue> = Vec::new();

    for sample in samples {
        let deviation = (sample.value - initial_median).abs() / initial_median;
        if deviation > OUTLIER_THRESHOLD {
            debug!(
                code = %ReasonCode::OutlierRejected,
                source = %sample.source,
                value = sample.value,
                deviation = format!("{deviation:.4}"),
                "sample dropped as outlier"
            );
            dropped.push(sample.source);
        } else {
            survivors.push(*sample);
        }
    }

    if survivors.len() < MIN_SURVIVORS {
        warn!(
            survivors = survivors.len(),
            dropped = dropped.len(),
            "consensus failed — too few survivors after outlier filtering"
        );
        return Err(ReasonCode::InsufficientSources);
    }

    let mut values: Vec<f64> = survivors.iter().map(|s| s.value).collect();
    let value = match method {
        ConsensusMethod::Median => median(&mut values),
        ConsensusMethod::TrimmedMean => trimmed_mean(&mut values),
    };

    let max_deviation = survivors
        .iter()
        .map(|s| (s.value - value).abs() / value)
        .fold(0.0_f64, f64::max);

    let confidence = confidence(survivors.len(), samples.len(), max_deviation);

    Ok(Consensus {
        value,
        confidence,
        sources_used: survivors.iter().map(|s| s.source).collect(),
        sources_dropped: dropped,
        max_deviation,
    })
}

/// Confidence grows with survivor share and shrinks with dispersion.
fn confidence(survivors: usize, total: usize, max_deviation: f64) -> f64 {
    let survival = survivors as f64 / total as f64;
    let tightness = 1.0 - (max_deviation / OUTLIER_THRESHOLD).clamp(0.0, 1.0) * 0.5;
    (survival * tightness).clamp(0.0, 1.0)
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

fn trimmed_mean(values: &mut [f64]) -> f64 {
    if values.len() < 3 {
        return median(values);
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let inner = &values[1..values.len() - 1];
    inner.iter().sum::<f64>() / inner.len() as f64
}
