// =============================================================================
// Telemetry Core — rolling latency histograms per pipeline stage
// =============================================================================
//
// Each stage keeps a bounded ring of raw samples; percentiles are computed
// on demand with linear interpolation. The late-fill guard reads the order
// stage's p99 as an observable signal — telemetry never writes back into the
// pipeline.
// =============================================================================

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

/// Samples retained per stage.
const RING_CAPACITY: usize = 1000;

/// Pipeline stages with independent latency tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Data,
    Score,
    Gate,
    Order,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Data, Stage::Score, Stage::Gate, Stage::Order];

    fn index(self) -> usize {
        match self {
            Self::Data => 0,
            Self::Score => 1,
            Self::Gate => 2,
            Self::Order => 3,
        }
    }
}

/// Percentile summary for one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub stage: Stage,
    pub samples: usize,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Rolling latency histograms for every pipeline stage.
pub struct Telemetry {
    rings: [RwLock<VecDeque<f64>>; 4],
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            rings: std::array::from_fn(|_| RwLock::new(VecDeque::with_capacity(RING_CAPACITY))),
        }
    }

    /// Record one latency observation for a stage.
    pub fn observe(&self, stage: Stage, latency: Duration) {
        self.observe_ms(stage, latency.as_secs_f64() * 1e3);
    }

    pub fn observe_ms(&self, stage: Stage, latency_ms: f64) {
        let mut ring = self.rings[stage.index()].write();
        ring.push_back(latency_ms);
        while ring.len() > RING_CAPACITY {
            ring.pop_front();
        }
    }

    /// Percentile (linear interpolation) for a stage, 0 when no samples.
    pub fn percentile_ms(&self, stage: Stage, q: f64) -> f64 {
        let ring = self.rings[stage.index()].read();
        if ring.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = ring.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
        let lo = rank.floor() as usize;
        let hi = rank.ceil() as usize;
        if lo == hi {
            sorted[lo]
        } else {
            let frac = rank - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }

    /// The p99 the late-fill guard subscribes to.
    pub fn order_p99_ms(&self) -> f64 {
        self.percentile_ms(Stage::Order, 0.99)
    }

    /// Summary across all stages, for the status API.
    pub fn summary(&self) -> Vec<StageSummary> {
        Stage::ALL
            .iter()
            .map(|stage| StageSummary {
                stage: *stage,
                samples: self.rings[stage.index()].read().len(),
                p50_ms: self.percentile_ms(*stage, 0.50),
                p95_ms: self.percentile_ms(*stage, 0.95),
                p99_ms: self.percentile_ms(*stage, 0.99),
            })
            .collect()
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stage_reports_zero() {
        let t = Telemetry::new();
        assert_eq!(t.percentile_ms(Stage::Data, 0.99), 0.0);
    }

    #[test]
    fn percentiles_interpolate() {
        let t = Telemetry::new();
        for v in 1..=100 {
            t.observe_ms(Stage::Order, v as f64);
        }
        assert!((t.percentile_ms(Stage::Order, 0.50) - 50.5).abs() < 1e-9);
        assert!((t.order_p99_ms() - 99.01).abs() < 1e-9);
    }

    #[test]
    fn ring_is_bounded() {
        let t = Telemetry::new();
        for v in 0..(RING_CAPACITY + 500) {
            t.observe_ms(Stage::Gate, v as f64);
        }
        let summary = t.summary();
        let gate = summary.iter().find(|s| s.stage == Stage::Gate).unwrap();
        assert_eq!(gate.samples, RING_CAPACITY);
        // The oldest 500 samples were evicted, so the minimum is 500.
        assert!(t.percentile_ms(Stage::Gate, 0.0) >= 500.0);
    }

    #[test]
    fn stages_are_independent() {
        let t = Telemetry::new();
        t.observe_ms(Stage::Data, 1_000.0);
        assert_eq!(t.percentile_ms(Stage::Score, 0.99), 0.0);
        assert!((t.percentile_ms(Stage::Data, 0.99) - 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn observe_duration_converts_to_ms() {
        let t = Telemetry::new();
        t.observe(Stage::Order, Duration::from_millis(450));
        assert!((t.order_p99_ms() - 450.0).abs() < 1e-9);
    }
}
