// =============================================================================
// Circuit Breaker — per-provider closed / open / halfOpen state machine
// =============================================================================
//
// Trip conditions (any one opens the circuit):
//   - rolling error rate >= threshold over the outcome window
//   - consecutive failures >= K
//   - rolling p99 latency >= L
//   - budget exhaustion (reported by the budget guard via `open_for_budget`)
//
// Recovery: the circuit stays open for `cooldown`, then admits a small probe
// cohort in halfOpen. `success_threshold` consecutive probe successes close
// it; any probe failure re-opens with the cooldown doubled, up to a cap.
// =============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ProviderLimits;

/// Number of probes admitted while halfOpen.
const PROBE_COHORT: u32 = 3;

/// Circuit state, in the order the machine traverses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "halfOpen"),
        }
    }
}

/// Why the circuit last opened; surfaced in provider snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripCause {
    ErrorRate,
    ConsecutiveFailures,
    LatencyP99,
    Budget,
}

struct Inner {
    state: CircuitState,
    /// Rolling request outcomes, `true` = success, newest last.
    outcomes: VecDeque<bool>,
    /// Rolling latencies in ms, same window as `outcomes`.
    latencies: VecDeque<f64>,
    consecutive_failures: u32,
    /// When the circuit entered `Open`.
    opened_at: Option<Instant>,
    /// Current cooldown; doubles on each re-open from halfOpen.
    cooldown: Duration,
    /// Probe bookkeeping while halfOpen.
    probe_successes: u32,
    probes_inflight: u32,
    last_trip: Option<TripCause>,
}

/// Circuit breaker for a single provider.
pub struct CircuitBreaker {
    window: usize,
    error_rate_threshold: f64,
    max_consecutive_failures: u32,
    p99_limit_ms: f64,
    base_cooldown: Duration,
    cooldown_cap: Duration,
    success_threshold: u32,
    inner: RwLock<Inner>,
}

impl CircuitBreaker {
    pub fn new(limits: &ProviderLimits) -> Self {
        let base_cooldown = Duration::from_secs(limits.cooldown_secs.max(1));
        Self {
            window: limits.error_window.max(4),
            error_rate_threshold: limits.error_rate_threshold,
            max_consecutive_failures: limits.max_consecutive_failures.max(1),
            p99_limit_ms: limits.p99_limit_ms,
            base_cooldown,
            cooldown_cap: Duration::from_secs(limits.cooldown_cap_secs.max(limits.cooldown_secs)),
            success_threshold: limits.success_threshold.max(1),
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                outcomes: VecDeque::new(),
                latencies: VecDeque::new(),
                consecutive_failures: 0,
                opened_at: None,
                cooldown: base_cooldown,
                probe_successes: 0,
                probes_inflight: 0,
                last_trip: None,
            }),
        }
    }

    /// Whether a request may pass right now. Handles the open → halfOpen
    /// transition when the cooldown has elapsed, and limits halfOpen
    /// admission to the probe cohort.
    pub fn allow(&self, now: Instant) -> bool {
        let mut inner = self.inner.write();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| now.duration_since(at))
                    .unwrap_or(Duration::ZERO);
                if elapsed >= inner.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_successes = 0;
                    inner.probes_inflight = 1;
                    info!("circuit cooldown elapsed — halfOpen, admitting probes");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probes_inflight < PROBE_COHORT {
                    inner.probes_inflight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a request outcome.
    pub fn record(&self, success: bool, latency_ms: f64, now: Instant) {
        let mut inner = self.inner.write();

        inner.outcomes.push_back(success);
        inner.latencies.push_back(latency_ms);
        while inner.outcomes.len() > self.window {
            inner.outcomes.pop_front();
        }
        while inner.latencies.len() > self.window {
            inner.latencies.pop_front();
        }

        if success {
            inner.consecutive_failures = 0;
        } else {
            inner.consecutive_failures += 1;
        }

        match inner.state {
            CircuitState::Closed => {
                if let Some(cause) = self.trip_cause(&inner) {
                    self.open(&mut inner, cause, now);
                }
            }
            CircuitState::HalfOpen => {
                inner.probes_inflight = inner.probes_inflight.saturating_sub(1);
                if success {
                    inner.probe_successes += 1;
                    if inner.probe_successes >= self.success_threshold {
                        info!("probe cohort succeeded — circuit closed");
                        inner.state = CircuitState::Closed;
                        inner.opened_at = None;
                        inner.cooldown = self.base_cooldown;
                        inner.consecutive_failures = 0;
                        inner.last_trip = None;
                        // Fresh window: pre-trip failures must not re-trip
                        // the recovered circuit.
                        inner.outcomes.clear();
                        inner.latencies.clear();
                    }
                } else {
                    // Any probe failure re-opens with doubled cooldown.
                    let doubled = (inner.cooldown * 2).min(self.cooldown_cap);
                    inner.cooldown = doubled;
                    let cause = inner.last_trip.unwrap_or(TripCause::ErrorRate);
                    self.open(&mut inner, cause, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Open the circuit for budget exhaustion, bypassing the rolling checks.
    pub fn open_for_budget(&self, now: Instant) {
        let mut inner = self.inner.write();
        if inner.state != CircuitState::Open {
            self.open(&mut inner, TripCause::Budget, now);
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.read().consecutive_failures
    }

    /// Rolling error rate over the outcome window.
    pub fn error_rate(&self) -> f64 {
        let inner = self.inner.read();
        if inner.outcomes.is_empty() {
            return 0.0;
        }
        let failures = inner.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / inner.outcomes.len() as f64
    }

    /// Rolling p99 latency in ms over the window (linear interpolation).
    pub fn p99_ms(&self) -> f64 {
        let inner = self.inner.read();
        percentile(&inner.latencies, 0.99)
    }

    /// Instant until which the circuit stays open, if open.
    pub fn cooldown_until(&self) -> Option<Instant> {
        let inner = self.inner.read();
        match inner.state {
            CircuitState::Open => inner.opened_at.map(|at| at + inner.cooldown),
            _ => None,
        }
    }

    pub fn last_trip(&self) -> Option<TripCause> {
        self.inner.read().last_trip
    }

    fn trip_cause(&self, inner: &Inner) -> Option<TripCause> {
        if inner.consecutive_failures >= self.max_consecutive_failures {
            return Some(TripCause::ConsecutiveFailures);
        }
        if inner.outcomes.len() >= self.window {
            let failures = inner.outcomes.iter().filter(|ok| !**ok).count();
            if failures as f64 / inner.outcomes.len() as f64 >= self.error_rate_threshold {
                return Some(TripCause::ErrorRate);
            }
        }
        if inner.latencies.len() >= self.window
            && percentile(&inner.latencies, 0.99) >= self.p99_limit_ms
        {
            return Some(TripCause::LatencyP99);
        }
        None
    }

    fn open(&self, inner: &mut Inner, cause: TripCause, now: Instant) {
        warn!(?cause, cooldown_ms = inner.cooldown.as_millis() as u64, "circuit opened");
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.probe_successes = 0;
        inner.probes_inflight = 0;
        inner.last_trip = Some(cause);
    }
}

/// Percentile with linear interpolation over an unordered sample window.
fn percentile(samples: &VecDeque<f64>, q: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = samples.iter().copied().collect();
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
