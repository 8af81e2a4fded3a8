// =============================================================================
// Provider Safety Layer — rate limits, circuit breakers, budgets, routing
// =============================================================================
//
// Every outbound request passes through `SafetyLayer::acquire` before it is
// attempted and reports back through `SafetyLayer::record`. The layer never
// performs I/O itself; it only decides whether I/O may happen and tracks the
// consequences.
// =============================================================================

pub mod budget;
pub mod circuit;
pub mod fallback;
pub mod rate_limit;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::ScannerConfig;
use crate::types::{ReasonCode, Venue};

pub use budget::{BudgetGuard, BudgetTier};
pub use circuit::{CircuitBreaker, CircuitState, TripCause};
pub use fallback::{capability_check, routed_chain, DataKind};
pub use rate_limit::RateLimiter;

/// Leave to proceed with exactly one request against a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    pub venue: Venue,
    /// Compute-unit cost the caller committed to.
    pub cost: u64,
}

/// The observed outcome of a permitted request.
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Success,
    /// 5xx or transport failure — counts against the circuit.
    Failure,
    /// 429/418 — counts against the circuit and holds the bucket.
    Throttled { retry_after: Option<Duration> },
}

/// Immutable read-view of one provider's safety state, exposed per scan and
/// in the status API.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderState {
    pub name: Venue,
    pub budget_remaining: u64,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub rolling_error_rate: f64,
    pub rolling_p99_ms: f64,
    /// Seconds until the circuit may transition to halfOpen, if open.
    pub cooldown_secs_remaining: Option<u64>,
    pub budget_tier: BudgetTier,
    pub last_trip: Option<TripCause>,
}

struct ProviderHandle {
    rate: RateLimiter,
    circuit: CircuitBreaker,
    budget: BudgetGuard,
}

/// The safety layer for all providers.
pub struct SafetyLayer {
    providers: BTreeMap<Venue, ProviderHandle>,
}

impl SafetyLayer {
    /// Build handles for every venue the router can reach.
    pub fn new(config: &ScannerConfig) -> Arc<Self> {
        let now_i = Instant::now();
        let now_c = Utc::now();
        let venues = [
            Venue::Binance,
            Venue::Kraken,
            Venue::Coinbase,
            Venue::Okx,
            Venue::Coingecko,
            Venue::Coinpaprika,
        ];

        let providers = venues
            .into_iter()
            .map(|venue| {
                let limits = config.provider_limits(venue.as_str());
                let handle = ProviderHandle {
                    rate: RateLimiter::new(&limits, now_i),
                    circuit: CircuitBreaker::new(&limits),
                    budget: BudgetGuard::new(&limits, now_c),
                };
                (venue, handle)
            })
            .collect();

        Arc::new(Self { providers })
    }

    /// Ask for leave to send one request of `cost` compute units.
    ///
    /// `critical` requests bypass the 95% budget suppression tier (but never
    /// the 100% denial).
    pub fn acquire(&self, venue: Venue, cost: u64, critical: bool) -> Result<Permit, ReasonCode> {
        self.acquire_at(venue, cost, critical, Instant::now(), Utc::now())
    }

    fn acquire_at(
        &self,
        venue: Venue,
        cost: u64,
        critical: bool,
        now_i: Instant,
        now_c: DateTime<Utc>,
    ) -> Result<Permit, ReasonCode> {
        let handle = self.handle(venue);

        match handle.budget.tier(now_c) {
            BudgetTier::Exhausted => {
                handle.circuit.open_for_budget(now_i);
                return Err(ReasonCode::BudgetExhausted);
            }
            BudgetTier::Suppressed if !critical => return Err(ReasonCode::ProviderDegraded),
            _ => {}
        }

        if !handle.circuit.allow(now_i) {
            return Err(ReasonCode::CircuitOpen);
        }

        if !handle.rate.try_acquire(cost as f64, now_i) {
            return Err(ReasonCode::RateLimited);
        }

        debug!(venue = %venue, cost, "permit granted");
        Ok(Permit { venue, cost })
    }

    /// Report the outcome of a permitted request.
    pub fn record(&self, permit: Permit, outcome: Outcome, latency: Duration) {
        self.record_at(permit, outcome, latency, Instant::now(), Utc::now());
    }

    fn record_at(
        &self,
        permit: Permit,
        outcome: Outcome,
        latency: Duration,
        now_i: Instant,
        now_c: DateTime<Utc>,
    ) {
        let handle = self.handle(permit.venue);
        let latency_ms = latency.as_secs_f64() * 1e3;

        handle.budget.record(permit.cost, now_c);

        match outcome {
            Outcome::Success => {
                handle.rate.record_success();
                handle.circuit.record(true, latency_ms, now_i);
            }
            Outcome::Failure => {
                handle.circuit.record(false, latency_ms, now_i);
            }
            Outcome::Throttled { retry_after } => {
                handle.rate.record_throttle(retry_after, now_i);
                handle.circuit.record(false, latency_ms, now_i);
            }
        }
    }

    /// Mirror server-side weight headers into the limiter.
    pub fn update_server_weight(&self, venue: Venue, used: u64, limit: u64) {
        self.handle(venue).rate.update_server_weight(used, limit);
    }

    /// True when the provider is DEGRADED (budget at >= 80%): the facade
    /// doubles cache TTLs in response.
    pub fn is_degraded(&self, venue: Venue) -> bool {
        self.handle(venue).budget.tier(Utc::now()) >= BudgetTier::Degraded
    }

    /// True when the provider's circuit is open and requests should route to
    /// fallbacks.
    pub fn is_open(&self, venue: Venue) -> bool {
        self.handle(venue).circuit.state() == CircuitState::Open
    }

    /// Immutable read-view of every provider for this instant.
    pub fn snapshot(&self) -> Vec<ProviderState> {
        let now_i = Instant::now();
        let now_c = Utc::now();
        self.providers
            .iter()
            .map(|(venue, handle)| ProviderState {
                name: *venue,
                budget_remaining: handle.budget.remaining(now_c),
                circuit_state: handle.circuit.state(),
                consecutive_failures: handle.circuit.consecutive_failures(),
                rolling_error_rate: handle.circuit.error_rate(),
                rolling_p99_ms: handle.circuit.p99_ms(),
                cooldown_secs_remaining: handle
                    .circuit
                    .cooldown_until()
                    .map(|until| until.saturating_duration_since(now_i).as_secs()),
                budget_tier: handle.budget.tier(now_c),
                last_trip: handle.circuit.last_trip(),
            })
            .collect()
    }

    fn handle(&self, venue: Venue) -> &ProviderHandle {
        self.providers
            .get(&venue)
            .expect("all venues registered at construction")
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn layer() -> Arc<SafetyLayer> {
        SafetyLayer::new(&ScannerConfig::default())
    }

    #[test]
    fn permit_granted_in_steady_state() {
        let layer = layer();
        let permit = layer.acquire(Venue::Binance, 1, false).unwrap();
        assert_eq!(permit.venue, Venue::Binance);
    }

    #[test]
    fn circuit_open_denies_and_routes_nowhere() {
        let layer = layer();
        for _ in 0..5 {
            let permit = layer.acquire(Venue::Binance, 1, false).unwrap();
            layer.record(permit, Outcome::Failure, Duration::from_millis(50));
        }
        assert!(layer.is_open(Venue::Binance));
        assert_eq!(
            layer.acquire(Venue::Binance, 1, false),
            Err(ReasonCode::CircuitOpen)
        );
        // Other providers unaffected.
        assert!(layer.acquire(Venue::Kraken, 1, false).is_ok());
    }

    #[test]
    fn budget_exhaustion_denies_with_budget_reason() {
        let mut config = ScannerConfig::default();
        config.providers.insert(
            "coingecko".to_string(),
            crate::config::ProviderLimits {
                hourly_budget: 2,
                daily_budget: 0,
                ..Default::default()
            },
        );
        let layer = SafetyLayer::new(&config);

        for _ in 0..2 {
            let permit = layer.acquire(Venue::Coingecko, 1, false).unwrap();
            layer.record(permit, Outcome::Success, Duration::from_millis(10));
        }
        assert_eq!(
            layer.acquire(Venue::Coingecko, 1, false),
            Err(ReasonCode::BudgetExhausted)
        );
        // Quota exhaustion also opens the circuit with a budget cause.
        assert!(layer.is_open(Venue::Coingecko));
    }

    #[test]
    fn suppressed_tier_allows_critical_only() {
        let mut config = ScannerConfig::default();
        config.providers.insert(
            "coinpaprika".to_string(),
            crate::config::ProviderLimits {
                hourly_budget: 100,
                daily_budget: 0,
                burst: 200,
                ..Default::default()
            },
        );
        let layer = SafetyLayer::new(&config);

        let permit = layer.acquire(Venue::Coinpaprika, 96, false).unwrap();
        layer.record(permit, Outcome::Success, Duration::from_millis(10));

        assert_eq!(
            layer.acquire(Venue::Coinpaprika, 1, false),
            Err(ReasonCode::ProviderDegraded)
        );
        assert!(layer.acquire(Venue::Coinpaprika, 1, true).is_ok());
    }

    #[test]
    fn degraded_flag_at_eighty_percent() {
        let mut config = ScannerConfig::default();
        config.providers.insert(
            "kraken".to_string(),
            crate::config::ProviderLimits {
                hourly_budget: 10,
                daily_budget: 0,
                ..Default::default()
            },
        );
        let layer = SafetyLayer::new(&config);
        assert!(!layer.is_degraded(Venue::Kraken));

        let permit = layer.acquire(Venue::Kraken, 8, false).unwrap();
        layer.record(permit, Outcome::Success, Duration::from_millis(10));
        assert!(layer.is_degraded(Venue::Kraken));
    }

    #[test]
    fn snapshot_covers_all_venues() {
        let layer = layer();
        let snap = layer.snapshot();
        assert_eq!(snap.len(), 6);
        assert!(snap.iter().all(|s| s.circuit_state == CircuitState::Closed));
    }
}
