// =============================================================================
// GREEN-WALL Verification — in-process invariant suite
// =============================================================================
//
// Runs the contract checks the pipeline is built on, without touching the
// network: weight sums, the social cap, the protected momentum factor, the
// microstructure allow-list, gate boundary semantics, reconciler minimums,
// regime tie-breaking, single-flight, and the PIT store round trip.
//
// `verify all` runs everything; `verify postmerge` runs the fast contract
// subset. Exit code 1 on any red check.
// =============================================================================

use anyhow::Result;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::config::{validate_weights, ScannerConfig};
use crate::facade::cache::{CacheTier, PitCache};
use crate::factors::{orthogonalize, FactorMatrix, FACTOR_ORDER};
use crate::pit::PitStore;
use crate::provider::{capability_check, routed_chain, DataKind};
use crate::reconcile::{reconcile, ConsensusMethod, SourceSample};
use crate::regime::{RegimeDetector, RegimeInputs};
use crate::types::{ReasonCode, Venue};

/// Which checks to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suite {
    All,
    Postmerge,
}

/// One check's outcome.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

fn check(name: &'static str, passed: bool, detail: impl Into<String>) -> CheckResult {
    CheckResult {
        name,
        passed,
        detail: detail.into(),
    }
}

/// Run the suite. Returns true when the wall is green.
pub async fn run(suite: Suite, iterations: u32, progress: bool) -> Result<bool> {
    let mut results = Vec::new();

    results.push(weight_tables());
    results.push(social_cap());
    results.push(protected_momentum(iterations.max(1)));
    results.push(allow_list());

    if suite == Suite::All {
        results.push(gate_boundaries());
        results.push(reconciler_minimums());
        results.push(regime_tie_break());
        results.push(single_flight().await);
        results.push(pit_round_trip());
    }

    let mut green = true;
    for result in &results {
        let mark = if result.passed { "PASS" } else { "FAIL" };
        if progress || !result.passed {
            println!("[{mark}] {:<28} {}", result.name, result.detail);
        }
        info!(check = result.name, passed = result.passed, "verify check");
        green &= result.passed;
    }

    println!(
        "{}: {}/{} checks green",
        if green { "GREEN-WALL" } else { "RED" },
        results.iter().filter(|r| r.passed).count(),
        results.len()
    );
    Ok(green)
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

fn weight_tables() -> CheckResult {
    let config = ScannerConfig::default();
    for (regime, weights) in &config.weight_table {
        if let Err(code) = validate_weights(weights) {
            return check("weight_tables", false, format!("{regime}: {code}"));
        }
    }
    check("weight_tables", true, "all regime blends sum to 1.0 ± 1e-6")
}

fn social_cap() -> CheckResult {
    use crate::factors::{FactorVector, MomentumCore, SymbolFactors};
    use crate::regime::Regime;
    use crate::score::{score_universe, SOCIAL_CAP};

    let sf = SymbolFactors {
        symbol: "BTCUSD".to_string(),
        vector: FactorVector {
            momentum_core: 80.0,
            technical_residual: 0.0,
            volume_residual: 0.0,
            quality_residual: 0.0,
            catalyst: 0.0,
            social: 500.0,
        },
        momentum: MomentumCore {
            score: 80.0,
            blended_return: 0.0,
            accel_renewal: false,
            carry_active: false,
        },
        rsi_4h: None,
    };
    let weights = ScannerConfig::default().weight_table[&Regime::Trending].clone();
    match score_universe(&[sf], &weights, Regime::Trending, Utc::now()) {
        Ok(scores) => {
            let applied = scores[0].social_applied;
            check(
                "social_cap",
                (applied - SOCIAL_CAP).abs() < 1e-9,
                format!("raw 500 applied as {applied}"),
            )
        }
        Err(code) => check("social_cap", false, format!("scorer failed: {code}")),
    }
}

fn protected_momentum(iterations: u32) -> CheckResult {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for i in 0..iterations {
        let n = rng.gen_range(2..20);
        let column = |rng: &mut StdRng| (0..n).map(|_| rng.gen_range(0.0..100.0)).collect();
        let matrix = FactorMatrix {
            momentum_core: column(&mut rng),
            technical: column(&mut rng),
            volume: column(&mut rng),
            quality: column(&mut rng),
        };
        let before = matrix.momentum_core.clone();
        match orthogonalize(&matrix, &FACTOR_ORDER) {
            Ok(residuals) => {
                let identical = residuals
                    .momentum_core
                    .iter()
                    .zip(before.iter())
                    .all(|(a, b)| a.to_bits() == b.to_bits());
                if !identical {
                    return check(
                        "protected_momentum",
                        false,
                        format!("iteration {i}: momentum mutated"),
                    );
                }
            }
            Err(code) => {
                return check("protected_momentum", false, format!("iteration {i}: {code}"))
            }
        }
    }
    check(
        "protected_momentum",
        true,
        format!("bitwise-stable across {iterations} random universes"),
    )
}

fn allow_list() -> CheckResult {
    let chain_native = routed_chain(DataKind::Microstructure)
        .iter()
        .all(|v| v.is_exchange_native());
    let gecko_banned = capability_check(DataKind::Microstructure, Venue::Coingecko)
        == Err(ReasonCode::AggregatorBanned);
    let paprika_banned = capability_check(DataKind::Microstructure, Venue::Coinpaprika)
        == Err(ReasonCode::AggregatorBanned);
    check(
        "microstructure_allow_list",
        chain_native && gecko_banned && paprika_banned,
        "aggregators refused for depth/spread",
    )
}

fn gate_boundaries() -> CheckResult {
    use crate::config::GateConfig;
    use crate::facade::depth::OrderBookSnapshot;
    use crate::gates::microstructure;

    let cfg = GateConfig::default();
    let snapshot = |spread: f64, depth: f64, vadr: f64| OrderBookSnapshot {
        symbol: "BTCUSD".to_string(),
        venue: Venue::Kraken,
        ts: Utc::now(),
        bid_levels: Vec::new(),
        ask_levels: Vec::new(),
        spread_bps: spread,
        depth_usd: depth,
        vadr_multiplier: vadr,
    };

    let spread_strict = !microstructure::evaluate(&snapshot(50.0, 200_000.0, 2.0), &cfg)
        .is_empty()
        && microstructure::evaluate(&snapshot(49.9, 200_000.0, 2.0), &cfg).is_empty();
    let depth_inclusive = microstructure::evaluate(&snapshot(10.0, 100_000.0, 2.0), &cfg)
        .is_empty()
        && !microstructure::evaluate(&snapshot(10.0, 99_999.0, 2.0), &cfg).is_empty();

    check(
        "gate_boundaries",
        spread_strict && depth_inclusive,
        "spread strict-<, depth inclusive->=",
    )
}

fn reconciler_minimums() -> CheckResult {
    let lonely = [
        SourceSample { value: 100.0, source: Venue::Coingecko },
        SourceSample { value: 115.0, source: Venue::Coinpaprika },
        SourceSample { value: 130.0, source: Venue::Binance },
    ];
    let insufficient =
        reconcile(&lonely, ConsensusMethod::Median) == Err(ReasonCode::InsufficientSources);
    check(
        "reconciler_minimums",
        insufficient,
        "single survivor rejected with INSUFFICIENT_SOURCES",
    )
}

fn regime_tie_break() -> CheckResult {
    let detector = RegimeDetector::new(ScannerConfig::default().weight_table);
    let snapshot = detector.force_update(
        RegimeInputs {
            realized_vol_7d: 0.10,
            pct_above_20ma: 75.0, // votes trending
            breadth_thrust: 0.10, // votes choppy
        },
        Utc::now(),
    );
    check(
        "regime_tie_break",
        snapshot.regime == crate::regime::Regime::Choppy
            && (snapshot.confidence - 0.5).abs() < 1e-9,
        "1-1 split resolves to choppy at confidence 0.5",
    )
}

async fn single_flight() -> CheckResult {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    let cache = Arc::new(PitCache::new(ScannerConfig::default().ttls));
    let fetches = Arc::new(AtomicU32::new(0));
    let key = "cryptorun:binance:verify:0";

    let mut handles = Vec::new();
    for _ in 0..6 {
        let cache = cache.clone();
        let fetches = fetches.clone();
        handles.push(tokio::spawn(async move {
            cache
                .get_or_fetch(key, CacheTier::PricesWarm, false, move || async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                    Ok((serde_json::json!(1), Venue::Binance, 1.0))
                })
                .await
        }));
    }
    for handle in handles {
        if handle.await.is_err() {
            return check("single_flight", false, "task panicked");
        }
    }
    let count = fetches.load(Ordering::SeqCst);
    check(
        "single_flight",
        count == 1,
        format!("{count} upstream fetch(es) for 6 concurrent misses"),
    )
}

fn pit_round_trip() -> CheckResult {
    let dir = std::env::temp_dir().join(format!("cryptorun-verify-{}", uuid::Uuid::new_v4()));
    let store = PitStore::new(&dir);
    let ts = Utc::now();
    let event = serde_json::json!({ "price": 100.5, "source": "kraken" });

    let outcome = (|| -> Result<bool> {
        store.append("prices", ts, "kraken", &event)?;
        let events = store.file_store().read_day("prices", ts)?;
        Ok(events.len() == 1 && events[0] == event)
    })();
    let _ = std::fs::remove_dir_all(&dir);

    match outcome {
        Ok(true) => check("pit_round_trip", true, "write-then-read returned the event"),
        Ok(false) => check("pit_round_trip", false, "read did not match write"),
        Err(e) => check("pit_round_trip", false, format!("io error: {e}")),
    }
}
