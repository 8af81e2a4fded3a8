// =============================================================================
// Gate Engine — admission control for scored symbols
// =============================================================================
//
// Evaluation order: emergency controls, then microstructure, then the
// operational guards. Admission short-circuits on the first family that
// fails, but every family is still evaluated so the outcome carries the
// complete reason list for the explain artifact.
// =============================================================================

pub mod guards;
pub mod microstructure;

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GateConfig;
use crate::emergency::EmergencyControls;
use crate::facade::depth::OrderBookSnapshot;
use crate::types::{ReasonCode, Symbol};

pub use guards::{GuardContext, LateFillGuard, LateFillOutcome};

/// The full admission decision for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateOutcome {
    pub symbol: String,
    pub passed: bool,
    pub reasons: Vec<ReasonCode>,
    pub relaxations_applied: Vec<ReasonCode>,
}

/// Everything the engine needs to judge one symbol.
pub struct GateInput<'a> {
    pub symbol: &'a Symbol,
    /// Exchange-native book snapshot; `None` means microstructure data was
    /// unavailable.
    pub book: Option<&'a OrderBookSnapshot>,
    pub guard_ctx: GuardContext,
    /// Execution delay from signal bar close, seconds.
    pub execution_delay_secs: u64,
    /// Data-plane health for the trending late-fill relaxation.
    pub infra_healthy: bool,
    /// Distance from trigger in ATR multiples.
    pub atr_proximity: f64,
    /// Order-stage rolling p99 from telemetry.
    pub order_p99_ms: f64,
}

/// Stateless gate families plus the stateful late-fill guard.
pub struct GateEngine {
    cfg: GateConfig,
    late_fill: LateFillGuard,
    emergency: Arc<EmergencyControls>,
}

impl GateEngine {
    pub fn new(cfg: GateConfig, emergency: Arc<EmergencyControls>) -> Self {
        Self {
            late_fill: LateFillGuard::new(cfg.clone()),
            cfg,
            emergency,
        }
    }

    /// Evaluate all gate families for one symbol.
    pub fn evaluate(&self, input: &GateInput<'_>, now: Instant) -> GateOutcome {
        let mut reasons = Vec::new();
        let mut relaxations = Vec::new();

        // ── Emergency controls ──────────────────────────────────────────
        if let Some(code) = self.emergency.check(input.symbol) {
            // Emergency rejections are terminal: data-dependent gates are
            // not meaningful for a symbol that may not trade at all.
            return GateOutcome {
                symbol: input.symbol.pair(),
                passed: false,
                reasons: vec![code],
                relaxations_applied: relaxations,
            };
        }

        // ── Microstructure ──────────────────────────────────────────────
        match input.book {
            Some(book) => reasons.extend(microstructure::evaluate(book, &self.cfg)),
            None => reasons.push(ReasonCode::StaleData),
        }

        // ── Operational guards ──────────────────────────────────────────
        if let Some(code) = guards::freshness(&input.guard_ctx, &self.cfg) {
            reasons.push(code);
        }
        if let Some(code) = guards::fatigue(&input.guard_ctx, &self.cfg) {
            reasons.push(code);
        }

        let late = self.late_fill.evaluate(
            &input.symbol.pair(),
            input.execution_delay_secs,
            input.guard_ctx.regime,
            input.infra_healthy,
            input.atr_proximity,
            input.order_p99_ms,
            now,
        );
        if let Some(code) = late.reason {
            reasons.push(code);
        }
        if let Some(code) = late.relaxation {
            relaxations.push(code);
        }

        let passed = reasons.is_empty();
        debug!(
            symbol = %input.symbol,
            passed,
            reasons = ?reasons,
            relaxations = ?relaxations,
            "gate evaluation complete"
        );

        GateOutcome {
            symbol: input.symbol.pair(),
            passed,
            reasons,
            relaxations_applied: relaxations,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::depth::OrderBookSnapshot;
    use crate::regime::Regime;
    use crate::types::Venue;
    use chrono::Utc;

    fn engine() -> GateEngine {
        GateEngine::new(GateConfig::default(), Arc::new(EmergencyControls::new(0.5)))
    }

    fn book(spread: f64, depth: f64, vadr: f64) -> OrderBookSnapshot {
        OrderBookSnapshot {
            symbol: "BTCUSD".to_string(),
            venue: Venue::Kraken,
            ts: Utc::now(),
            bid_levels: Vec::new(),
            ask_levels: Vec::new(),
            spread_bps: spread,
            depth_usd: depth,
            vadr_multiplier: vadr,
        }
    }

    fn ctx() -> GuardContext {
        GuardContext {
            regime: Regime::Trending,
            bars_since_signal: 1,
            price_move_atr: 0.4,
            momentum_24h_pct: 6.0,
            rsi_4h: Some(55.0),
            accel_renewal: true,
            vadr_multiplier: 1.9,
            spread_bps: 12.0,
        }
    }

    fn input<'a>(symbol: &'a Symbol, book: Option<&'a OrderBookSnapshot>) -> GateInput<'a> {
        GateInput {
            symbol,
            book,
            guard_ctx: ctx(),
            execution_delay_secs: 5,
            infra_healthy: true,
            atr_proximity: 0.4,
            order_p99_ms: 120.0,
        }
    }

    #[test]
    fn clean_symbol_passes_all_gates() {
        let engine = engine();
        let sym = Symbol::usd(Venue::Kraken, "BTC");
        let b = book(12.0, 250_000.0, 1.9);
        let outcome = engine.evaluate(&input(&sym, Some(&b)), Instant::now());
        assert!(outcome.passed);
        assert!(outcome.reasons.is_empty());
    }

    #[test]
    fn emergency_short_circuits_without_data_gates() {
        let emergency = Arc::new(EmergencyControls::new(0.5));
        emergency.set_global_pause(true);
        let engine = GateEngine::new(GateConfig::default(), emergency);

        let sym = Symbol::usd(Venue::Kraken, "BTC");
        let outcome = engine.evaluate(&input(&sym, None), Instant::now());
        assert!(!outcome.passed);
        assert_eq!(outcome.reasons, vec![ReasonCode::GlobalPause]);
    }

    #[test]
    fn missing_book_is_stale_data() {
        let engine = engine();
        let sym = Symbol::usd(Venue::Kraken, "BTC");
        let outcome = engine.evaluate(&input(&sym, None), Instant::now());
        assert!(!outcome.passed);
        assert!(outcome.reasons.contains(&ReasonCode::StaleData));
    }

    #[test]
    fn reasons_accumulate_across_families() {
        let engine = engine();
        let sym = Symbol::usd(Venue::Kraken, "BTC");
        let b = book(60.0, 50_000.0, 1.0);
        let mut inp = input(&sym, Some(&b));
        inp.guard_ctx.momentum_24h_pct = 30.0; // fatigue ceiling
        inp.execution_delay_secs = 90; // past late-fill ceiling

        let outcome = engine.evaluate(&inp, Instant::now());
        assert!(!outcome.passed);
        for code in [
            ReasonCode::SpreadExceeded,
            ReasonCode::DepthInsufficient,
            ReasonCode::VadrLow,
            ReasonCode::FatigueBlock,
            ReasonCode::LateFill,
        ] {
            assert!(outcome.reasons.contains(&code), "missing {code}");
        }
    }

    #[test]
    fn relaxation_is_reported() {
        let engine = engine();
        let sym = Symbol::usd(Venue::Kraken, "BTC");
        let b = book(12.0, 250_000.0, 1.9);
        let mut inp = input(&sym, Some(&b));
        inp.guard_ctx.regime = Regime::Choppy;
        inp.execution_delay_secs = 42;
        inp.order_p99_ms = 450.0;

        let outcome = engine.evaluate(&inp, Instant::now());
        assert!(outcome.passed);
        assert_eq!(
            outcome.relaxations_applied,
            vec![ReasonCode::LateFillRelaxApplied]
        );
    }
}
