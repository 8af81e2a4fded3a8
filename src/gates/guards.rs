// =============================================================================
// Operational Guards — freshness, fatigue, late-fill (regime-aware)
// =============================================================================
//
// Every guard has a baseline, a trending-only relaxation with its own
// preconditions, and an absolute ceiling no relaxation may cross.
//
// The late-fill guard is stateful: when the order stage's rolling p99
// exceeds the configured threshold, a one-shot grace window may admit an
// otherwise-late fill, after which the symbol is in cooldown for 30 minutes.
//
//   normal -> relaxed (grace, if p99 > threshold and cooldown clear)
//          -> cooldown (30 m) -> normal
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::GateConfig;
use crate::regime::Regime;
use crate::types::ReasonCode;

/// Inputs common to the freshness and fatigue guards for one symbol.
#[derive(Debug, Clone, Copy)]
pub struct GuardContext {
    pub regime: Regime,
    /// Completed bars since the signal bar closed.
    pub bars_since_signal: u32,
    /// Price move since the signal, as a multiple of ATR.
    pub price_move_atr: f64,
    /// 24h momentum, percent.
    pub momentum_24h_pct: f64,
    /// RSI over 4h bars, when available.
    pub rsi_4h: Option<f64>,
    /// 4h momentum is re-accelerating (from the momentum factor).
    pub accel_renewal: bool,
    /// Current VADR and spread, for the trending freshness precondition.
    pub vadr_multiplier: f64,
    pub spread_bps: f64,
}

// ---------------------------------------------------------------------------
// Freshness
// ---------------------------------------------------------------------------

/// Signal freshness: age in bars and price drift in ATR multiples.
///
/// Trending earns a third bar only when VADR and spread independently clear
/// the microstructure bar. The ceiling and the ATR floor bound whatever the
/// config says.
pub fn freshness(ctx: &GuardContext, cfg: &GateConfig) -> Option<ReasonCode> {
    let mut allowed_bars = cfg.freshness_max_bars;
    if ctx.regime == Regime::Trending
        && ctx.vadr_multiplier >= cfg.min_vadr
        && ctx.spread_bps < cfg.max_spread_bps
    {
        allowed_bars = cfg.freshness_trending_bars;
    }
    allowed_bars = allowed_bars.min(cfg.freshness_bars_ceiling);

    let atr_factor = cfg.freshness_atr_factor.max(cfg.freshness_atr_floor);

    if ctx.bars_since_signal > allowed_bars || ctx.price_move_atr > atr_factor {
        debug!(
            bars = ctx.bars_since_signal,
            allowed = allowed_bars,
            move_atr = format!("{:.2}", ctx.price_move_atr),
            "freshness guard rejected"
        );
        return Some(ReasonCode::FreshnessStale);
    }
    None
}

// ---------------------------------------------------------------------------
// Fatigue
// ---------------------------------------------------------------------------

/// Fatigue: refuse to chase an extended move. Baseline blocks at 24h
/// momentum > 12% with RSI-4h > 70; trending tolerates 18% only on renewed
/// acceleration. The 25% / RSI-80 ceilings block unconditionally.
pub fn fatigue(ctx: &GuardContext, cfg: &GateConfig) -> Option<ReasonCode> {
    let rsi = ctx.rsi_4h.unwrap_or(50.0);

    if ctx.momentum_24h_pct > cfg.fatigue_momentum_ceiling || rsi > cfg.fatigue_rsi_ceiling {
        return Some(ReasonCode::FatigueBlock);
    }

    let momentum_limit = if ctx.regime == Regime::Trending && ctx.accel_renewal {
        cfg.fatigue_trending_pct
    } else {
        cfg.fatigue_momentum_pct
    };

    if ctx.momentum_24h_pct > momentum_limit && rsi > cfg.fatigue_rsi {
        debug!(
            momentum = format!("{:.1}", ctx.momentum_24h_pct),
            limit = format!("{momentum_limit:.1}"),
            rsi = format!("{rsi:.1}"),
            "fatigue guard rejected"
        );
        return Some(ReasonCode::FatigueBlock);
    }
    None
}

// ---------------------------------------------------------------------------
// Late-fill
// ---------------------------------------------------------------------------

/// Outcome of a late-fill evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LateFillOutcome {
    pub passed: bool,
    pub reason: Option<ReasonCode>,
    /// Set when the p99 grace window admitted this fill.
    pub relaxation: Option<ReasonCode>,
}

/// Stateful late-fill guard; one instance serves all symbols.
pub struct LateFillGuard {
    cfg: GateConfig,
    /// Per-symbol instant of the last grace application (cooldown anchor).
    grace_used: Mutex<HashMap<String, Instant>>,
}

impl LateFillGuard {
    pub fn new(cfg: GateConfig) -> Self {
        Self {
            cfg,
            grace_used: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate an execution delay of `delay_secs` from the signal bar close.
    ///
    /// `infra_healthy` gates the trending relaxation; `atr_proximity` is the
    /// distance from the trigger price in ATR multiples; `order_p99_ms` is
    /// the telemetry feed the grace window listens to.
    pub fn evaluate(
        &self,
        symbol: &str,
        delay_secs: u64,
        regime: Regime,
        infra_healthy: bool,
        atr_proximity: f64,
        order_p99_ms: f64,
        now: Instant,
    ) -> LateFillOutcome {
        let cfg = &self.cfg;

        let mut allowed = cfg.late_fill_max_secs;
        if regime == Regime::Trending
            && infra_healthy
            && atr_proximity <= cfg.freshness_atr_factor
        {
            allowed = cfg.late_fill_trending_secs;
        }
        allowed = allowed.min(cfg.late_fill_ceiling_secs);

        if delay_secs <= allowed {
            return LateFillOutcome {
                passed: true,
                reason: None,
                relaxation: None,
            };
        }

        // Grace path: one shot per symbol per cooldown, only under p99
        // pressure, never past the ceiling.
        let within_grace = delay_secs <= (allowed + cfg.late_fill_grace_secs)
            && delay_secs <= cfg.late_fill_ceiling_secs;
        if within_grace && order_p99_ms > cfg.late_fill_p99_threshold_ms {
            let mut used = self.grace_used.lock();
            let cooldown = Duration::from_secs(cfg.late_fill_cooldown_secs);
            let cooldown_clear = used
                .get(symbol)
                .map_or(true, |last| now.duration_since(*last) >= cooldown);
            if cooldown_clear {
                used.insert(symbol.to_string(), now);
                info!(
                    symbol,
                    delay_secs,
                    p99_ms = format!("{order_p99_ms:.0}"),
                    "late-fill grace window applied"
                );
                return LateFillOutcome {
                    passed: true,
                    reason: None,
                    relaxation: Some(ReasonCode::LateFillRelaxApplied),
                };
            }
        }

        LateFillOutcome {
            passed: false,
            reason: Some(ReasonCode::LateFill),
            relaxation: None,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> GateConfig {
        GateConfig::default()
    }

    fn ctx(regime: Regime) -> GuardContext {
        GuardContext {
            regime,
            bars_since_signal: 1,
            price_move_atr: 0.5,
            momentum_24h_pct: 5.0,
            rsi_4h: Some(55.0),
            accel_renewal: false,
            vadr_multiplier: 1.9,
            spread_bps: 12.0,
        }
    }

    // ---- freshness -------------------------------------------------------

    #[test]
    fn freshness_two_bars_in_choppy_passes() {
        let mut c = ctx(Regime::Choppy);
        c.bars_since_signal = 2;
        assert_eq!(freshness(&c, &cfg()), None);
    }

    #[test]
    fn freshness_three_bars_needs_trending_and_vadr() {
        let mut c = ctx(Regime::Choppy);
        c.bars_since_signal = 3;
        assert_eq!(freshness(&c, &cfg()), Some(ReasonCode::FreshnessStale));

        // Trending with strong VADR and tight spread earns the third bar.
        let mut c = ctx(Regime::Trending);
        c.bars_since_signal = 3;
        assert_eq!(freshness(&c, &cfg()), None);

        // Trending without the VADR precondition does not.
        let mut c = ctx(Regime::Trending);
        c.bars_since_signal = 3;
        c.vadr_multiplier = 1.2;
        assert_eq!(freshness(&c, &cfg()), Some(ReasonCode::FreshnessStale));
    }

    #[test]
    fn freshness_atr_drift_rejects() {
        let mut c = ctx(Regime::Choppy);
        c.price_move_atr = 1.5; // > 1.2x ATR
        assert_eq!(freshness(&c, &cfg()), Some(ReasonCode::FreshnessStale));
    }

    #[test]
    fn freshness_ceiling_bounds_misconfiguration() {
        let mut wild = cfg();
        wild.freshness_trending_bars = 50;
        let mut c = ctx(Regime::Trending);
        c.bars_since_signal = 6; // past the absolute ceiling of 5
        assert_eq!(freshness(&c, &wild), Some(ReasonCode::FreshnessStale));
    }

    #[test]
    fn freshness_highvol_keeps_baseline() {
        let mut c = ctx(Regime::HighVol);
        c.bars_since_signal = 3;
        assert_eq!(freshness(&c, &cfg()), Some(ReasonCode::FreshnessStale));
    }

    // ---- fatigue ---------------------------------------------------------

    #[test]
    fn fatigue_baseline_block() {
        let mut c = ctx(Regime::Choppy);
        c.momentum_24h_pct = 13.0;
        c.rsi_4h = Some(72.0);
        assert_eq!(fatigue(&c, &cfg()), Some(ReasonCode::FatigueBlock));
    }

    #[test]
    fn fatigue_needs_both_conditions() {
        let mut c = ctx(Regime::Choppy);
        c.momentum_24h_pct = 13.0;
        c.rsi_4h = Some(60.0); // RSI below 70: no block
        assert_eq!(fatigue(&c, &cfg()), None);
    }

    #[test]
    fn fatigue_trending_with_renewal_tolerates_more() {
        let mut c = ctx(Regime::Trending);
        c.momentum_24h_pct = 16.0;
        c.rsi_4h = Some(72.0);
        c.accel_renewal = true;
        assert_eq!(fatigue(&c, &cfg()), None);

        // Without renewal the baseline 12% applies.
        c.accel_renewal = false;
        assert_eq!(fatigue(&c, &cfg()), Some(ReasonCode::FatigueBlock));
    }

    #[test]
    fn fatigue_ceilings_are_unconditional() {
        let mut c = ctx(Regime::Trending);
        c.accel_renewal = true;
        c.momentum_24h_pct = 26.0; // past the 25% ceiling
        c.rsi_4h = Some(40.0);
        assert_eq!(fatigue(&c, &cfg()), Some(ReasonCode::FatigueBlock));

        let mut c = ctx(Regime::Trending);
        c.accel_renewal = true;
        c.momentum_24h_pct = 2.0;
        c.rsi_4h = Some(81.0); // past the RSI-80 ceiling
        assert_eq!(fatigue(&c, &cfg()), Some(ReasonCode::FatigueBlock));
    }

    // ---- late-fill -------------------------------------------------------

    #[test]
    fn late_fill_within_baseline_passes() {
        let guard = LateFillGuard::new(cfg());
        let out = guard.evaluate("BTCUSD", 25, Regime::Choppy, true, 0.5, 100.0, Instant::now());
        assert!(out.passed);
        assert!(out.relaxation.is_none());
    }

    #[test]
    fn late_fill_trending_allows_forty_five() {
        let guard = LateFillGuard::new(cfg());
        let out = guard.evaluate("BTCUSD", 42, Regime::Trending, true, 1.0, 100.0, Instant::now());
        assert!(out.passed);
        assert!(out.relaxation.is_none());

        // Unhealthy infra withdraws the relaxation.
        let out = guard.evaluate("ETHUSD", 42, Regime::Trending, false, 1.0, 100.0, Instant::now());
        assert!(!out.passed);
        assert_eq!(out.reason, Some(ReasonCode::LateFill));
    }

    #[test]
    fn late_fill_grace_under_p99_pressure_then_cooldown() {
        let guard = LateFillGuard::new(cfg());
        let t0 = Instant::now();

        // p99 450ms > 400ms, delay 42s > 30s baseline but within grace.
        let out = guard.evaluate("BTCUSD", 42, Regime::Choppy, true, 0.5, 450.0, t0);
        assert!(out.passed);
        assert_eq!(out.relaxation, Some(ReasonCode::LateFillRelaxApplied));

        // Second attempt inside the 30-minute cooldown is blocked.
        let t1 = t0 + Duration::from_secs(600);
        let out = guard.evaluate("BTCUSD", 42, Regime::Choppy, true, 0.5, 450.0, t1);
        assert!(!out.passed);
        assert_eq!(out.reason, Some(ReasonCode::LateFill));

        // After the cooldown the grace is available again.
        let t2 = t0 + Duration::from_secs(1801);
        let out = guard.evaluate("BTCUSD", 42, Regime::Choppy, true, 0.5, 450.0, t2);
        assert!(out.passed);
        assert_eq!(out.relaxation, Some(ReasonCode::LateFillRelaxApplied));
    }

    #[test]
    fn late_fill_grace_requires_p99_pressure() {
        let guard = LateFillGuard::new(cfg());
        let out = guard.evaluate("BTCUSD", 42, Regime::Choppy, true, 0.5, 200.0, Instant::now());
        assert!(!out.passed);
    }

    #[test]
    fn late_fill_ceiling_is_absolute() {
        let guard = LateFillGuard::new(cfg());
        // 65s is past the 60s ceiling: no grace, no relaxation, ever.
        let out = guard.evaluate("BTCUSD", 65, Regime::Trending, true, 0.5, 900.0, Instant::now());
        assert!(!out.passed);
        assert_eq!(out.reason, Some(ReasonCode::LateFill));
    }

    #[test]
    fn late_fill_cooldowns_are_per_symbol() {
        let guard = LateFillGuard::new(cfg());
        let t0 = Instant::now();
        let a = guard.evaluate("BTCUSD", 42, Regime::Choppy, true, 0.5, 450.0, t0);
        assert_eq!(a.relaxation, Some(ReasonCode::LateFillRelaxApplied));
        // A different symbol has its own grace budget.
        let b = guard.evaluate("ETHUSD", 42, Regime::Choppy, true, 0.5, 450.0, t0);
        assert_eq!(b.relaxation, Some(ReasonCode::LateFillRelaxApplied));
    }
}
