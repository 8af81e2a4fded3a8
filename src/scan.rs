// =============================================================================
// Scan Pipeline — one full pass over the universe
// =============================================================================
//
// Phases, in order:
//   1. ADV ranking and intake (universe construction)
//   2. Active regime weights copied at run start
//   3. Per-symbol data gathering (worker pool, shared-nothing)
//   4. Universe-level factor computation and residualization
//   5. Composite scoring
//   6. Gate evaluation
//   7. Artifact emission and PIT persistence
//
// Fatal invariant breaches (weight sum, protected factor, social cap) abort
// before any signal artifact is written; errors.json is emitted next to
// whatever partials exist. Data gaps degrade per symbol, never the run.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::app_state::{AppState, LastScan};
use crate::artifacts::{ArtifactWriter, ErrorEvent, ExplainEntry, SignalRow};
use crate::config::FactorWeights;
use crate::facade::depth::compute_vadr;
use crate::facade::OrderBookSnapshot;
use crate::factors::{
    compute_universe, SocialInputs, SymbolFactorInputs, TimeframeReturns,
};
use crate::gates::{GateInput, GateOutcome, GuardContext};
use crate::indicators::calculate_atr;
use crate::regime::{Regime, RegimeInputs};
use crate::score::score_universe;
use crate::telemetry::Stage;
use crate::types::{Artifact, Bar, ReasonCode, Symbol, Timeframe, Venue};
use crate::universe;

/// Which cadence triggered this scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Hot,
    Warm,
}

impl ScanMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
        }
    }
}

/// Result of one scan run.
#[derive(Debug, Clone)]
pub struct ScanSummary {
    pub run_id: String,
    pub mode: ScanMode,
    pub scanned: usize,
    pub admitted: usize,
    pub rejected: usize,
    pub artifacts: Vec<Artifact>,
    pub error_count: usize,
    pub duration_ms: u64,
}

/// Everything gathered for one symbol before the universe-level phases.
struct SymbolScanData {
    symbol: Symbol,
    inputs: SymbolFactorInputs,
    book: Option<OrderBookSnapshot>,
    sources: Vec<Venue>,
    fallback: bool,
    stale: bool,
    bars_since_signal: u32,
    price_move_atr: f64,
    momentum_24h_pct: f64,
    vadr: f64,
    delay_secs: u64,
}

/// Run one scan. `cancel` flips to true on shutdown; outstanding work stops
/// at the next phase or symbol boundary.
pub async fn run_scan(
    state: &Arc<AppState>,
    mode: ScanMode,
    run_id: &str,
    cancel: &watch::Receiver<bool>,
) -> Result<ScanSummary> {
    ensure_live(cancel)?;
    let started = Instant::now();
    let run_ts = Utc::now();
    let mut errors: Vec<ErrorEvent> = Vec::new();

    let writer = ArtifactWriter::new(&state.config.artifacts_dir, run_id, run_ts)?;

    // ── Phase 1: universe ───────────────────────────────────────────────
    let mut advs: HashMap<String, f64> = HashMap::new();
    for pair in &state.config.universe {
        if let Ok(symbol) = Symbol::parse(Venue::Binance, pair) {
            if let Some(volume) = state.facade.volume_24h(&symbol).await {
                advs.insert(symbol.pair(), volume);
            }
        }
    }
    let universe = universe::build(&state.config, &state.emergency, &advs);
    for (pair, code) in &universe.rejected {
        errors.push(ErrorEvent {
            symbol: Some(pair.clone()),
            code: *code,
            detail: "rejected at intake".to_string(),
        });
    }
    let targets = match mode {
        ScanMode::Hot => universe.hot,
        ScanMode::Warm => universe.warm,
    };

    // ── Phase 2: regime weights (copied once for the whole run) ─────────
    ensure_live(cancel)?;
    let regime_snapshot = match state.regime.current() {
        Some(snapshot) => snapshot,
        None => {
            let inputs = compute_regime_inputs(state).await;
            state.regime.force_update(inputs, run_ts)
        }
    };
    let regime = regime_snapshot.regime;
    let weights: FactorWeights = regime_snapshot.weights.clone();

    // ── Phase 3: per-symbol data gathering ──────────────────────────────
    ensure_live(cancel)?;
    let semaphore = Arc::new(Semaphore::new(state.config.scan_workers));
    let mut handles = Vec::with_capacity(targets.len());
    for entry in &targets {
        let permit = semaphore.clone().acquire_owned().await?;
        let state = state.clone();
        let symbol = entry.symbol.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            if *cancel.borrow() {
                return Err((symbol.pair(), ReasonCode::StaleData));
            }
            let data_started = Instant::now();
            let result = gather_symbol(&state, &symbol, regime).await;
            state
                .telemetry
                .observe(Stage::Data, data_started.elapsed());
            result
        }));
    }

    let mut gathered: Vec<SymbolScanData> = Vec::new();
    for handle in handles {
        match handle.await.context("gather task panicked")? {
            Ok(data) => gathered.push(data),
            Err((pair, code)) => {
                warn!(pair = %pair, %code, "symbol dropped during data gathering");
                errors.push(ErrorEvent {
                    symbol: Some(pair),
                    code,
                    detail: "data gathering failed".to_string(),
                });
            }
        }
    }
    // Universe-level phases need a deterministic symbol order.
    gathered.sort_by(|a, b| a.symbol.pair().cmp(&b.symbol.pair()));

    // ── Phase 4 + 5: factors and scores ─────────────────────────────────
    ensure_live(cancel)?;
    let score_started = Instant::now();
    let factor_inputs: Vec<SymbolFactorInputs> =
        gathered.iter().map(|d| d.inputs.clone()).collect();

    let factors = match compute_universe(&factor_inputs, regime) {
        Ok(factors) => factors,
        Err(code) => return abort_fatal(&writer, errors, code),
    };
    let scores = match score_universe(&factors, &weights, regime, run_ts) {
        Ok(scores) => scores,
        Err(code) => return abort_fatal(&writer, errors, code),
    };
    state
        .telemetry
        .observe(Stage::Score, score_started.elapsed());

    let by_symbol: HashMap<String, &SymbolScanData> = gathered
        .iter()
        .map(|d| (d.symbol.pair(), d))
        .collect();
    let factor_by_symbol: HashMap<String, &crate::factors::SymbolFactors> =
        factors.iter().map(|f| (f.symbol.clone(), f)).collect();

    // ── Phase 6: gates ──────────────────────────────────────────────────
    ensure_live(cancel)?;
    let threshold = match mode {
        ScanMode::Hot => state.config.hot_score_threshold,
        ScanMode::Warm => state.config.warm_score_threshold,
    };
    let min_move = match regime {
        Regime::HighVol => state.config.min_move_highvol_pct,
        _ => state.config.min_move_pct,
    };

    let mut signal_rows = Vec::new();
    let mut premove_rows = Vec::new();
    let mut explain_entries = Vec::new();
    let mut admitted = 0usize;

    for score in &scores {
        let Some(data) = by_symbol.get(&score.symbol) else {
            continue;
        };
        let Some(symbol_factors) = factor_by_symbol.get(&score.symbol) else {
            continue;
        };

        let gate_started = Instant::now();
        let guard_ctx = GuardContext {
            regime,
            bars_since_signal: data.bars_since_signal,
            price_move_atr: data.price_move_atr,
            momentum_24h_pct: data.momentum_24h_pct,
            rsi_4h: symbol_factors.rsi_4h,
            accel_renewal: symbol_factors.momentum.accel_renewal,
            vadr_multiplier: data.vadr,
            spread_bps: data.book.as_ref().map_or(f64::MAX, |b| b.spread_bps),
        };
        let input = GateInput {
            symbol: &data.symbol,
            book: data.book.as_ref(),
            guard_ctx,
            execution_delay_secs: data.delay_secs,
            infra_healthy: !data.stale,
            atr_proximity: data.price_move_atr,
            order_p99_ms: state.telemetry.order_p99_ms(),
        };
        let mut outcome = state.gates.evaluate(&input, Instant::now());
        state.telemetry.observe(Stage::Gate, gate_started.elapsed());

        // Depth served by a fallback venue is admissible but noted.
        if let Some(book) = &data.book {
            if book.venue != data.symbol.venue {
                errors.push(ErrorEvent {
                    symbol: Some(score.symbol.clone()),
                    code: ReasonCode::VenueNotPreferred,
                    detail: format!("depth served by {} fallback", book.venue),
                });
            }
        }

        let gates_clean = outcome.passed;
        if gates_clean && score.composite < threshold {
            outcome.passed = false;
            outcome.reasons.push(ReasonCode::ScoreThreshold);
        }

        let row = SignalRow {
            timestamp: run_ts,
            symbol: score.symbol.clone(),
            score: score.composite,
            momentum_core: score.factors.momentum_core,
            vadr: data.vadr,
            spread_bps: data.book.as_ref().map_or(0.0, |b| b.spread_bps),
            depth_usd: data.book.as_ref().map_or(0.0, |b| b.depth_usd),
            regime: regime.to_string(),
            fresh: data.bars_since_signal <= state.config.gates.freshness_max_bars,
            venue: data.book.as_ref().map_or(data.symbol.venue, |b| b.venue),
            sources: data.sources.clone(),
        };

        if outcome.passed {
            admitted += 1;
            signal_rows.push(row);
        } else if gates_clean && data.momentum_24h_pct.abs() >= min_move {
            // Pre-movement watchlist: structurally sound, score not there yet.
            premove_rows.push(row);
        }

        explain_entries.push(ExplainEntry {
            symbol: score.symbol.clone(),
            composite: score.composite,
            factors: score.factors.clone(),
            weights: weights.clone(),
            reasons: outcome.reasons.clone(),
            gate_outcome: outcome,
            sources: data.sources.clone(),
            fallback: data.fallback,
            stale: data.stale,
        });
    }

    // ── Phase 7: artifacts + persistence ────────────────────────────────
    ensure_live(cancel)?;
    let mut artifacts = Vec::new();
    match mode {
        ScanMode::Hot => {
            artifacts.push(writer.write_signals(&signal_rows)?);
            artifacts.push(writer.write_premove(&premove_rows)?);
            artifacts.push(writer.write_explain(&explain_entries)?);
        }
        ScanMode::Warm => {
            artifacts.push(writer.write_warm_signals(&signal_rows)?);
        }
    }
    if !errors.is_empty() {
        writer.write_errors(&errors)?;
    }

    for artifact in &artifacts {
        state.pit.append("artifacts", run_ts, mode.as_str(), artifact)?;
    }

    let summary = ScanSummary {
        run_id: run_id.to_string(),
        mode,
        scanned: explain_entries.len(),
        admitted,
        rejected: explain_entries.len() - admitted,
        artifacts,
        error_count: errors.len(),
        duration_ms: started.elapsed().as_millis() as u64,
    };

    state.record_scan(LastScan {
        run_id: summary.run_id.clone(),
        mode: mode.as_str().to_string(),
        scanned: summary.scanned,
        admitted: summary.admitted,
        rejected: summary.rejected,
        duration_ms: summary.duration_ms,
    });

    info!(
        run_id,
        mode = mode.as_str(),
        scanned = summary.scanned,
        admitted = summary.admitted,
        duration_ms = summary.duration_ms,
        "scan complete"
    );
    Ok(summary)
}

/// Bail out when the run has been cancelled.
fn ensure_live(cancel: &watch::Receiver<bool>) -> Result<()> {
    if *cancel.borrow() {
        anyhow::bail!("scan cancelled");
    }
    Ok(())
}

/// Fatal invariant breach: emit errors.json only, then fail the run.
fn abort_fatal(
    writer: &ArtifactWriter,
    mut errors: Vec<ErrorEvent>,
    code: ReasonCode,
) -> Result<ScanSummary> {
    errors.push(ErrorEvent {
        symbol: None,
        code,
        detail: "run aborted before artifact emission".to_string(),
    });
    writer.write_errors(&errors)?;
    anyhow::bail!("fatal invariant breach: {code}")
}

// ---------------------------------------------------------------------------
// Per-symbol gathering
// ---------------------------------------------------------------------------

async fn gather_symbol(
    state: &Arc<AppState>,
    symbol: &Symbol,
    _regime: Regime,
) -> std::result::Result<SymbolScanData, (String, ReasonCode)> {
    let pair = symbol.pair();

    let (bars_1h, info_1h) = state
        .facade
        .warm_klines(symbol, Timeframe::H1, 200)
        .await
        .map_err(|code| (pair.clone(), code))?;
    if bars_1h.len() < 30 {
        return Err((pair, ReasonCode::StaleData));
    }
    // Enforce the series contract: strictly monotonic, gap-free at the bar
    // cadence. A venue that returns holes degrades this symbol, not the run.
    let bars_1h = match crate::types::BarSeries::new(Timeframe::H1, bars_1h) {
        Ok(series) => series.bars().to_vec(),
        Err(e) => {
            debug!(pair = %pair, error = %e, "1h series failed validation");
            return Err((pair, ReasonCode::StaleData));
        }
    };

    // Staleness refusal: the newest closed bar may lag by up to one bar
    // duration; anything beyond that plus the configured cadence allowance
    // is refused rather than scored.
    let now_ms = Utc::now().timestamp_millis();
    let dur_ms = Timeframe::H1.duration_ms();
    let last_bar = bars_1h.last().expect("length checked above");
    let age_beyond_close = now_ms - (last_bar.ts + dur_ms);
    let cadence_ms = (state.config.hot_scan_minutes * 60 * 1000) as i64;
    let allowance = dur_ms + (state.config.max_stale_cadences * cadence_ms as f64) as i64;
    if age_beyond_close > allowance {
        return Err((pair, ReasonCode::StaleData));
    }

    let (bars_4h, info_4h) = state
        .facade
        .warm_klines(symbol, Timeframe::H4, 60)
        .await
        .map_err(|code| (pair.clone(), code))?;

    // Consensus spot price; a dead aggregator chain degrades to the last
    // close instead of dropping the symbol.
    let (price, mut sources) = match state.facade.spot_price(symbol).await {
        Ok((sample, consensus)) => (sample.price, consensus.sources_used),
        Err(code) => {
            debug!(pair = %pair, %code, "spot consensus unavailable — using last close");
            (last_bar.close, Vec::new())
        }
    };
    if !sources.contains(&info_1h.source) {
        sources.push(info_1h.source);
    }

    let returns = returns_from_bars(&bars_1h, &bars_4h);
    let vadr = vadr_from_bars(&bars_1h);

    let book = match state.facade.l2_book(symbol, vadr).await {
        Ok((snapshot, info)) => {
            if !sources.contains(&info.source) {
                sources.push(info.source);
            }
            Some(snapshot)
        }
        Err(code) => {
            debug!(pair = %pair, %code, "no orderbook snapshot");
            None
        }
    };

    let quality = state.facade.quality_inputs(symbol, price).await;

    let atr_1h = calculate_atr(&bars_1h, 14).unwrap_or(0.0);
    let price_move_atr = if atr_1h > 0.0 {
        (price - last_bar.close).abs() / atr_1h
    } else {
        0.0
    };
    let bars_since_signal = (age_beyond_close.max(0) / dur_ms) as u32;
    let delay_secs = (age_beyond_close.max(0) / 1000) as u64;

    Ok(SymbolScanData {
        inputs: SymbolFactorInputs {
            symbol: pair,
            returns,
            bars_1h,
            bars_4h,
            quality,
            // No social provider is wired in this deployment; the factor
            // contributes zero until one is.
            social: SocialInputs::default(),
        },
        symbol: symbol.clone(),
        book,
        sources,
        fallback: info_1h.fallback || info_4h.fallback,
        stale: info_1h.stale || info_4h.stale,
        bars_since_signal,
        price_move_atr,
        momentum_24h_pct: returns.r_24h * 100.0,
        vadr,
        delay_secs,
    })
}

/// Multi-timeframe trailing returns plus 4h acceleration.
pub fn returns_from_bars(bars_1h: &[Bar], bars_4h: &[Bar]) -> TimeframeReturns {
    let closes_1h: Vec<f64> = bars_1h.iter().map(|b| b.close).collect();

    let roc = |lookback: usize| {
        crate::indicators::rate_of_change(&closes_1h, lookback).unwrap_or(0.0)
    };
    let r_4h = roc(4);

    // Acceleration: the 4h return now vs the 4h return one 4h-window ago.
    let accel_4h = if closes_1h.len() > 9 {
        let prev_window = &closes_1h[..closes_1h.len() - 4];
        let prev_r4h =
            crate::indicators::rate_of_change(prev_window, 4).unwrap_or(0.0);
        r_4h - prev_r4h
    } else {
        0.0
    };

    let closes_4h: Vec<f64> = bars_4h.iter().map(|b| b.close).collect();
    let r_7d = crate::indicators::rate_of_change(&closes_4h, 42).unwrap_or(0.0);

    TimeframeReturns {
        r_1h: roc(1),
        r_4h,
        r_12h: roc(12),
        r_24h: roc(24),
        r_7d,
        accel_4h,
    }
}

/// VADR from hourly bars: the last 24h window's volume-per-range against
/// the mean of the preceding full windows.
pub fn vadr_from_bars(bars_1h: &[Bar]) -> f64 {
    const WINDOW: usize = 24;
    if bars_1h.len() < WINDOW * 2 {
        return 0.0;
    }

    let window_stats = |bars: &[Bar]| -> (f64, f64) {
        let volume_usd: f64 = bars.iter().map(|b| b.volume * b.close).sum();
        let high = bars.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let low = bars.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        let mid = (high + low) / 2.0;
        let range_pct = if mid > 0.0 {
            (high - low) / mid * 100.0
        } else {
            0.0
        };
        (volume_usd, range_pct)
    };

    let (current_vol, current_range) = window_stats(&bars_1h[bars_1h.len() - WINDOW..]);

    let mut baseline_vols = Vec::new();
    let mut baseline_ranges = Vec::new();
    let mut end = bars_1h.len() - WINDOW;
    while end >= WINDOW {
        let (v, r) = window_stats(&bars_1h[end - WINDOW..end]);
        baseline_vols.push(v);
        baseline_ranges.push(r);
        end -= WINDOW;
    }
    let baseline_vol = baseline_vols.iter().sum::<f64>() / baseline_vols.len() as f64;
    let baseline_range =
        baseline_ranges.iter().sum::<f64>() / baseline_ranges.len() as f64;

    compute_vadr(current_vol, current_range, baseline_vol, baseline_range)
}

/// Breadth inputs for the regime detector, computed over the configured
/// universe from 4h bars.
pub async fn compute_regime_inputs(state: &Arc<AppState>) -> RegimeInputs {
    let mut above_ma = 0usize;
    let mut advancers = 0usize;
    let mut decliners = 0usize;
    let mut counted = 0usize;
    let mut btc_daily_returns: Vec<f64> = Vec::new();

    for pair in &state.config.universe {
        let Ok(symbol) = Symbol::parse(Venue::Binance, pair) else {
            continue;
        };
        let Ok((bars_4h, _)) = state.facade.warm_klines(&symbol, Timeframe::H4, 60).await
        else {
            continue;
        };
        if bars_4h.len() < 21 {
            continue;
        }
        counted += 1;

        let closes: Vec<f64> = bars_4h.iter().map(|b| b.close).collect();
        let last = *closes.last().expect("length checked");
        let sma20: f64 = closes[closes.len() - 20..].iter().sum::<f64>() / 20.0;
        if last > sma20 {
            above_ma += 1;
        }

        match crate::indicators::rate_of_change(&closes, 1) {
            Some(r) if r > 0.0 => advancers += 1,
            Some(_) => decliners += 1,
            None => {}
        }

        if symbol.base == "BTC" {
            // Daily returns from 4h closes (6 bars per day).
            btc_daily_returns = closes
                .chunks(6)
                .filter(|c| c.len() == 6)
                .map(|c| (c[5] - c[0]) / c[0])
                .collect();
        }
    }

    let realized_vol_7d = if btc_daily_returns.len() >= 2 {
        let n = btc_daily_returns.len() as f64;
        let mean = btc_daily_returns.iter().sum::<f64>() / n;
        let variance = btc_daily_returns
            .iter()
            .map(|r| (r - mean).powi(2))
            .sum::<f64>()
            / n;
        variance.sqrt() * (365.0_f64).sqrt()
    } else {
        0.0
    };

    let pct_above_20ma = if counted > 0 {
        above_ma as f64 / counted as f64 * 100.0
    } else {
        0.0
    };
    let breadth_thrust = if advancers + decliners > 0 {
        (advancers as f64 - decliners as f64) / (advancers + decliners) as f64
    } else {
        0.0
    };

    RegimeInputs {
        realized_vol_7d,
        pct_above_20ma,
        breadth_thrust,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(i: usize, close: f64, volume: f64) -> Bar {
        Bar {
            ts: i as i64 * 3_600_000,
            open: close,
            high: close * 1.01,
            low: close * 0.99,
            close,
            volume,
        }
    }

    #[test]
    fn returns_cover_all_timeframes() {
        // 1% per hour compounding.
        let bars_1h: Vec<Bar> = (0..60)
            .map(|i| bar(i, 100.0 * 1.01f64.powi(i as i32), 10.0))
            .collect();
        let bars_4h: Vec<Bar> = (0..50)
            .map(|i| bar(i, 100.0 * 1.02f64.powi(i as i32), 10.0))
            .collect();

        let r = returns_from_bars(&bars_1h, &bars_4h);
        assert!((r.r_1h - 0.01).abs() < 1e-9);
        assert!(r.r_4h > r.r_1h);
        assert!(r.r_24h > r.r_12h);
        assert!(r.r_7d > 0.0);
        // Constant compounding: acceleration about zero.
        assert!(r.accel_4h.abs() < 1e-3);
    }

    #[test]
    fn acceleration_detects_regime_change() {
        // Flat for 44 bars, then the rise happens entirely in the last 4:
        // the current 4h return is positive while the prior one was zero.
        let mut closes: Vec<f64> = vec![100.0; 44];
        for i in 0..4 {
            closes.push(100.0 + (i + 1) as f64 * 2.0);
        }
        let bars: Vec<Bar> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| bar(i, c, 10.0))
            .collect();
        let r = returns_from_bars(&bars, &[]);
        assert!(r.accel_4h > 0.0, "late surge must register as acceleration");
    }

    #[test]
    fn vadr_flat_history_is_about_one() {
        let bars: Vec<Bar> = (0..96).map(|i| bar(i, 100.0, 10.0)).collect();
        let v = vadr_from_bars(&bars);
        assert!((v - 1.0).abs() < 0.05, "uniform history gives ~1.0, got {v}");
    }

    #[test]
    fn vadr_volume_surge_raises_multiplier() {
        let mut bars: Vec<Bar> = (0..72).map(|i| bar(i, 100.0, 10.0)).collect();
        for i in 72..96 {
            bars.push(bar(i, 100.0, 30.0));
        }
        let v = vadr_from_bars(&bars);
        assert!(v > 2.5, "3x volume at equal range, got {v}");
    }

    #[test]
    fn vadr_insufficient_history_is_zero() {
        let bars: Vec<Bar> = (0..30).map(|i| bar(i, 100.0, 10.0)).collect();
        assert_eq!(vadr_from_bars(&bars), 0.0);
    }

    #[tokio::test]
    async fn cancelled_scan_fails_cleanly() {
        let state = AppState::new(crate::config::ScannerConfig::default());
        let (tx, rx) = watch::channel(true);
        drop(tx);
        let err = run_scan(&state, ScanMode::Hot, "cancelled-run", &rx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
