// =============================================================================
// Scanner Configuration — loaded once at startup, saved with atomic rename
// =============================================================================
//
// Central configuration hub for the CryptoRun engine. Every tunable threshold
// lives here so that gate and regime behavior can be adjusted without a
// rebuild.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::regime::Regime;
use crate::types::ReasonCode;

/// Tolerance on the regime weight sum.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_universe() -> Vec<String> {
    vec![
        "BTCUSD".to_string(),
        "ETHUSD".to_string(),
        "SOLUSD".to_string(),
        "XRPUSD".to_string(),
        "ADAUSD".to_string(),
    ]
}

fn default_stablecoins() -> Vec<String> {
    vec!["USDT".to_string(), "USDC".to_string(), "DAI".to_string()]
}

fn default_depeg_tolerance_pct() -> f64 {
    0.5
}

fn default_hot_universe_size() -> usize {
    30
}

fn default_hot_scan_minutes() -> u64 {
    15
}

fn default_warm_scan_minutes() -> u64 {
    120
}

fn default_regime_refresh_minutes() -> u64 {
    240
}

fn default_hot_score_threshold() -> f64 {
    75.0
}

fn default_warm_score_threshold() -> f64 {
    65.0
}

fn default_max_stale_cadences() -> f64 {
    2.0
}

fn default_scan_workers() -> usize {
    8
}

fn default_data_timeout_secs() -> u64 {
    10
}

fn default_gate_timeout_secs() -> u64 {
    2
}

fn default_artifacts_dir() -> String {
    "artifacts/signals".to_string()
}

fn default_pit_dir() -> String {
    "data/pit".to_string()
}

// =============================================================================
// Gate thresholds
// =============================================================================

/// Entry-gate thresholds. Baselines apply in every regime; the `trending_*`
/// relaxations apply only in the trending regime, and the `*_ceiling` values
/// are absolute bounds no relaxation may cross.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Maximum spread in basis points (strict less-than).
    #[serde(default = "GateConfig::default_max_spread_bps")]
    pub max_spread_bps: f64,

    /// Minimum USD depth within ±2% of mid (inclusive).
    #[serde(default = "GateConfig::default_min_depth_usd")]
    pub min_depth_usd: f64,

    /// Minimum VADR multiplier (inclusive).
    #[serde(default = "GateConfig::default_min_vadr")]
    pub min_vadr: f64,

    /// Freshness: maximum signal age in bars.
    #[serde(default = "GateConfig::default_freshness_max_bars")]
    pub freshness_max_bars: u32,
    #[serde(default = "GateConfig::default_freshness_trending_bars")]
    pub freshness_trending_bars: u32,
    #[serde(default = "GateConfig::default_freshness_bars_ceiling")]
    pub freshness_bars_ceiling: u32,

    /// Freshness: maximum price move as a multiple of ATR.
    #[serde(default = "GateConfig::default_freshness_atr_factor")]
    pub freshness_atr_factor: f64,
    #[serde(default = "GateConfig::default_freshness_atr_floor")]
    pub freshness_atr_floor: f64,

    /// Fatigue: 24 h momentum block threshold, percent.
    #[serde(default = "GateConfig::default_fatigue_momentum_pct")]
    pub fatigue_momentum_pct: f64,
    #[serde(default = "GateConfig::default_fatigue_trending_pct")]
    pub fatigue_trending_pct: f64,
    #[serde(default = "GateConfig::default_fatigue_momentum_ceiling")]
    pub fatigue_momentum_ceiling: f64,

    /// Fatigue: RSI-4h block threshold.
    #[serde(default = "GateConfig::default_fatigue_rsi")]
    pub fatigue_rsi: f64,
    #[serde(default = "GateConfig::default_fatigue_rsi_ceiling")]
    pub fatigue_rsi_ceiling: f64,

    /// Late-fill: maximum execution delay from signal bar close, seconds.
    #[serde(default = "GateConfig::default_late_fill_max_secs")]
    pub late_fill_max_secs: u64,
    #[serde(default = "GateConfig::default_late_fill_trending_secs")]
    pub late_fill_trending_secs: u64,
    #[serde(default = "GateConfig::default_late_fill_ceiling_secs")]
    pub late_fill_ceiling_secs: u64,

    /// Late-fill grace window applied when order-stage p99 breaches
    /// `late_fill_p99_threshold_ms`, plus its per-symbol cooldown.
    #[serde(default = "GateConfig::default_late_fill_grace_secs")]
    pub late_fill_grace_secs: u64,
    #[serde(default = "GateConfig::default_late_fill_cooldown_secs")]
    pub late_fill_cooldown_secs: u64,
    #[serde(default = "GateConfig::default_late_fill_p99_threshold_ms")]
    pub late_fill_p99_threshold_ms: f64,
}

impl GateConfig {
    fn default_max_spread_bps() -> f64 {
        50.0
    }
    fn default_min_depth_usd() -> f64 {
        100_000.0
    }
    fn default_min_vadr() -> f64 {
        1.75
    }
    fn default_freshness_max_bars() -> u32 {
        2
    }
    fn default_freshness_trending_bars() -> u32 {
        3
    }
    fn default_freshness_bars_ceiling() -> u32 {
        5
    }
    fn default_freshness_atr_factor() -> f64 {
        1.2
    }
    fn default_freshness_atr_floor() -> f64 {
        0.8
    }
    fn default_fatigue_momentum_pct() -> f64 {
        12.0
    }
    fn default_fatigue_trending_pct() -> f64 {
        18.0
    }
    fn default_fatigue_momentum_ceiling() -> f64 {
        25.0
    }
    fn default_fatigue_rsi() -> f64 {
        70.0
    }
    fn default_fatigue_rsi_ceiling() -> f64 {
        80.0
    }
    fn default_late_fill_max_secs() -> u64 {
        30
    }
    fn default_late_fill_trending_secs() -> u64 {
        45
    }
    fn default_late_fill_ceiling_secs() -> u64 {
        60
    }
    fn default_late_fill_grace_secs() -> u64 {
        30
    }
    fn default_late_fill_cooldown_secs() -> u64 {
        1800
    }
    fn default_late_fill_p99_threshold_ms() -> f64 {
        400.0
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("gate config defaults")
    }
}

// =============================================================================
// Warm-tier TTLs
// =============================================================================

/// Per-tier cache TTLs in seconds. These double while the serving provider is
/// DEGRADED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlConfig {
    #[serde(default = "TtlConfig::default_prices_hot")]
    pub prices_hot_secs: u64,
    #[serde(default = "TtlConfig::default_prices_warm")]
    pub prices_warm_secs: u64,
    #[serde(default = "TtlConfig::default_volumes")]
    pub volumes_secs: u64,
    #[serde(default = "TtlConfig::default_depth")]
    pub depth_secs: u64,
    #[serde(default = "TtlConfig::default_funding")]
    pub funding_secs: u64,
}

impl TtlConfig {
    fn default_prices_hot() -> u64 {
        5
    }
    fn default_prices_warm() -> u64 {
        30
    }
    fn default_volumes() -> u64 {
        120
    }
    fn default_depth() -> u64 {
        15
    }
    fn default_funding() -> u64 {
        300
    }
}

impl Default for TtlConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("ttl config defaults")
    }
}

// =============================================================================
// Provider limits
// =============================================================================

/// Rate-limit, circuit-breaker, and budget settings for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderLimits {
    /// Token-bucket refill rate, requests per second.
    #[serde(default = "ProviderLimits::default_rps")]
    pub rps: f64,
    /// Token-bucket burst capacity.
    #[serde(default = "ProviderLimits::default_burst")]
    pub burst: u32,

    /// Compute-unit budgets per window; 0 disables the window.
    #[serde(default = "ProviderLimits::default_hourly_budget")]
    pub hourly_budget: u64,
    #[serde(default = "ProviderLimits::default_daily_budget")]
    pub daily_budget: u64,
    #[serde(default)]
    pub monthly_budget: u64,

    /// Rolling error rate that opens the circuit.
    #[serde(default = "ProviderLimits::default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    /// Rolling window size (request outcomes) for the error rate.
    #[serde(default = "ProviderLimits::default_error_window")]
    pub error_window: usize,
    /// Consecutive failures that open the circuit.
    #[serde(default = "ProviderLimits::default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Rolling p99 latency (ms) that opens the circuit.
    #[serde(default = "ProviderLimits::default_p99_limit_ms")]
    pub p99_limit_ms: f64,

    /// Initial open-state cooldown, seconds. Doubles per re-open, capped.
    #[serde(default = "ProviderLimits::default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "ProviderLimits::default_cooldown_cap_secs")]
    pub cooldown_cap_secs: u64,
    /// Consecutive half-open probe successes required to close.
    #[serde(default = "ProviderLimits::default_success_threshold")]
    pub success_threshold: u32,
}

impl ProviderLimits {
    fn default_rps() -> f64 {
        10.0
    }
    fn default_burst() -> u32 {
        20
    }
    fn default_hourly_budget() -> u64 {
        3_000
    }
    fn default_daily_budget() -> u64 {
        50_000
    }
    fn default_error_rate_threshold() -> f64 {
        0.5
    }
    fn default_error_window() -> usize {
        50
    }
    fn default_max_consecutive_failures() -> u32 {
        5
    }
    fn default_p99_limit_ms() -> f64 {
        5_000.0
    }
    fn default_cooldown_secs() -> u64 {
        30
    }
    fn default_cooldown_cap_secs() -> u64 {
        480
    }
    fn default_success_threshold() -> u32 {
        3
    }
}

impl Default for ProviderLimits {
    fn default() -> Self {
        serde_json::from_str("{}").expect("provider limits defaults")
    }
}

// =============================================================================
// Regime weight table
// =============================================================================

/// Factor weights for one regime. Keys are factor names; `social` is never a
/// key — it is an additive term applied after the weighted sum.
pub type FactorWeights = BTreeMap<String, f64>;

/// Validate a weight map: sums to 1.0 within tolerance and carries no
/// `social` key.
pub fn validate_weights(weights: &FactorWeights) -> Result<(), ReasonCode> {
    if weights.contains_key("social") {
        return Err(ReasonCode::SocialCapExceeded);
    }
    let sum: f64 = weights.values().sum();
    if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(ReasonCode::WeightSumInvalid);
    }
    Ok(())
}

fn weights(entries: &[(&str, f64)]) -> FactorWeights {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect()
}

fn default_weight_table() -> BTreeMap<Regime, FactorWeights> {
    let mut table = BTreeMap::new();
    table.insert(
        Regime::Trending,
        weights(&[
            ("momentum_core", 0.50),
            ("technical", 0.20),
            ("volume", 0.15),
            ("quality", 0.10),
            ("catalyst", 0.05),
        ]),
    );
    table.insert(
        Regime::Choppy,
        weights(&[
            ("momentum_core", 0.40),
            ("technical", 0.25),
            ("volume", 0.15),
            ("quality", 0.15),
            ("catalyst", 0.05),
        ]),
    );
    // High-vol: weekly carry is disabled inside the momentum factor and the
    // quality sleeve takes the freed weight.
    table.insert(
        Regime::HighVol,
        weights(&[
            ("momentum_core", 0.45),
            ("technical", 0.15),
            ("volume", 0.15),
            ("quality", 0.20),
            ("catalyst", 0.05),
        ]),
    );
    table
}

fn default_min_move_pct() -> f64 {
    3.5
}

fn default_min_move_highvol_pct() -> f64 {
    7.0
}

// =============================================================================
// ScannerConfig
// =============================================================================

/// Top-level configuration for the CryptoRun engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    // --- Universe ------------------------------------------------------------

    /// USD-quoted pairs the scanner considers. Ordered by ADV at scan time.
    #[serde(default = "default_universe")]
    pub universe: Vec<String>,

    /// Stablecoins monitored for de-pegs; a de-pegged quote-adjacent
    /// stablecoin rejects affected pairs at intake.
    #[serde(default = "default_stablecoins")]
    pub stablecoins: Vec<String>,

    /// Allowed deviation from $1.00, percent, before a de-peg trips.
    #[serde(default = "default_depeg_tolerance_pct")]
    pub depeg_tolerance_pct: f64,

    /// Number of top-ADV symbols the hot scan covers.
    #[serde(default = "default_hot_universe_size")]
    pub hot_universe_size: usize,

    // --- Cadences ------------------------------------------------------------

    #[serde(default = "default_hot_scan_minutes")]
    pub hot_scan_minutes: u64,
    #[serde(default = "default_warm_scan_minutes")]
    pub warm_scan_minutes: u64,
    #[serde(default = "default_regime_refresh_minutes")]
    pub regime_refresh_minutes: u64,

    // --- Scoring -------------------------------------------------------------

    #[serde(default = "default_hot_score_threshold")]
    pub hot_score_threshold: f64,
    #[serde(default = "default_warm_score_threshold")]
    pub warm_score_threshold: f64,

    /// Per-regime factor weight blends.
    #[serde(default = "default_weight_table")]
    pub weight_table: BTreeMap<Regime, FactorWeights>,

    /// Minimum move thresholds used by the pre-movement watchlist.
    #[serde(default = "default_min_move_pct")]
    pub min_move_pct: f64,
    #[serde(default = "default_min_move_highvol_pct")]
    pub min_move_highvol_pct: f64,

    // --- Gates ---------------------------------------------------------------

    #[serde(default)]
    pub gates: GateConfig,

    // --- Data facade ---------------------------------------------------------

    #[serde(default)]
    pub ttls: TtlConfig,

    /// A symbol is refused scoring once its newest usable bar is older than
    /// this many scan cadences.
    #[serde(default = "default_max_stale_cadences")]
    pub max_stale_cadences: f64,

    // --- Providers -----------------------------------------------------------

    /// Per-provider limits, keyed by venue name. Missing providers fall back
    /// to `ProviderLimits::default()`.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderLimits>,

    // --- Pipeline ------------------------------------------------------------

    #[serde(default = "default_scan_workers")]
    pub scan_workers: usize,
    #[serde(default = "default_data_timeout_secs")]
    pub data_timeout_secs: u64,
    #[serde(default = "default_gate_timeout_secs")]
    pub gate_timeout_secs: u64,

    // --- Paths ---------------------------------------------------------------

    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: String,
    #[serde(default = "default_pit_dir")]
    pub pit_dir: String,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("scanner config defaults")
    }
}

impl ScannerConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scanner config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse scanner config from {}", path.display()))?;

        config.validate()?;

        info!(
            path = %path.display(),
            universe = config.universe.len(),
            "scanner config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise scanner config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "scanner config saved (atomic)");
        Ok(())
    }

    /// Validate cross-field invariants. Weight-table breaches are fatal to
    /// startup, not just to a run.
    pub fn validate(&self) -> Result<()> {
        for (regime, weights) in &self.weight_table {
            validate_weights(weights).map_err(|code| {
                anyhow::anyhow!("weight table for {regime}: {code}")
            })?;
        }
        if self.hot_universe_size == 0 {
            anyhow::bail!("hot_universe_size must be at least 1");
        }
        if self.scan_workers == 0 {
            anyhow::bail!("scan_workers must be at least 1");
        }
        Ok(())
    }

    /// Limits for a provider, falling back to defaults when the config does
    /// not name it.
    pub fn provider_limits(&self, provider: &str) -> ProviderLimits {
        self.providers
            .get(provider)
            .cloned()
            .unwrap_or_default()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = ScannerConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.hot_universe_size, 30);
        assert!((cfg.hot_score_threshold - 75.0).abs() < f64::EPSILON);
        assert!((cfg.warm_score_threshold - 65.0).abs() < f64::EPSILON);
        assert_eq!(cfg.ttls.prices_hot_secs, 5);
        assert_eq!(cfg.ttls.depth_secs, 15);
        assert_eq!(cfg.gates.late_fill_cooldown_secs, 1800);
    }

    #[test]
    fn default_weight_tables_sum_to_one() {
        let cfg = ScannerConfig::default();
        for weights in cfg.weight_table.values() {
            let sum: f64 = weights.values().sum();
            assert!((sum - 1.0).abs() <= WEIGHT_SUM_TOLERANCE);
        }
    }

    #[test]
    fn trending_weights_match_published_blend() {
        let cfg = ScannerConfig::default();
        let trending = &cfg.weight_table[&Regime::Trending];
        assert!((trending["momentum_core"] - 0.50).abs() < f64::EPSILON);
        assert!((trending["technical"] - 0.20).abs() < f64::EPSILON);
        assert!((trending["volume"] - 0.15).abs() < f64::EPSILON);
        assert!((trending["quality"] - 0.10).abs() < f64::EPSILON);
        assert!((trending["catalyst"] - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn weights_with_social_key_rejected() {
        let mut w = FactorWeights::new();
        w.insert("momentum_core".into(), 0.9);
        w.insert("social".into(), 0.1);
        assert_eq!(validate_weights(&w), Err(ReasonCode::SocialCapExceeded));
    }

    #[test]
    fn weights_off_sum_rejected() {
        let mut w = FactorWeights::new();
        w.insert("momentum_core".into(), 0.6);
        w.insert("technical".into(), 0.3);
        assert_eq!(validate_weights(&w), Err(ReasonCode::WeightSumInvalid));
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: ScannerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.hot_scan_minutes, 15);
        assert_eq!(cfg.warm_scan_minutes, 120);
        assert_eq!(cfg.regime_refresh_minutes, 240);
        assert_eq!(cfg.universe.len(), 5);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "universe": ["BTCUSD"], "hot_score_threshold": 80.0 }"#;
        let cfg: ScannerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.universe, vec!["BTCUSD"]);
        assert!((cfg.hot_score_threshold - 80.0).abs() < f64::EPSILON);
        assert!((cfg.warm_score_threshold - 65.0).abs() < f64::EPSILON);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = ScannerConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: ScannerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.universe, cfg2.universe);
        assert_eq!(cfg.weight_table, cfg2.weight_table);
    }

    #[test]
    fn provider_limits_fallback() {
        let cfg = ScannerConfig::default();
        let limits = cfg.provider_limits("kraken");
        assert!((limits.rps - 10.0).abs() < f64::EPSILON);
        assert_eq!(limits.max_consecutive_failures, 5);
    }
}
