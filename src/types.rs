// =============================================================================
// Shared types used across the CryptoRun scan engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Venues
// ---------------------------------------------------------------------------

/// Every data source the scanner can talk to. Exchange-native venues are the
/// only ones allowed to serve depth/spread/orderbook data; aggregators may
/// serve prices and volumes only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Binance,
    Kraken,
    Coinbase,
    Okx,
    Coingecko,
    Coinpaprika,
}

impl Venue {
    /// Exchange-native venues — the microstructure allow-list.
    pub const EXCHANGE_NATIVE: [Venue; 4] =
        [Venue::Binance, Venue::Kraken, Venue::Coinbase, Venue::Okx];

    /// True when this venue is allowed to serve depth/spread data.
    pub fn is_exchange_native(self) -> bool {
        Self::EXCHANGE_NATIVE.contains(&self)
    }

    /// True when this venue is a market-data aggregator.
    pub fn is_aggregator(self) -> bool {
        !self.is_exchange_native()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Kraken => "kraken",
            Self::Coinbase => "coinbase",
            Self::Okx => "okx",
            Self::Coingecko => "coingecko",
            Self::Coinpaprika => "coinpaprika",
        }
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Venue {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binance" => Ok(Self::Binance),
            "kraken" => Ok(Self::Kraken),
            "coinbase" => Ok(Self::Coinbase),
            "okx" => Ok(Self::Okx),
            "coingecko" => Ok(Self::Coingecko),
            "coinpaprika" => Ok(Self::Coinpaprika),
            other => anyhow::bail!("unknown venue: {other}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Symbols
// ---------------------------------------------------------------------------

/// A tradable pair on a specific venue. The quote currency is invariantly
/// USD; intake rejects anything else with [`ReasonCode::NonUsdQuote`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    pub venue: Venue,
    pub base: String,
    pub quote: String,
}

impl Symbol {
    /// Construct a USD-quoted symbol. The only constructor that exists —
    /// non-USD pairs cannot be represented.
    pub fn usd(venue: Venue, base: impl Into<String>) -> Self {
        Self {
            venue,
            base: base.into().to_uppercase(),
            quote: "USD".to_string(),
        }
    }

    /// Parse a pair string such as `"BTCUSD"`. Returns the intake rejection
    /// code for anything not quoted in USD.
    pub fn parse(venue: Venue, pair: &str) -> Result<Self, ReasonCode> {
        let upper = pair.trim().to_uppercase();
        match upper.strip_suffix("USD") {
            Some(base) if !base.is_empty() => Ok(Self::usd(venue, base)),
            _ => Err(ReasonCode::NonUsdQuote),
        }
    }

    /// The venue-agnostic pair name, e.g. `"BTCUSD"`.
    pub fn pair(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}@{}", self.base, self.quote, self.venue)
    }
}

// ---------------------------------------------------------------------------
// Timeframes
// ---------------------------------------------------------------------------

/// Bar timeframes the factor pipeline consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    H1,
    H4,
    H12,
    H24,
    D7,
}

impl Timeframe {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::H12 => "12h",
            Self::H24 => "24h",
            Self::D7 => "7d",
        }
    }

    /// Bar duration in milliseconds.
    pub fn duration_ms(self) -> i64 {
        match self {
            Self::H1 => 3_600_000,
            Self::H4 => 14_400_000,
            Self::H12 => 43_200_000,
            Self::H24 => 86_400_000,
            Self::D7 => 604_800_000,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Price samples and bars
// ---------------------------------------------------------------------------

/// A single observed price with full source attribution. Immutable once
/// written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSample {
    pub symbol: String,
    pub ts: DateTime<Utc>,
    pub price: f64,
    pub source: Venue,
    /// Confidence in this sample, [0, 1].
    pub confidence: f64,
    /// True when the sample was served from the point-in-time store rather
    /// than a live fetch.
    pub pit: bool,
}

/// A single OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Bar open time, epoch milliseconds.
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// An ordered, gap-free bar sequence at a fixed timeframe.
///
/// Construction validates strict timestamp monotonicity and gap-freeness at
/// the timeframe's cadence; a series that fails either check is refused
/// rather than silently repaired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarSeries {
    pub timeframe: Timeframe,
    bars: Vec<Bar>,
}

impl BarSeries {
    pub fn new(timeframe: Timeframe, bars: Vec<Bar>) -> anyhow::Result<Self> {
        let step = timeframe.duration_ms();
        for w in bars.windows(2) {
            if w[1].ts <= w[0].ts {
                anyhow::bail!(
                    "bar series not strictly monotonic: {} then {}",
                    w[0].ts,
                    w[1].ts
                );
            }
            if w[1].ts - w[0].ts != step {
                anyhow::bail!(
                    "bar series has a gap at {} ({} ms, expected {} ms)",
                    w[0].ts,
                    w[1].ts - w[0].ts,
                    step
                );
            }
        }
        Ok(Self { timeframe, bars })
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    /// Simple return over the most recent `bars_back` bars, as a fraction.
    pub fn trailing_return(&self, bars_back: usize) -> Option<f64> {
        if self.bars.len() <= bars_back || bars_back == 0 {
            return None;
        }
        let newest = self.bars.last()?.close;
        let base = self.bars[self.bars.len() - 1 - bars_back].close;
        if base <= 0.0 {
            return None;
        }
        Some((newest - base) / base)
    }
}

// ---------------------------------------------------------------------------
// Reason codes
// ---------------------------------------------------------------------------

/// Machine-readable rejection and degradation codes. These appear verbatim
/// in artifacts and logs, so the string forms are part of the output schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "&'static str", try_from = "String")]
pub enum ReasonCode {
    // Intake
    NonUsdQuote,
    SymbolBlacklisted,
    GlobalPause,
    EmergencyControl,
    StablecoinDepeg,
    // Routing
    VenueNotPreferred,
    AggregatorBanned,
    // Safety
    RateLimited,
    CircuitOpen,
    BudgetExhausted,
    ProviderDegraded,
    // Data
    StaleData,
    InsufficientSources,
    OutlierRejected,
    PitMiss,
    // Scoring
    WeightSumInvalid,
    ProtectedFactorViolation,
    SocialCapExceeded,
    ScoreThreshold,
    // Gates
    SpreadExceeded,
    DepthInsufficient,
    VadrLow,
    FreshnessStale,
    FatigueBlock,
    LateFill,
    LateFillRelaxApplied,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NonUsdQuote => "NON_USD_QUOTE",
            Self::SymbolBlacklisted => "SYMBOL_BLACKLISTED",
            Self::GlobalPause => "GLOBAL_PAUSE",
            Self::EmergencyControl => "EMERGENCY_CONTROL",
            Self::StablecoinDepeg => "STABLECOIN_DEPEG",
            Self::VenueNotPreferred => "VENUE_NOT_PREFERRED",
            Self::AggregatorBanned => "AGGREGATOR_BANNED",
            Self::RateLimited => "RATE_LIMITED",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::BudgetExhausted => "BUDGET_EXHAUSTED",
            Self::ProviderDegraded => "PROVIDER_DEGRADED",
            Self::StaleData => "STALE_DATA",
            Self::InsufficientSources => "INSUFFICIENT_SOURCES",
            Self::OutlierRejected => "OUTLIER_REJECTED",
            Self::PitMiss => "PIT_MISS",
            Self::WeightSumInvalid => "WEIGHT_SUM_INVALID",
            Self::ProtectedFactorViolation => "PROTECTED_FACTOR_VIOLATION",
            Self::SocialCapExceeded => "SOCIAL_CAP_EXCEEDED",
            Self::ScoreThreshold => "SCORE_THRESHOLD",
            Self::SpreadExceeded => "SPREAD_EXCEEDED",
            Self::DepthInsufficient => "DEPTH_INSUFFICIENT",
            Self::VadrLow => "VADR_LOW",
            Self::FreshnessStale => "FRESHNESS_STALE",
            Self::FatigueBlock => "FATIGUE_BLOCK",
            Self::LateFill => "LATE_FILL",
            Self::LateFillRelaxApplied => "LATE_FILL_RELAX_APPLIED",
        }
    }

    /// True when the code marks a run-fatal invariant breach rather than a
    /// per-symbol rejection.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::WeightSumInvalid | Self::ProtectedFactorViolation | Self::SocialCapExceeded
        )
    }
}

impl From<ReasonCode> for &'static str {
    fn from(code: ReasonCode) -> Self {
        code.as_str()
    }
}

impl TryFrom<String> for ReasonCode {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        use ReasonCode::*;
        let code = match s.as_str() {
            "NON_USD_QUOTE" => NonUsdQuote,
            "SYMBOL_BLACKLISTED" => SymbolBlacklisted,
            "GLOBAL_PAUSE" => GlobalPause,
            "EMERGENCY_CONTROL" => EmergencyControl,
            "STABLECOIN_DEPEG" => StablecoinDepeg,
            "VENUE_NOT_PREFERRED" => VenueNotPreferred,
            "AGGREGATOR_BANNED" => AggregatorBanned,
            "RATE_LIMITED" => RateLimited,
            "CIRCUIT_OPEN" => CircuitOpen,
            "BUDGET_EXHAUSTED" => BudgetExhausted,
            "PROVIDER_DEGRADED" => ProviderDegraded,
            "STALE_DATA" => StaleData,
            "INSUFFICIENT_SOURCES" => InsufficientSources,
            "OUTLIER_REJECTED" => OutlierRejected,
            "PIT_MISS" => PitMiss,
            "WEIGHT_SUM_INVALID" => WeightSumInvalid,
            "PROTECTED_FACTOR_VIOLATION" => ProtectedFactorViolation,
            "SOCIAL_CAP_EXCEEDED" => SocialCapExceeded,
            "SCORE_THRESHOLD" => ScoreThreshold,
            "SPREAD_EXCEEDED" => SpreadExceeded,
            "DEPTH_INSUFFICIENT" => DepthInsufficient,
            "VADR_LOW" => VadrLow,
            "FRESHNESS_STALE" => FreshnessStale,
            "FATIGUE_BLOCK" => FatigueBlock,
            "LATE_FILL" => LateFill,
            "LATE_FILL_RELAX_APPLIED" => LateFillRelaxApplied,
            other => return Err(format!("unknown reason code: {other}")),
        };
        Ok(code)
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// Kinds of files a run can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Signals,
    Premove,
    Warm,
    Regime,
    Explain,
}

/// A file written by the scheduler for a specific run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub run_id: String,
    pub kind: ArtifactKind,
    pub path: String,
    pub ts: DateTime<Utc>,
    pub schema_version: u32,
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_allow_list() {
        assert!(Venue::Binance.is_exchange_native());
        assert!(Venue::Kraken.is_exchange_native());
        assert!(Venue::Coinbase.is_exchange_native());
        assert!(Venue::Okx.is_exchange_native());
        assert!(Venue::Coingecko.is_aggregator());
        assert!(Venue::Coinpaprika.is_aggregator());
    }

    #[test]
    fn symbol_parse_usd_only() {
        let sym = Symbol::parse(Venue::Kraken, "btcusd").unwrap();
        assert_eq!(sym.base, "BTC");
        assert_eq!(sym.quote, "USD");
        assert_eq!(sym.pair(), "BTCUSD");

        assert_eq!(
            Symbol::parse(Venue::Kraken, "ETHEUR"),
            Err(ReasonCode::NonUsdQuote)
        );
        assert_eq!(
            Symbol::parse(Venue::Kraken, "USD"),
            Err(ReasonCode::NonUsdQuote)
        );
    }

    #[test]
    fn bar_series_rejects_gap() {
        let bars = vec![
            Bar { ts: 0, open: 1.0, high: 1.0, low: 1.0, close: 1.0, volume: 1.0 },
            Bar { ts: 3_600_000, open: 1.0, high: 1.0, low: 1.0, close: 1.0, volume: 1.0 },
            // Gap: skips the 7_200_000 bar.
            Bar { ts: 10_800_000, open: 1.0, high: 1.0, low: 1.0, close: 1.0, volume: 1.0 },
        ];
        assert!(BarSeries::new(Timeframe::H1, bars).is_err());
    }

    #[test]
    fn bar_series_rejects_non_monotonic() {
        let bars = vec![
            Bar { ts: 3_600_000, open: 1.0, high: 1.0, low: 1.0, close: 1.0, volume: 1.0 },
            Bar { ts: 0, open: 1.0, high: 1.0, low: 1.0, close: 1.0, volume: 1.0 },
        ];
        assert!(BarSeries::new(Timeframe::H1, bars).is_err());
    }

    #[test]
    fn trailing_return_basic() {
        let bars: Vec<Bar> = (0..5)
            .map(|i| Bar {
                ts: i * 3_600_000,
                open: 100.0,
                high: 110.0,
                low: 90.0,
                close: 100.0 + i as f64,
                volume: 10.0,
            })
            .collect();
        let series = BarSeries::new(Timeframe::H1, bars).unwrap();
        // close went 100 -> 104 over 4 bars.
        let r = series.trailing_return(4).unwrap();
        assert!((r - 0.04).abs() < 1e-12);
        assert!(series.trailing_return(10).is_none());
    }

    #[test]
    fn reason_code_round_trip() {
        for code in [
            ReasonCode::NonUsdQuote,
            ReasonCode::AggregatorBanned,
            ReasonCode::CircuitOpen,
            ReasonCode::LateFillRelaxApplied,
            ReasonCode::ScoreThreshold,
        ] {
            let s = code.as_str().to_string();
            assert_eq!(ReasonCode::try_from(s).unwrap(), code);
        }
    }

    #[test]
    fn fatal_codes() {
        assert!(ReasonCode::WeightSumInvalid.is_fatal());
        assert!(ReasonCode::ProtectedFactorViolation.is_fatal());
        assert!(ReasonCode::SocialCapExceeded.is_fatal());
        assert!(!ReasonCode::SpreadExceeded.is_fatal());
        assert!(!ReasonCode::StaleData.is_fatal());
    }
}
