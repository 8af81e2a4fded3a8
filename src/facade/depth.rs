// =============================================================================
// Depth & Spread — exchange-native orderbook snapshots
// =============================================================================
//
// Builds the microstructure view the gate engine consumes: spread in basis
// points, USD depth within ±2% of mid, and the VADR multiplier. Snapshots
// can only be constructed for exchange-native venues; the facade enforces
// the allow-list before calling in here.
//
// VADR compares the current dollar volume per unit of realized range
// against its trailing norm: a multiplier of 2 means twice the liquidity
// per point of range than usual.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Venue;

/// Half-width of the depth measurement band around mid.
const DEPTH_BAND: f64 = 0.02;

/// One orderbook price level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub qty: f64,
}

/// Exchange-native orderbook snapshot with derived microstructure metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub venue: Venue,
    pub ts: DateTime<Utc>,
    pub bid_levels: Vec<BookLevel>,
    pub ask_levels: Vec<BookLevel>,
    pub spread_bps: f64,
    /// USD notional resting within ±2% of mid, both sides.
    pub depth_usd: f64,
    pub vadr_multiplier: f64,
}

impl OrderBookSnapshot {
    /// Derive a snapshot from raw levels. Bids are best-first descending,
    /// asks best-first ascending. `vadr_multiplier` is computed separately
    /// (it needs bar history) and passed in.
    pub fn from_levels(
        symbol: impl Into<String>,
        venue: Venue,
        ts: DateTime<Utc>,
        bid_levels: Vec<BookLevel>,
        ask_levels: Vec<BookLevel>,
        vadr_multiplier: f64,
    ) -> Option<Self> {
        let best_bid = bid_levels.first()?.price;
        let best_ask = ask_levels.first()?.price;
        if best_bid <= 0.0 || best_ask <= 0.0 || best_ask < best_bid {
            return None;
        }

        let mid = (best_bid + best_ask) / 2.0;
        let spread_bps = (best_ask - best_bid) / mid * 10_000.0;

        let lower = mid * (1.0 - DEPTH_BAND);
        let upper = mid * (1.0 + DEPTH_BAND);
        let bid_depth: f64 = bid_levels
            .iter()
            .filter(|l| l.price >= lower)
            .map(|l| l.price * l.qty)
            .sum();
        let ask_depth: f64 = ask_levels
            .iter()
            .filter(|l| l.price <= upper)
            .map(|l| l.price * l.qty)
            .sum();

        Some(Self {
            symbol: symbol.into(),
            venue,
            ts,
            bid_levels,
            ask_levels,
            spread_bps,
            depth_usd: bid_depth + ask_depth,
            vadr_multiplier,
        })
    }
}

/// VADR multiplier: (current volume / current range) vs (baseline volume /
/// baseline range). Returns 0 when any input is degenerate.
pub fn compute_vadr(
    volume_24h_usd: f64,
    range_24h_pct: f64,
    baseline_volume_usd: f64,
    baseline_range_pct: f64,
) -> f64 {
    if volume_24h_usd <= 0.0
        || range_24h_pct <= 0.0
        || baseline_volume_usd <= 0.0
        || baseline_range_pct <= 0.0
    {
        return 0.0;
    }
    let current = volume_24h_usd / range_24h_pct;
    let baseline = baseline_volume_usd / baseline_range_pct;
    current / baseline
}
