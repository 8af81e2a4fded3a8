// =============================================================================
// Microstructure Gates — spread, depth, VADR, venue authority
// =============================================================================
//
// All four must pass. Boundary semantics are part of the output contract:
// spread is a strict less-than (50.0 bps fails), depth and VADR are
// inclusive (exactly $100,000 / exactly 1.75x pass).
// =============================================================================

use tracing::debug;

use crate::config::GateConfig;
use crate::facade::depth::OrderBookSnapshot;
use crate::types::ReasonCode;

/// Evaluate every microstructure gate, returning all failing reasons.
pub fn evaluate(snapshot: &OrderBookSnapshot, cfg: &GateConfig) -> Vec<ReasonCode> {
    let mut reasons = Vec::new();

    // Venue authority first: a banned source invalidates the other readings.
    if !snapshot.venue.is_exchange_native() {
        reasons.push(ReasonCode::AggregatorBanned);
    }

    if snapshot.spread_bps >= cfg.max_spread_bps {
        reasons.push(ReasonCode::SpreadExceeded);
    }

    if snapshot.depth_usd < cfg.min_depth_usd {
        reasons.push(ReasonCode::DepthInsufficient);
    }

    if snapshot.vadr_multiplier < cfg.min_vadr {
        reasons.push(ReasonCode::VadrLow);
    }

    debug!(
        symbol = %snapshot.symbol,
        venue = %snapshot.venue,
        spread_bps = format!("{:.1}", snapshot.spread_bps),
        depth_usd = format!("{:.0}", snapshot.depth_usd),
        vadr = format!("{:.2}", snapshot.vadr_multiplier),
        failures = reasons.len(),
        "microstructure gates evaluated"
    );

    reasons
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Venue;
    use chrono::Utc;

    fn snapshot(venue: Venue, spread_bps: f64, depth_usd: f64, vadr: f64) -> OrderBookSnapshot {
        OrderBookSnapshot {
            symbol: "BTCUSD".to_string(),
            venue,
            ts: Utc::now(),
            bid_levels: Vec::new(),
            ask_levels: Vec::new(),
            spread_bps,
            depth_usd,
            vadr_multiplier: vadr,
        }
    }

    fn cfg() -> GateConfig {
        GateConfig::default()
    }

    #[test]
    fn healthy_book_passes() {
        let s = snapshot(Venue::Kraken, 12.0, 250_000.0, 1.9);
        assert!(evaluate(&s, &cfg()).is_empty());
    }

    #[test]
    fn spread_boundary_is_strict() {
        // Exactly 50.0 bps fails; 49.9 passes.
        let fail = snapshot(Venue::Kraken, 50.0, 250_000.0, 1.9);
        assert_eq!(evaluate(&fail, &cfg()), vec![ReasonCode::SpreadExceeded]);

        let pass = snapshot(Venue::Kraken, 49.9, 250_000.0, 1.9);
        assert!(evaluate(&pass, &cfg()).is_empty());
    }

    #[test]
    fn depth_boundary_is_inclusive() {
        // Exactly $100,000 passes; $99,999 fails.
        let pass = snapshot(Venue::Kraken, 12.0, 100_000.0, 1.9);
        assert!(evaluate(&pass, &cfg()).is_empty());

        let fail = snapshot(Venue::Kraken, 12.0, 99_999.0, 1.9);
        assert_eq!(evaluate(&fail, &cfg()), vec![ReasonCode::DepthInsufficient]);
    }

    #[test]
    fn vadr_boundary_is_inclusive() {
        let pass = snapshot(Venue::Kraken, 12.0, 250_000.0, 1.75);
        assert!(evaluate(&pass, &cfg()).is_empty());

        let fail = snapshot(Venue::Kraken, 12.0, 250_000.0, 1.74);
        assert_eq!(evaluate(&fail, &cfg()), vec![ReasonCode::VadrLow]);
    }

    #[test]
    fn aggregator_source_is_banned() {
        let s = snapshot(Venue::Coingecko, 12.0, 250_000.0, 1.9);
        let reasons = evaluate(&s, &cfg());
        assert!(reasons.contains(&ReasonCode::AggregatorBanned));
    }

    #[test]
    fn all_failures_are_collected() {
        let s = snapshot(Venue::Coingecko, 80.0, 10_000.0, 0.5);
        let reasons = evaluate(&s, &cfg());
        assert_eq!(reasons.len(), 4);
    }
}
