// =============================================================================
// Fallback Routing — ordered provider chains per data kind
// =============================================================================
//
// Each data kind has a primary provider and an ordered list of fallbacks,
// attempted only when the primary is denied or fails. The microstructure
// chain is built exclusively from exchange-native venues; the capability
// check re-verifies this at request time so a misconfigured chain can never
// leak aggregator depth/spread data into the pipeline.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::{ReasonCode, Venue};

/// Kinds of data the facade fetches, each with its own routing chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    /// Spot prices and trailing volumes — aggregators allowed.
    MarketData,
    /// OHLCV bar history — exchange-native preferred, aggregators allowed.
    Klines,
    /// Depth, spread, and orderbooks — exchange-native ONLY.
    Microstructure,
    /// Perpetual funding and open interest — exchange-native only.
    Derivatives,
}

/// Ordered primary → fallback chain for a data kind.
pub fn chain(kind: DataKind) -> &'static [Venue] {
    match kind {
        DataKind::MarketData => &[Venue::Coingecko, Venue::Coinpaprika, Venue::Binance],
        DataKind::Klines => &[Venue::Binance, Venue::Kraken, Venue::Okx],
        DataKind::Microstructure => &[Venue::Binance, Venue::Kraken, Venue::Okx],
        DataKind::Derivatives => &[Venue::Binance, Venue::Okx],
    }
}

/// Verify that `venue` may serve `kind`. The aggregator ban on
/// microstructure (and derivatives) data is enforced here regardless of what
/// any chain says.
pub fn capability_check(kind: DataKind, venue: Venue) -> Result<(), ReasonCode> {
    match kind {
        DataKind::Microstructure | DataKind::Derivatives => {
            if venue.is_aggregator() {
                Err(ReasonCode::AggregatorBanned)
            } else {
                Ok(())
            }
        }
        DataKind::MarketData | DataKind::Klines => Ok(()),
    }
}

/// The chain for `kind` with the capability check applied to every entry.
/// A chain that survives this filter is safe to iterate without re-checking.
pub fn routed_chain(kind: DataKind) -> Vec<Venue> {
    chain(kind)
        .iter()
        .copied()
        .filter(|v| capability_check(kind, *v).is_ok())
        .collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn microstructure_chain_is_exchange_native_only() {
        for venue in chain(DataKind::Microstructure) {
            assert!(venue.is_exchange_native(), "{venue} in microstructure chain");
        }
    }

    #[test]
    fn aggregators_banned_from_microstructure() {
        assert_eq!(
            capability_check(DataKind::Microstructure, Venue::Coingecko),
            Err(ReasonCode::AggregatorBanned)
        );
        assert_eq!(
            capability_check(DataKind::Microstructure, Venue::Coinpaprika),
            Err(ReasonCode::AggregatorBanned)
        );
        assert!(capability_check(DataKind::Microstructure, Venue::Kraken).is_ok());
    }

    #[test]
    fn aggregators_allowed_for_market_data() {
        assert!(capability_check(DataKind::MarketData, Venue::Coingecko).is_ok());
        assert!(capability_check(DataKind::MarketData, Venue::Binance).is_ok());
    }

    #[test]
    fn market_data_prefers_aggregators() {
        let c = chain(DataKind::MarketData);
        assert_eq!(c[0], Venue::Coingecko);
        assert_eq!(c[1], Venue::Coinpaprika);
    }

    #[test]
    fn routed_chain_filters_nothing_for_valid_config() {
        assert_eq!(
            routed_chain(DataKind::Microstructure),
            chain(DataKind::Microstructure).to_vec()
        );
    }
}
