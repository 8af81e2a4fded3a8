// =============================================================================
// Universe — intake validation and ADV-ordered hot/warm split
// =============================================================================
//
// The configured pair list is validated at intake (USD quote, emergency
// controls), ranked by average daily volume, and split: the top N symbols
// go to the hot scan, the remainder to the warm scan. Rejections carry
// their reason codes into errors.json.
// =============================================================================

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::ScannerConfig;
use crate::emergency::EmergencyControls;
use crate::types::{ReasonCode, Symbol, Venue};

/// Preferred listing venue for new symbols: the primary of the
/// microstructure chain.
const PRIMARY_VENUE: Venue = Venue::Binance;

/// One admitted universe member.
#[derive(Debug, Clone, Serialize)]
pub struct UniverseEntry {
    pub symbol: Symbol,
    pub adv_usd: f64,
}

/// The constructed scan universe.
#[derive(Debug, Clone, Serialize)]
pub struct Universe {
    /// Top-ADV symbols for the hot scan, ADV-descending.
    pub hot: Vec<UniverseEntry>,
    /// Everything else, for the warm scan.
    pub warm: Vec<UniverseEntry>,
    /// Pairs refused at intake, with their reasons.
    pub rejected: Vec<(String, ReasonCode)>,
}

/// Build the universe from the configured pair list.
///
/// `advs` maps pair name to 24h USD volume; a missing entry ranks the pair
/// at zero rather than rejecting it.
pub fn build(
    config: &ScannerConfig,
    emergency: &EmergencyControls,
    advs: &HashMap<String, f64>,
) -> Universe {
    let mut admitted: Vec<UniverseEntry> = Vec::new();
    let mut rejected: Vec<(String, ReasonCode)> = Vec::new();

    for pair in &config.universe {
        let symbol = match Symbol::parse(PRIMARY_VENUE, pair) {
            Ok(symbol) => symbol,
            Err(code) => {
                debug!(pair, %code, "pair rejected at intake");
                rejected.push((pair.clone(), code));
                continue;
            }
        };

        if let Some(code) = emergency.check(&symbol) {
            debug!(pair, %code, "pair rejected by emergency controls");
            rejected.push((pair.clone(), code));
            continue;
        }

        let adv_usd = advs.get(&symbol.pair()).copied().unwrap_or(0.0);
        admitted.push(UniverseEntry { symbol, adv_usd });
    }

    // ADV descending; equal ADVs order lexicographically for determinism.
    admitted.sort_by(|a, b| {
        b.adv_usd
            .partial_cmp(&a.adv_usd)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.symbol.pair().cmp(&b.symbol.pair()))
    });

    let split = config.hot_universe_size.min(admitted.len());
    let warm = admitted.split_off(split);

    info!(
        hot = admitted.len(),
        warm = warm.len(),
        rejected = rejected.len(),
        "universe constructed"
    );

    Universe {
        hot: admitted,
        warm,
        rejected,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn advs(entries: &[(&str, f64)]) -> HashMap<String, f64> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    fn config(pairs: &[&str], hot_size: usize) -> ScannerConfig {
        ScannerConfig {
            universe: pairs.iter().map(|s| s.to_string()).collect(),
            hot_universe_size: hot_size,
            ..Default::default()
        }
    }

    #[test]
    fn non_usd_pairs_are_rejected() {
        let cfg = config(&["BTCUSD", "ETHEUR"], 30);
        let emergency = EmergencyControls::new(0.5);
        let universe = build(&cfg, &emergency, &advs(&[]));
        assert_eq!(universe.hot.len(), 1);
        assert_eq!(
            universe.rejected,
            vec![("ETHEUR".to_string(), ReasonCode::NonUsdQuote)]
        );
    }

    #[test]
    fn adv_ranking_splits_hot_and_warm() {
        let cfg = config(&["AUSD", "BUSD", "CUSD"], 2);
        let emergency = EmergencyControls::new(0.5);
        let universe = build(
            &cfg,
            &emergency,
            &advs(&[("AUSD", 100.0), ("BUSD", 300.0), ("CUSD", 200.0)]),
        );
        let hot: Vec<String> = universe.hot.iter().map(|e| e.symbol.pair()).collect();
        assert_eq!(hot, vec!["BUSD", "CUSD"]);
        assert_eq!(universe.warm.len(), 1);
        assert_eq!(universe.warm[0].symbol.pair(), "AUSD");
    }

    #[test]
    fn blacklisted_pairs_carry_their_reason() {
        let cfg = config(&["BTCUSD", "ETHUSD"], 30);
        let emergency = EmergencyControls::new(0.5);
        emergency.blacklist_symbol("ETHUSD");
        let universe = build(&cfg, &emergency, &advs(&[]));
        assert_eq!(universe.hot.len(), 1);
        assert_eq!(
            universe.rejected,
            vec![("ETHUSD".to_string(), ReasonCode::SymbolBlacklisted)]
        );
    }

    #[test]
    fn missing_adv_ranks_last_deterministically() {
        let cfg = config(&["AUSD", "BUSD"], 30);
        let emergency = EmergencyControls::new(0.5);
        let universe = build(&cfg, &emergency, &advs(&[("BUSD", 10.0)]));
        assert_eq!(universe.hot[0].symbol.pair(), "BUSD");
        assert_eq!(universe.hot[1].symbol.pair(), "AUSD");
    }
}
