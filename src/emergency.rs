// =============================================================================
// Emergency Controls — pause, blacklists, venue blocks, de-peg monitor
// =============================================================================
//
// A small lock-protected cell of operator switches, consulted at intake
// before any data is fetched for a symbol. Every mutation is appended to an
// audit log so an operator action is never silent.
//
// The de-peg monitor watches stablecoin prices: a stablecoin more than the
// configured tolerance away from $1.00 rejects every pair that depends on
// it (its own pairs, and all pairs on venues whose USD books are proxied by
// it) until it returns inside the band.
// =============================================================================

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::types::{ReasonCode, Symbol, Venue};

/// Maximum audit entries retained.
const MAX_AUDIT_ENTRIES: usize = 200;

impl Venue {
    /// The stablecoin standing in for USD on this venue's "USD" books, if
    /// any. A de-peg of that coin invalidates the venue's USD pricing.
    pub fn usd_proxy(self) -> Option<&'static str> {
        match self {
            Venue::Binance | Venue::Okx => Some("USDT"),
            Venue::Kraken | Venue::Coinbase => None,
            Venue::Coingecko | Venue::Coinpaprika => None,
        }
    }
}

/// One audited operator action.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub ts: DateTime<Utc>,
    pub action: String,
}

#[derive(Default)]
struct Inner {
    global_pause: bool,
    blacklist: HashSet<String>,
    venue_blocks: HashSet<(Venue, String)>,
    /// Stablecoins currently outside the peg band.
    depegged: HashSet<String>,
    audit: Vec<AuditEntry>,
}

/// The emergency-control cell. Shared via `Arc`; all methods take `&self`.
pub struct EmergencyControls {
    inner: RwLock<Inner>,
    /// Allowed deviation from $1.00, percent.
    depeg_tolerance_pct: f64,
}

impl EmergencyControls {
    pub fn new(depeg_tolerance_pct: f64) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            depeg_tolerance_pct,
        }
    }

    // ── Setters (all audited) ───────────────────────────────────────────

    pub fn set_global_pause(&self, paused: bool) {
        let mut inner = self.inner.write();
        inner.global_pause = paused;
        Self::audit(&mut inner, format!("global_pause={paused}"));
        warn!(paused, "global pause toggled");
    }

    pub fn blacklist_symbol(&self, pair: &str) {
        let mut inner = self.inner.write();
        inner.blacklist.insert(pair.to_uppercase());
        Self::audit(&mut inner, format!("blacklist+{pair}"));
        warn!(pair, "symbol blacklisted");
    }

    pub fn unblacklist_symbol(&self, pair: &str) {
        let mut inner = self.inner.write();
        inner.blacklist.remove(&pair.to_uppercase());
        Self::audit(&mut inner, format!("blacklist-{pair}"));
        info!(pair, "symbol unblacklisted");
    }

    pub fn block_venue_symbol(&self, venue: Venue, pair: &str) {
        let mut inner = self.inner.write();
        inner.venue_blocks.insert((venue, pair.to_uppercase()));
        Self::audit(&mut inner, format!("venue_block+{venue}:{pair}"));
        warn!(%venue, pair, "venue-symbol blocked");
    }

    /// Feed an observed stablecoin price. Trips or clears the de-peg state
    /// for that coin depending on the tolerance band.
    pub fn record_stablecoin_price(&self, coin: &str, price: f64) {
        let coin = coin.to_uppercase();
        let deviation_pct = (price - 1.0).abs() * 100.0;
        let mut inner = self.inner.write();
        if deviation_pct > self.depeg_tolerance_pct {
            if inner.depegged.insert(coin.clone()) {
                Self::audit(&mut inner, format!("depeg+{coin}@{price}"));
                warn!(coin = %coin, price, "stablecoin de-peg detected");
            }
        } else if inner.depegged.remove(&coin) {
            Self::audit(&mut inner, format!("depeg-{coin}@{price}"));
            info!(coin = %coin, price, "stablecoin re-pegged");
        }
    }

    // ── Intake check ────────────────────────────────────────────────────

    /// First failing control for `symbol`, or `None` when intake may
    /// proceed. Evaluated in severity order.
    pub fn check(&self, symbol: &Symbol) -> Option<ReasonCode> {
        let inner = self.inner.read();

        if inner.global_pause {
            return Some(ReasonCode::GlobalPause);
        }
        if inner.blacklist.contains(&symbol.pair()) {
            return Some(ReasonCode::SymbolBlacklisted);
        }
        if inner
            .venue_blocks
            .contains(&(symbol.venue, symbol.pair()))
        {
            return Some(ReasonCode::EmergencyControl);
        }
        if inner.depegged.contains(&symbol.base) {
            return Some(ReasonCode::StablecoinDepeg);
        }
        if let Some(proxy) = symbol.venue.usd_proxy() {
            if inner.depegged.contains(proxy) {
                return Some(ReasonCode::StablecoinDepeg);
            }
        }
        None
    }

    /// Audit trail, newest last.
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.inner.read().audit.clone()
    }

    fn audit(inner: &mut Inner, action: String) {
        inner.audit.push(AuditEntry {
            ts: Utc::now(),
            action,
        });
        while inner.audit.len() > MAX_AUDIT_ENTRIES {
            inner.audit.remove(0);
        }
    }
}
