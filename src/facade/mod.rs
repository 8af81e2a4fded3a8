// =============================================================================
// Data Facade — hot/warm market data behind the safety layer
// =============================================================================
//
// The facade is the only component that touches providers and the only
// writer of cache entries. Reads degrade, never fabricate: a provider in
// trouble routes to its fallback chain, a dead chain serves the last PIT
// entry with `stale = true` and reduced confidence, and a symbol with no
// history at all surfaces `PIT_MISS`.
//
// Microstructure authority: `l2_book` refuses aggregator venues with
// `AGGREGATOR_BANNED` before any I/O happens.
// =============================================================================

pub mod cache;
pub mod depth;
pub mod hot;
pub mod warm;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::ScannerConfig;
use crate::factors::{QualityInputs, VenueFunding};
use crate::provider::{capability_check, routed_chain, DataKind, ProviderState, SafetyLayer};
use crate::reconcile::{reconcile, Consensus, ConsensusMethod, SourceSample};
use crate::types::{Bar, PriceSample, ReasonCode, Symbol, Timeframe, Venue};

pub use cache::{cache_key, CacheEntry, CacheTier, PitCache};
pub use depth::{compute_vadr, BookLevel, OrderBookSnapshot};
pub use hot::{BarBuffer, BookManager, StreamKey};
pub use warm::WarmClient;

/// Rolling history depth for funding and open interest.
const DERIVATIVES_HISTORY: usize = 180;

/// Attribution for a facade read.
#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    pub source: Venue,
    /// True when the primary of the chain did not serve this read.
    pub fallback: bool,
    pub stale: bool,
    pub confidence: f64,
}

/// Facade health snapshot for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct FacadeHealth {
    pub providers: Vec<ProviderState>,
    pub cache_keys: usize,
    pub hot_dropped_messages: u64,
}

/// The hot/warm data facade.
pub struct DataFacade {
    safety: Arc<SafetyLayer>,
    cache: PitCache,
    warm: WarmClient,
    pub bars: Arc<BarBuffer>,
    pub books: Arc<BookManager>,
    /// Rolling (price, open interest) observations per pair.
    oi_history: RwLock<HashMap<String, VecDeque<(f64, f64)>>>,
    /// Rolling funding-rate observations per pair (30d z-score baseline).
    funding_history: RwLock<HashMap<String, VecDeque<f64>>>,
}

impl DataFacade {
    pub fn new(config: &ScannerConfig, safety: Arc<SafetyLayer>) -> Arc<Self> {
        Arc::new(Self {
            cache: PitCache::new(config.ttls.clone()),
            warm: WarmClient::new(safety.clone()),
            safety,
            bars: Arc::new(BarBuffer::new(500)),
            books: Arc::new(BookManager::new()),
            oi_history: RwLock::new(HashMap::new()),
            funding_history: RwLock::new(HashMap::new()),
        })
    }

    /// Spawn hot-tier streams (klines + depth) for `pairs`. Each stream
    /// reconnects with a fixed backoff until the process shuts down.
    pub fn hot_subscribe(self: &Arc<Self>, pairs: &[String]) {
        for pair in pairs {
            for timeframe in [Timeframe::H1, Timeframe::H4] {
                let bars = self.bars.clone();
                let pair = pair.clone();
                tokio::spawn(async move {
                    loop {
                        if let Err(e) = hot::run_kline_stream(&pair, timeframe, &bars).await {
                            error!(pair = %pair, %timeframe, error = %e, "kline stream error — reconnecting in 5s");
                        }
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    }
                });
            }

            let books = self.books.clone();
            let pair = pair.clone();
            tokio::spawn(async move {
                loop {
                    if let Err(e) = hot::run_depth_stream(&pair, &books).await {
                        error!(pair = %pair, error = %e, "depth stream error — reconnecting in 5s");
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            });
        }
    }

    // -------------------------------------------------------------------------
    // Warm klines
    // -------------------------------------------------------------------------

    /// Bar history through the kline chain, hot buffer first.
    pub async fn warm_klines(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: u32,
    ) -> Result<(Vec<Bar>, SourceInfo), ReasonCode> {
        // Hot tier satisfies the read when the stream has enough history.
        let stream_key = StreamKey {
            pair: symbol.pair(),
            timeframe,
        };
        let hot_bars = self.bars.closed_bars(&stream_key, limit as usize);
        if hot_bars.len() >= limit as usize {
            return Ok((
                hot_bars,
                SourceInfo {
                    source: Venue::Binance,
                    fallback: false,
                    stale: false,
                    confidence: 1.0,
                },
            ));
        }

        let chain = routed_chain(DataKind::Klines);
        let primary = chain.first().copied();
        let mut last_err = ReasonCode::PitMiss;

        for venue in chain {
            if self.safety.is_open(venue) {
                debug!(venue = %venue, "skipping open-circuit venue for klines");
                last_err = ReasonCode::CircuitOpen;
                continue;
            }

            let key = cache_key(
                venue,
                "klines",
                &format!("{}:{}:{}", symbol.pair(), timeframe, limit),
            );
            let degraded = self.safety.is_degraded(venue);
            let result = self
                .cache
                .get_or_fetch(&key, CacheTier::PricesWarm, degraded, move || async move {
                    let bars = self.warm.fetch_klines(venue, symbol, timeframe, limit).await?;
                    Ok((serde_json::to_value(&bars)?, venue, 1.0))
                })
                .await;

            match result {
                Ok(entry) => {
                    let bars: Vec<Bar> =
                        serde_json::from_value(entry.data.clone()).map_err(|e| {
                            error!(error = %e, "cache entry failed to deserialize");
                            ReasonCode::PitMiss
                        })?;
                    return Ok((
                        bars,
                        SourceInfo {
                            source: entry.source,
                            fallback: Some(entry.source) != primary,
                            stale: entry.stale,
                            confidence: entry.confidence,
                        },
                    ));
                }
                Err(code) => {
                    warn!(venue = %venue, %code, "kline fetch failed — trying fallback");
                    last_err = code;
                }
            }
        }

        Err(last_err)
    }

    // -------------------------------------------------------------------------
    // L2 book
    // -------------------------------------------------------------------------

    /// Exchange-native orderbook snapshot with derived microstructure.
    ///
    /// The requested venue must be on the allow-list; the fallback chain
    /// covers outages of the preferred venue.
    pub async fn l2_book(
        &self,
        symbol: &Symbol,
        vadr_multiplier: f64,
    ) -> Result<(OrderBookSnapshot, SourceInfo), ReasonCode> {
        capability_check(DataKind::Microstructure, symbol.venue)?;

        // Live book from the hot tier, when the stream has one.
        if let Some(live) = self.books.get(&symbol.pair()) {
            if let Some(snapshot) = OrderBookSnapshot::from_levels(
                symbol.pair(),
                symbol.venue,
                Utc::now(),
                live.bids,
                live.asks,
                vadr_multiplier,
            ) {
                return Ok((
                    snapshot,
                    SourceInfo {
                        source: symbol.venue,
                        fallback: false,
                        stale: false,
                        confidence: 1.0,
                    },
                ));
            }
        }

        // Warm REST, preferred venue first, then the rest of the chain.
        let mut chain = vec![symbol.venue];
        chain.extend(
            routed_chain(DataKind::Microstructure)
                .into_iter()
                .filter(|v| *v != symbol.venue),
        );

        let mut last_err = ReasonCode::PitMiss;
        for venue in chain {
            if self.safety.is_open(venue) {
                last_err = ReasonCode::CircuitOpen;
                continue;
            }

            let key = cache_key(venue, "depth", &symbol.pair());
            let degraded = self.safety.is_degraded(venue);
            let result = self
                .cache
                .get_or_fetch(&key, CacheTier::Depth, degraded, move || async move {
                    let (bids, asks) = self.warm.fetch_book(venue, symbol).await?;
                    Ok((serde_json::json!({ "bids": bids, "asks": asks }), venue, 1.0))
                })
                .await;

            match result {
                Ok(entry) => {
                    let bids: Vec<BookLevel> =
                        serde_json::from_value(entry.data["bids"].clone())
                            .map_err(|_| ReasonCode::PitMiss)?;
                    let asks: Vec<BookLevel> =
                        serde_json::from_value(entry.data["asks"].clone())
                            .map_err(|_| ReasonCode::PitMiss)?;
                    let snapshot = OrderBookSnapshot::from_levels(
                        symbol.pair(),
                        entry.source,
                        entry.cached_at,
                        bids,
                        asks,
                        vadr_multiplier,
                    )
                    .ok_or(ReasonCode::PitMiss)?;
                    return Ok((
                        snapshot,
                        SourceInfo {
                            source: entry.source,
                            fallback: entry.source != symbol.venue,
                            stale: entry.stale,
                            confidence: entry.confidence,
                        },
                    ));
                }
                Err(code) => {
                    warn!(venue = %venue, %code, "book fetch failed — trying fallback");
                    last_err = code;
                }
            }
        }

        Err(last_err)
    }

    // -------------------------------------------------------------------------
    // Reconciled spot price
    // -------------------------------------------------------------------------

    /// Consensus spot price across the market-data chain (aggregators
    /// allowed). Requires at least two surviving sources.
    pub async fn spot_price(
        &self,
        symbol: &Symbol,
    ) -> Result<(PriceSample, Consensus), ReasonCode> {
        let mut samples = Vec::new();
        let mut any_stale = false;

        for venue in routed_chain(DataKind::MarketData) {
            if self.safety.is_open(venue) {
                continue;
            }
            let key = cache_key(venue, "spot", &symbol.pair());
            let degraded = self.safety.is_degraded(venue);
            let result = self
                .cache
                .get_or_fetch(&key, CacheTier::PricesHot, degraded, move || async move {
                    let price = self.warm.fetch_spot_price(venue, symbol).await?;
                    Ok((serde_json::json!(price), venue, 1.0))
                })
                .await;

            if let Ok(entry) = result {
                if let Some(price) = entry.data.as_f64() {
                    any_stale |= entry.stale;
                    samples.push(SourceSample {
                        value: price,
                        source: entry.source,
                    });
                }
            }
        }

        let consensus = reconcile(&samples, ConsensusMethod::Median)?;
        let sample = PriceSample {
            symbol: symbol.pair(),
            ts: Utc::now(),
            price: consensus.value,
            source: *consensus.sources_used.first().unwrap_or(&Venue::Coingecko),
            confidence: if any_stale {
                consensus.confidence * 0.5
            } else {
                consensus.confidence
            },
            pit: any_stale,
        };
        Ok((sample, consensus))
    }

    // -------------------------------------------------------------------------
    // Derivatives quality inputs
    // -------------------------------------------------------------------------

    /// Gather funding / OI / basis inputs for the quality factor, updating
    /// the rolling histories as a side effect.
    pub async fn quality_inputs(&self, symbol: &Symbol, spot_price: f64) -> QualityInputs {
        let mut funding = Vec::new();
        for venue in routed_chain(DataKind::Derivatives) {
            if self.safety.is_open(venue) {
                continue;
            }
            let key = cache_key(venue, "funding", &symbol.pair());
            let degraded = self.safety.is_degraded(venue);
            let result = self
                .cache
                .get_or_fetch(&key, CacheTier::Funding, degraded, move || async move {
                    let (rate, volume) = self.warm.fetch_funding(venue, symbol).await?;
                    Ok((serde_json::json!({ "rate": rate, "volume": volume }), venue, 1.0))
                })
                .await;
            if let Ok(entry) = result {
                let rate = entry.data["rate"].as_f64().unwrap_or(0.0);
                let volume = entry.data["volume"].as_f64().unwrap_or(0.0);
                funding.push(VenueFunding {
                    venue: entry.source,
                    rate,
                    volume,
                });
            }
        }

        // Update the funding history with the median observation.
        let (funding_mean_30d, funding_sigma_30d) = {
            let mut history = self.funding_history.write();
            let ring = history.entry(symbol.pair()).or_default();
            if let Some(mid) = crate::factors::quality::volume_weighted_median(&funding) {
                ring.push_back(mid);
                while ring.len() > DERIVATIVES_HISTORY {
                    ring.pop_front();
                }
            }
            mean_sigma(ring)
        };

        // Open interest history for the ΔOI ~ ΔPrice regression.
        let oi_deltas = {
            let oi = self
                .warm
                .fetch_open_interest(Venue::Binance, symbol)
                .await
                .unwrap_or(0.0);
            let mut history = self.oi_history.write();
            let ring = history.entry(symbol.pair()).or_default();
            if oi > 0.0 && spot_price > 0.0 {
                ring.push_back((spot_price, oi));
                while ring.len() > DERIVATIVES_HISTORY {
                    ring.pop_front();
                }
            }
            ring.iter()
                .collect::<Vec<_>>()
                .windows(2)
                .map(|w| (w[1].0 - w[0].0, w[1].1 - w[0].1))
                .collect()
        };

        let basis = match self.warm.fetch_basis(Venue::Binance, symbol).await {
            Ok(b) => vec![b, 0.0], // index basis vs spot par
            Err(_) => Vec::new(),
        };

        QualityInputs {
            funding,
            funding_mean_30d,
            funding_sigma_30d,
            oi_deltas,
            basis,
        }
    }

    // -------------------------------------------------------------------------
    // Misc
    // -------------------------------------------------------------------------

    /// 24h quote volume for ADV ranking (primary exchange only).
    pub async fn volume_24h(&self, symbol: &Symbol) -> Option<f64> {
        let key = cache_key(Venue::Binance, "vol24", &symbol.pair());
        let degraded = self.safety.is_degraded(Venue::Binance);
        self.cache
            .get_or_fetch(&key, CacheTier::Volumes, degraded, move || async move {
                let volume = self.warm.fetch_volume_24h(Venue::Binance, symbol).await?;
                Ok((serde_json::json!(volume), Venue::Binance, 1.0))
            })
            .await
            .ok()
            .and_then(|entry| entry.data.as_f64())
    }

    /// A PIT read against the warm cache (no fetch).
    pub fn read_as_of(
        &self,
        key: &str,
        as_of: chrono::DateTime<Utc>,
    ) -> Option<CacheEntry> {
        self.cache.read_as_of(key, as_of)
    }

    pub fn cache(&self) -> &PitCache {
        &self.cache
    }

    pub fn health(&self) -> FacadeHealth {
        FacadeHealth {
            providers: self.safety.snapshot(),
            cache_keys: self.cache.key_count(),
            hot_dropped_messages: self.bars.dropped_messages(),
        }
    }
}

/// Mean and standard deviation of a sample ring.
fn mean_sigma(ring: &VecDeque<f64>) -> (f64, f64) {
    if ring.is_empty() {
        return (0.0, 0.0);
    }
    let n = ring.len() as f64;
    let mean = ring.iter().sum::<f64>() / n;
    let variance = ring.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}
