// =============================================================================
// Point-in-Time Cache — append-only entries, TTL tiers, single-flight
// =============================================================================
//
// Entries are never mutated: a refresh appends a new entry with a later
// `cached_at`, and a PIT read answers "what was known as of T" without
// leaking anything newer. Keys are namespaced
// `cryptorun:{provider}:{endpoint}:{hash(params)}`.
//
// Concurrent misses on one key collapse to a single upstream fetch: the
// first caller becomes the leader and holds a per-key lock across its
// fetch; everyone else parks on that lock and re-reads the cache when the
// leader releases it. A leader that was cancelled mid-fetch still stores
// its result for future readers.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::TtlConfig;
use crate::types::{ReasonCode, Venue};

/// Confidence multiplier applied when a stale entry is served in degraded
/// mode.
const STALE_CONFIDENCE: f64 = 0.5;

/// Cache tiers with their own TTLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    PricesHot,
    PricesWarm,
    Volumes,
    Depth,
    Funding,
}

impl CacheTier {
    /// Base TTL for this tier; doubled when the serving provider is
    /// DEGRADED.
    pub fn ttl_secs(self, ttls: &TtlConfig, degraded: bool) -> u64 {
        let base = match self {
            Self::PricesHot => ttls.prices_hot_secs,
            Self::PricesWarm => ttls.prices_warm_secs,
            Self::Volumes => ttls.volumes_secs,
            Self::Depth => ttls.depth_secs,
            Self::Funding => ttls.funding_secs,
        };
        if degraded {
            base * 2
        } else {
            base
        }
    }
}

/// One immutable cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub data: serde_json::Value,
    pub source: Venue,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub pit: bool,
    /// Set when the entry was served past its TTL under degradation.
    pub stale: bool,
    pub confidence: f64,
}

/// Namespaced cache key: `cryptorun:{provider}:{endpoint}:{hash(params)}`.
pub fn cache_key(provider: Venue, endpoint: &str, params: &str) -> String {
    let mut hasher = DefaultHasher::new();
    params.hash(&mut hasher);
    format!("cryptorun:{provider}:{endpoint}:{:016x}", hasher.finish())
}

/// The append-only PIT cache with single-flight refresh.
pub struct PitCache {
    /// Entries per key, append-ordered (newest last).
    entries: RwLock<HashMap<String, Vec<CacheEntry>>>,
    /// Per-key refresh locks; the leader holds its lock across the fetch.
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    ttls: TtlConfig,
}

impl PitCache {
    pub fn new(ttls: TtlConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            ttls,
        }
    }

    /// Newest entry for `key`, regardless of freshness.
    pub fn newest(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().get(key).and_then(|v| v.last().cloned())
    }

    /// Newest entry whose `cached_at` does not exceed `as_of` — a true PIT
    /// read with no future leak.
    pub fn read_as_of(&self, key: &str, as_of: DateTime<Utc>) -> Option<CacheEntry> {
        self.entries
            .read()
            .get(key)?
            .iter()
            .rev()
            .find(|e| e.cached_at <= as_of)
            .cloned()
    }

    /// Number of entries appended for `key` (tests, diagnostics).
    pub fn version_count(&self, key: &str) -> usize {
        self.entries.read().get(key).map_or(0, Vec::len)
    }

    /// Total number of keys.
    pub fn key_count(&self) -> usize {
        self.entries.read().len()
    }

    /// Append an entry. Entries are immutable; this is the only writer.
    pub fn append(&self, entry: CacheEntry) {
        self.entries
            .write()
            .entry(entry.key.clone())
            .or_default()
            .push(entry);
    }

    /// Serve `key` from cache within TTL, or fetch through `fetch` with
    /// single-flight discipline.
    ///
    /// On fetch failure the newest PIT entry is served with `stale = true`
    /// and halved confidence; with no entry at all the miss surfaces as
    /// `PIT_MISS`.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        tier: CacheTier,
        source_degraded: bool,
        fetch: F,
    ) -> Result<CacheEntry, ReasonCode>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(serde_json::Value, Venue, f64)>>,
    {
        let ttl = ChronoDuration::seconds(tier.ttl_secs(&self.ttls, source_degraded) as i64);

        // Fast path, and the re-read path for followers. A follower that
        // wakes up to a still-missing entry (the leader's fetch failed)
        // takes leadership itself on the next iteration.
        let leader_guard = loop {
            let now = Utc::now();
            if let Some(entry) = self.newest(key) {
                if entry.cached_at + ttl > now {
                    return Ok(entry);
                }
            }

            let (lock, is_leader) = {
                let mut inflight = self.inflight.lock();
                match inflight.get(key) {
                    Some(lock) => (lock.clone(), false),
                    None => {
                        let lock = Arc::new(tokio::sync::Mutex::new(()));
                        inflight.insert(key.to_string(), lock.clone());
                        (lock, true)
                    }
                }
            };

            if is_leader {
                // The mutex was created this instant; the lock cannot fail.
                break lock
                    .try_lock_owned()
                    .expect("freshly inserted refresh lock is uncontended");
            }
            // Follower: park until the leader releases, then re-read.
            let _wait = lock.lock().await;
        };

        // Leader: perform the single upstream fetch.
        let result = fetch().await;

        let outcome = match result {
            Ok((data, source, confidence)) => {
                let now = Utc::now();
                let entry = CacheEntry {
                    key: key.to_string(),
                    data,
                    source,
                    cached_at: now,
                    expires_at: now + ttl,
                    pit: true,
                    stale: false,
                    confidence,
                };
                self.append(entry.clone());
                debug!(key, source = %source, "cache refreshed");
                Ok(entry)
            }
            Err(err) => {
                warn!(key, error = %err, "fetch failed — falling back to PIT entry");
                match self.newest(key) {
                    Some(mut entry) => {
                        entry.stale = true;
                        entry.confidence *= STALE_CONFIDENCE;
                        Ok(entry)
                    }
                    None => Err(ReasonCode::PitMiss),
                }
            }
        };

        // Release followers: remove the key first so late arrivals start a
        // fresh election, then drop the lock.
        self.inflight.lock().remove(key);
        drop(leader_guard);

        outcome
    }
}
