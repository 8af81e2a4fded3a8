// =============================================================================
// Rate Limiter — per-provider token bucket with server-weight awareness
// =============================================================================
//
// Two enforcement layers:
//   - A local token bucket (`rps` refill, `burst` capacity) that gates every
//     outgoing request before it is attempted.
//   - Server-side weight headers (e.g. `X-MBX-USED-WEIGHT-1M`) mirrored into
//     an atomic counter so that the bucket can refuse requests the exchange
//     would 429 anyway.
//
// 429/418 responses and `Retry-After` headers push the bucket into a hold
// period with exponentially backed-off, jittered retry spacing.
// =============================================================================

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use crate::config::ProviderLimits;

/// Fraction of the server-reported weight limit at which we stop spending.
const SERVER_WEIGHT_CEILING: f64 = 0.85;

/// Base delay for the exponential backoff ladder.
const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Backoff never exceeds this.
const BACKOFF_CAP: Duration = Duration::from_secs(60);

struct Bucket {
    /// Current token count; may be fractional between refills.
    tokens: f64,
    last_refill: Instant,
    /// Requests are refused until this instant (Retry-After / backoff hold).
    hold_until: Option<Instant>,
}

/// Token-bucket rate limiter for a single provider.
pub struct RateLimiter {
    rps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
    /// Consecutive 429/418 responses, drives the backoff ladder.
    throttle_streak: AtomicU32,
    /// Most recent server-reported used weight and its limit (0 = unknown).
    server_used_weight: AtomicU64,
    server_weight_limit: AtomicU64,
}

impl RateLimiter {
    pub fn new(limits: &ProviderLimits, now: Instant) -> Self {
        Self {
            rps: limits.rps.max(0.1),
            burst: f64::from(limits.burst.max(1)),
            bucket: Mutex::new(Bucket {
                tokens: f64::from(limits.burst.max(1)),
                last_refill: now,
                hold_until: None,
            }),
            throttle_streak: AtomicU32::new(0),
            server_used_weight: AtomicU64::new(0),
            server_weight_limit: AtomicU64::new(0),
        }
    }

    /// Try to take `weight` tokens. Returns `true` when the request may
    /// proceed.
    pub fn try_acquire(&self, weight: f64, now: Instant) -> bool {
        // Server-side weight takes precedence over the local bucket: if the
        // exchange says we are near its limit, refuse regardless of local
        // token availability.
        let limit = self.server_weight_limit.load(Ordering::Relaxed);
        if limit > 0 {
            let used = self.server_used_weight.load(Ordering::Relaxed);
            if (used as f64 + weight) > limit as f64 * SERVER_WEIGHT_CEILING {
                warn!(used, limit, "request refused — server weight near limit");
                return false;
            }
        }

        let mut bucket = self.bucket.lock();

        if let Some(hold) = bucket.hold_until {
            if now < hold {
                return false;
            }
            bucket.hold_until = None;
        }

        // Refill.
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rps).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= weight {
            bucket.tokens -= weight;
            true
        } else {
            debug!(tokens = bucket.tokens, weight, "token bucket empty");
            false
        }
    }

    /// Record a throttle response (429/418). Applies `retry_after` when the
    /// server sent one, otherwise the next rung of the jittered exponential
    /// backoff ladder.
    pub fn record_throttle(&self, retry_after: Option<Duration>, now: Instant) {
        let streak = self.throttle_streak.fetch_add(1, Ordering::Relaxed) + 1;
        let delay = retry_after.unwrap_or_else(|| backoff_delay(streak));
        self.bucket.lock().hold_until = Some(now + delay);
        warn!(
            streak,
            delay_ms = delay.as_millis() as u64,
            honored_retry_after = retry_after.is_some(),
            "provider throttled — holding requests"
        );
    }

    /// Record a successful (non-throttled) response, resetting the backoff
    /// ladder.
    pub fn record_success(&self) {
        self.throttle_streak.store(0, Ordering::Relaxed);
    }

    /// Mirror server-reported weight usage from response headers.
    pub fn update_server_weight(&self, used: u64, limit: u64) {
        self.server_used_weight.store(used, Ordering::Relaxed);
        if limit > 0 {
            self.server_weight_limit.store(limit, Ordering::Relaxed);
        }
        debug!(used, limit, "server weight updated from headers");
    }

    /// Current hold deadline, if any (for diagnostics).
    pub fn held_until(&self) -> Option<Instant> {
        self.bucket.lock().hold_until
    }
}

/// Exponential backoff with full jitter: uniform in (0, base·2^streak],
/// capped.
fn backoff_delay(streak: u32) -> Duration {
    let exp = BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(streak.min(16)))
        .min(BACKOFF_CAP);
    let jittered = rand::thread_rng().gen_range(0.0..=1.0) * exp.as_secs_f64();
    Duration::from_secs_f64(jittered.max(0.001))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn limits(rps: f64, burst: u32) -> ProviderLimits {
        ProviderLimits {
            rps,
            burst,
            ..ProviderLimits::default()
        }
    }

    #[test]
    fn burst_then_refusal() {
        let now = Instant::now();
        let rl = RateLimiter::new(&limits(1.0, 3), now);
        assert!(rl.try_acquire(1.0, now));
        assert!(rl.try_acquire(1.0, now));
        assert!(rl.try_acquire(1.0, now));
        assert!(!rl.try_acquire(1.0, now));
    }

    #[test]
    fn refill_restores_tokens() {
        let now = Instant::now();
        let rl = RateLimiter::new(&limits(2.0, 2), now);
        assert!(rl.try_acquire(2.0, now));
        assert!(!rl.try_acquire(1.0, now));
        // 1 second at 2 rps refills 2 tokens.
        let later = now + Duration::from_secs(1);
        assert!(rl.try_acquire(2.0, later));
    }

    #[test]
    fn refill_caps_at_burst() {
        let now = Instant::now();
        let rl = RateLimiter::new(&limits(10.0, 2), now);
        let much_later = now + Duration::from_secs(60);
        assert!(rl.try_acquire(2.0, much_later));
        // Burst is 2; a long idle period must not accumulate more.
        assert!(!rl.try_acquire(1.0, much_later));
    }

    #[test]
    fn retry_after_is_honored() {
        let now = Instant::now();
        let rl = RateLimiter::new(&limits(100.0, 100), now);
        rl.record_throttle(Some(Duration::from_secs(5)), now);
        assert!(!rl.try_acquire(1.0, now + Duration::from_secs(1)));
        assert!(rl.try_acquire(1.0, now + Duration::from_secs(6)));
    }

    #[test]
    fn success_resets_backoff_streak() {
        let now = Instant::now();
        let rl = RateLimiter::new(&limits(100.0, 100), now);
        rl.record_throttle(None, now);
        rl.record_throttle(None, now);
        assert_eq!(rl.throttle_streak.load(Ordering::Relaxed), 2);
        rl.record_success();
        assert_eq!(rl.throttle_streak.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn server_weight_blocks_before_local_bucket() {
        let now = Instant::now();
        let rl = RateLimiter::new(&limits(100.0, 100), now);
        rl.update_server_weight(1000, 1000);
        assert!(!rl.try_acquire(1.0, now));
        rl.update_server_weight(100, 1000);
        assert!(rl.try_acquire(1.0, now));
    }

    #[test]
    fn backoff_delay_grows_and_caps() {
        // Jitter makes exact values random; bound-check instead.
        for streak in 1..20 {
            let d = backoff_delay(streak);
            assert!(d <= BACKOFF_CAP);
            assert!(d > Duration::ZERO);
        }
    }
}
