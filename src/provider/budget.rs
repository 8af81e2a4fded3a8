// =============================================================================
// Budget Guard — hourly/daily/monthly compute-unit accounting per provider
// =============================================================================
//
// Providers meter usage in compute units (plain request counts degenerate to
// cost 1). Each window rolls over independently on its calendar boundary.
//
// Utilisation tiers:
//   >= 80%  DEGRADED   — the facade doubles cache TTLs
//   >= 95%  SUPPRESSED — non-critical requests are refused
//   100%    EXHAUSTED  — all requests refused until the window rolls over
// =============================================================================

use chrono::{DateTime, Datelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ProviderLimits;

/// Utilisation tier of the most constrained window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetTier {
    Normal,
    Degraded,
    Suppressed,
    Exhausted,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    spent: u64,
    limit: u64,
    /// Identifier of the current calendar window (hour/day/month ordinal).
    stamp: i64,
}

impl Window {
    fn new(limit: u64, stamp: i64) -> Self {
        Self { spent: 0, limit, stamp }
    }

    fn roll(&mut self, stamp: i64) {
        if stamp != self.stamp {
            self.spent = 0;
            self.stamp = stamp;
        }
    }

    fn utilization(&self) -> f64 {
        if self.limit == 0 {
            0.0
        } else {
            self.spent as f64 / self.limit as f64
        }
    }
}

struct Inner {
    hourly: Window,
    daily: Window,
    monthly: Window,
}

/// Compute-unit budget guard for a single provider.
pub struct BudgetGuard {
    inner: Mutex<Inner>,
}

impl BudgetGuard {
    pub fn new(limits: &ProviderLimits, now: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                hourly: Window::new(limits.hourly_budget, hour_stamp(now)),
                daily: Window::new(limits.daily_budget, day_stamp(now)),
                monthly: Window::new(limits.monthly_budget, month_stamp(now)),
            }),
        }
    }

    /// Record `cost` compute units of spend.
    pub fn record(&self, cost: u64, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        Self::roll(&mut inner, now);
        inner.hourly.spent += cost;
        inner.daily.spent += cost;
        inner.monthly.spent += cost;
        debug!(
            cost,
            hourly = inner.hourly.spent,
            daily = inner.daily.spent,
            "budget spend recorded"
        );
    }

    /// Highest utilisation across the enabled windows.
    pub fn utilization(&self, now: DateTime<Utc>) -> f64 {
        let mut inner = self.inner.lock();
        Self::roll(&mut inner, now);
        inner
            .hourly
            .utilization()
            .max(inner.daily.utilization())
            .max(inner.monthly.utilization())
    }

    /// Current tier of the most constrained window.
    pub fn tier(&self, now: DateTime<Utc>) -> BudgetTier {
        let util = self.utilization(now);
        let tier = if util >= 1.0 {
            BudgetTier::Exhausted
        } else if util >= 0.95 {
            BudgetTier::Suppressed
        } else if util >= 0.80 {
            BudgetTier::Degraded
        } else {
            BudgetTier::Normal
        };
        if tier > BudgetTier::Normal {
            warn!(utilization = format!("{util:.2}"), ?tier, "budget pressure");
        }
        tier
    }

    /// Remaining compute units in the tightest enabled window.
    pub fn remaining(&self, now: DateTime<Utc>) -> u64 {
        let mut inner = self.inner.lock();
        Self::roll(&mut inner, now);
        [inner.hourly, inner.daily, inner.monthly]
            .iter()
            .filter(|w| w.limit > 0)
            .map(|w| w.limit.saturating_sub(w.spent))
            .min()
            .unwrap_or(u64::MAX)
    }

    fn roll(inner: &mut Inner, now: DateTime<Utc>) {
        inner.hourly.roll(hour_stamp(now));
        inner.daily.roll(day_stamp(now));
        inner.monthly.roll(month_stamp(now));
    }
}

fn hour_stamp(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(3600)
}

fn day_stamp(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(86_400)
}

fn month_stamp(now: DateTime<Utc>) -> i64 {
    i64::from(now.year()) * 12 + i64::from(now.month0())
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn limits(hourly: u64, daily: u64) -> ProviderLimits {
        ProviderLimits {
            hourly_budget: hourly,
            daily_budget: daily,
            monthly_budget: 0,
            ..ProviderLimits::default()
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn tiers_at_thresholds() {
        let now = at(0);
        let guard = BudgetGuard::new(&limits(100, 0), now);
        assert_eq!(guard.tier(now), BudgetTier::Normal);

        guard.record(80, now);
        assert_eq!(guard.tier(now), BudgetTier::Degraded);

        guard.record(15, now);
        assert_eq!(guard.tier(now), BudgetTier::Suppressed);

        guard.record(5, now);
        assert_eq!(guard.tier(now), BudgetTier::Exhausted);
    }

    #[test]
    fn hourly_window_rolls_over() {
        let now = at(0);
        let guard = BudgetGuard::new(&limits(100, 0), now);
        guard.record(100, now);
        assert_eq!(guard.tier(now), BudgetTier::Exhausted);

        let next_hour = at(3_601);
        assert_eq!(guard.tier(next_hour), BudgetTier::Normal);
        assert_eq!(guard.remaining(next_hour), 100);
    }

    #[test]
    fn daily_window_outlives_hourly() {
        let now = at(0);
        let guard = BudgetGuard::new(&limits(1_000, 1_000), now);
        guard.record(900, now);

        // Hour rolls, but the daily window still carries the spend.
        let next_hour = at(3_601);
        assert!((guard.utilization(next_hour) - 0.9).abs() < 1e-9);
        assert_eq!(guard.tier(next_hour), BudgetTier::Degraded);
    }

    #[test]
    fn disabled_windows_do_not_constrain() {
        let now = at(0);
        let guard = BudgetGuard::new(&limits(0, 0), now);
        guard.record(1_000_000, now);
        assert_eq!(guard.tier(now), BudgetTier::Normal);
        assert_eq!(guard.remaining(now), u64::MAX);
    }

    #[test]
    fn remaining_tracks_tightest_window() {
        let now = at(0);
        let guard = BudgetGuard::new(&limits(100, 1_000), now);
        guard.record(60, now);
        assert_eq!(guard.remaining(now), 40);
    }
}
