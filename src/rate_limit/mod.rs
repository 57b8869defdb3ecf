//! Rate limiting: distributed admission control plus adaptive header-driven
//! delays.
//!
//! Both mechanisms are advisory and fail open; losing the counter store
//! must never stall a crawl.

mod admission;
#[cfg(feature = "redis-backend")]
mod redis;

pub use admission::{AdmissionBackend, AdmissionControl, MemoryAdmission};
#[cfg(feature = "redis-backend")]
pub use redis::RedisAdmission;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

/// Thresholds for header-driven throttling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Delay applied when the upstream reports no quota information.
    pub default_delay_ms: u64,
    /// Remaining-quota level below which the low delay kicks in.
    pub low_threshold: u64,
    pub low_delay_ms: u64,
    /// Remaining-quota level below which the critical delay kicks in.
    pub critical_threshold: u64,
    pub critical_delay_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_delay_ms: 2_000,
            low_threshold: 50,
            low_delay_ms: 5_000,
            critical_threshold: 10,
            critical_delay_ms: 10_000,
        }
    }
}

/// The upstream's self-reported quota for one endpoint.
#[derive(Debug, Clone)]
struct QuotaSnapshot {
    remaining: u64,
    #[allow(dead_code)]
    limit: u64,
    reset_at: DateTime<Utc>,
}

/// Adaptive delay computed from the upstream's own rate limit headers.
///
/// Lets the crawler throttle itself before a hard 429 arrives. Snapshots
/// expire at the reported reset time; an expired snapshot falls back to
/// the default delay.
#[derive(Debug, Clone)]
pub struct AdaptiveLimiter {
    config: RateLimitConfig,
    endpoints: Arc<RwLock<HashMap<String, QuotaSnapshot>>>,
}

impl AdaptiveLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            endpoints: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Persist the quota reported by response headers for `endpoint`.
    pub async fn update_from_headers(
        &self,
        endpoint: &str,
        remaining: u64,
        reset_at: DateTime<Utc>,
        limit: u64,
    ) {
        debug!(
            "quota for {}: {}/{} remaining, resets {}",
            endpoint, remaining, limit, reset_at
        );
        self.endpoints.write().await.insert(
            endpoint.to_string(),
            QuotaSnapshot {
                remaining,
                limit,
                reset_at,
            },
        );
    }

    /// Delay to apply before the next request to `endpoint`.
    pub async fn delay_for(&self, endpoint: &str) -> Duration {
        let endpoints = self.endpoints.read().await;
        let Some(snapshot) = endpoints.get(endpoint) else {
            return Duration::from_millis(self.config.default_delay_ms);
        };

        let now = Utc::now();
        if snapshot.reset_at <= now {
            // Quota window already rolled over; the snapshot is stale.
            return Duration::from_millis(self.config.default_delay_ms);
        }

        if snapshot.remaining == 0 {
            // Exhausted: wait out the reset, plus a second of slack for
            // clock skew between us and the upstream.
            let until_reset = (snapshot.reset_at - now)
                .to_std()
                .unwrap_or(Duration::ZERO);
            return until_reset + Duration::from_secs(1);
        }
        if snapshot.remaining < self.config.critical_threshold {
            return Duration::from_millis(self.config.critical_delay_ms);
        }
        if snapshot.remaining < self.config.low_threshold {
            return Duration::from_millis(self.config.low_delay_ms);
        }
        Duration::from_millis(self.config.default_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> AdaptiveLimiter {
        AdaptiveLimiter::new(RateLimitConfig::default())
    }

    #[tokio::test]
    async fn unknown_endpoint_gets_default_delay() {
        assert_eq!(
            limiter().delay_for("search").await,
            Duration::from_millis(2_000)
        );
    }

    #[tokio::test]
    async fn low_quota_slows_down() {
        let l = limiter();
        let reset = Utc::now() + chrono::Duration::seconds(600);
        l.update_from_headers("search", 30, reset, 150).await;
        assert_eq!(l.delay_for("search").await, Duration::from_millis(5_000));

        l.update_from_headers("search", 5, reset, 150).await;
        assert_eq!(l.delay_for("search").await, Duration::from_millis(10_000));
    }

    #[tokio::test]
    async fn exhausted_quota_waits_for_reset() {
        let l = limiter();
        let reset = Utc::now() + chrono::Duration::seconds(30);
        l.update_from_headers("search", 0, reset, 150).await;

        let delay = l.delay_for("search").await;
        assert!(delay > Duration::from_secs(25));
        assert!(delay <= Duration::from_secs(32));
    }

    #[tokio::test]
    async fn stale_snapshot_reverts_to_default() {
        let l = limiter();
        let reset = Utc::now() - chrono::Duration::seconds(5);
        l.update_from_headers("search", 0, reset, 150).await;
        assert_eq!(l.delay_for("search").await, Duration::from_millis(2_000));
    }
}
