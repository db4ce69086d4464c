//! Fixed-spacing rate limiter
//!
//! Every resource gets its own bucket holding the earliest time the next
//! caller may be released. Callers queue on the bucket's tokio mutex, which
//! hands the lock over in arrival order, so same-resource callers are released
//! FIFO. The lock is held across the spacing sleep; a caller that gives up
//! while queued or sleeping leaves the bucket exactly as it found it.

use crate::config::RateLimitConfig;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Resource key used when a caller does not name one
pub const DEFAULT_RESOURCE: &str = "default";

#[derive(Debug, Default)]
struct Bucket {
    /// Earliest time the next caller may be released; held across the spacing sleep
    next_allowed_at: Mutex<Option<Instant>>,
    /// Readable without waiting for the schedule lock
    released: AtomicU64,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Arc<Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// Spacing enforced between releases of `resource`
    pub fn spacing_for(&self, resource: &str) -> Duration {
        self.config.spacing_for(resource)
    }

    /// Wait until `resource` may be used again. Never fails.
    pub async fn acquire(&self, resource: &str) {
        let spacing = self.spacing_for(resource);
        if spacing.is_zero() {
            return;
        }

        let bucket = self.bucket(resource);
        let mut next = bucket.next_allowed_at.lock().await;

        if let Some(next_allowed_at) = *next {
            let now = Instant::now();
            if next_allowed_at > now {
                debug!(
                    resource = %resource,
                    wait_ms = (next_allowed_at - now).as_millis() as u64,
                    "Rate limit delaying caller"
                );
                tokio::time::sleep_until(next_allowed_at).await;
            }
        }

        let released_at = Instant::now();
        *next = Some(released_at + spacing);
        bucket.released.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of callers released for `resource` since creation or last reset
    pub fn released(&self, resource: &str) -> u64 {
        self.buckets
            .get(resource)
            .map(|bucket| bucket.value().released.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Resources that have a bucket
    pub fn tracked_resources(&self) -> usize {
        self.buckets.len()
    }

    /// Forget the schedule of one resource
    pub fn reset_resource(&self, resource: &str) {
        self.buckets.remove(resource);
    }

    /// Forget every schedule
    pub fn reset(&self) {
        self.buckets.clear();
    }

    fn bucket(&self, resource: &str) -> Arc<Bucket> {
        if let Some(bucket) = self.buckets.get(resource) {
            return Arc::clone(bucket.value());
        }

        let entry = self.buckets.entry(resource.to_string()).or_default();
        Arc::clone(entry.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(delay_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            delay: Duration::from_millis(delay_ms),
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_is_pass_through() {
        let limiter = limiter(0);
        let start = Instant::now();

        for _ in 0..10 {
            limiter.acquire("api").await;
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.tracked_resources(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_calls_are_spaced() {
        let limiter = limiter(50);

        limiter.acquire("api").await;
        let first = Instant::now();
        limiter.acquire("api").await;
        let second = Instant::now();

        assert!(second - first >= Duration::from_millis(50));
        assert_eq!(limiter.released("api"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resources_are_independent() {
        let limiter = limiter(50);

        limiter.acquire("api").await;
        let start = Instant::now();
        limiter.acquire("other").await;
        limiter.acquire("third").await;

        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_call_after_idle_is_not_delayed() {
        let limiter = limiter(50);

        limiter.acquire("api").await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        let start = Instant::now();
        limiter.acquire("api").await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_resource_override() {
        let mut config = RateLimitConfig::default();
        config
            .resources
            .insert("slow".to_string(), Duration::from_millis(200));
        let limiter = RateLimiter::new(config);

        limiter.acquire("slow").await;
        let start = Instant::now();
        limiter.acquire("slow").await;
        assert!(start.elapsed() >= Duration::from_millis(200));

        // No default delay configured
        let start = Instant::now();
        limiter.acquire("fast").await;
        limiter.acquire("fast").await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_leaves_bucket_untouched() {
        let limiter = limiter(50);
        limiter.acquire("api").await;

        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), limiter.acquire("api")).await;
        assert!(abandoned.is_err());
        assert_eq!(limiter.released("api"), 1);

        let start = Instant::now();
        limiter.acquire("api").await;
        // Released at the original slot, not pushed back by the abandoned caller
        assert!(start.elapsed() <= Duration::from_millis(40));
        assert_eq!(limiter.released("api"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_count_visible_while_callers_wait() {
        let limiter = Arc::new(limiter(50));
        limiter.acquire("api").await;

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire("api").await })
        };
        // Let the waiter take the schedule lock and start sleeping
        tokio::task::yield_now().await;

        assert_eq!(limiter.released("api"), 1);
        waiter.await.expect("waiter joined");
        assert_eq!(limiter.released("api"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_forgets_schedule() {
        let limiter = limiter(50);
        limiter.acquire("api").await;

        limiter.reset();
        assert_eq!(limiter.tracked_resources(), 0);

        let start = Instant::now();
        limiter.acquire("api").await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
