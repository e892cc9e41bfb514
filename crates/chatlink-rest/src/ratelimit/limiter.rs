//! Bucket registry, global lock and concurrency cap

use super::bucket::{Bucket, CustomRateLimit, GlobalLock, LockEpoch};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

/// Poll interval while waiting for an in-flight slot
const CONCURRENCY_POLL: Duration = Duration::from_millis(25);

/// Holds every bucket of one REST client
///
/// Buckets are created lazily on first use and never removed.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: DashMap<String, Arc<Bucket>>,
    global: Arc<GlobalLock>,
    custom_limits: RwLock<Vec<CustomRateLimit>>,
    /// 0 means no cap
    max_concurrent_requests: usize,
    in_flight: Arc<AtomicUsize>,
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the number of lock holders across all buckets
    #[must_use]
    pub fn with_max_concurrent_requests(max: usize) -> Self {
        Self {
            max_concurrent_requests: max,
            ..Self::default()
        }
    }

    /// Only affects buckets created after the call
    pub fn add_custom_rate_limit(&self, limit: CustomRateLimit) {
        self.custom_limits.write().push(limit);
    }

    #[must_use]
    pub fn max_concurrent_requests(&self) -> usize {
        self.max_concurrent_requests
    }

    /// Number of lock holders currently counted against the cap
    #[must_use]
    pub fn current_concurrent_locks(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Get or create the bucket for a route key
    pub fn get_bucket(&self, key: &str) -> Arc<Bucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }

        let entry = self.buckets.entry(key.to_string()).or_insert_with(|| {
            let custom = self
                .custom_limits
                .read()
                .iter()
                .find(|rl| key.ends_with(&rl.suffix))
                .cloned();
            Arc::new(Bucket::new(
                key.to_string(),
                Arc::clone(&self.global),
                Arc::clone(&self.in_flight),
                custom,
            ))
        });
        Arc::clone(entry.value())
    }

    /// How long a caller must wait before using `bucket`
    ///
    /// The larger of the route wait (only when fewer than `min_remaining` calls
    /// are left and the reset lies ahead) and the global wait.
    pub fn get_wait_time(&self, bucket: &Bucket, min_remaining: i64) -> Duration {
        let now = Instant::now();

        let route_wait = {
            let state = bucket.state.lock();
            match state.reset {
                Some(reset) if state.remaining < min_remaining => reset.saturating_duration_since(now),
                _ => Duration::ZERO,
            }
        };

        let global_wait = self
            .global
            .until()
            .map_or(Duration::ZERO, |until| until.saturating_duration_since(now));

        route_wait.max(global_wait)
    }

    /// Block every route until `until`
    pub fn set_global_until(&self, until: Instant) {
        self.global.set(until);
    }

    #[must_use]
    pub fn global_until(&self) -> Option<Instant> {
        self.global.until()
    }

    /// Wait until a request on `key` may be made
    ///
    /// The returned epoch must be passed to [`Bucket::release`].
    pub async fn lock_bucket(&self, key: &str) -> (Arc<Bucket>, LockEpoch) {
        let bucket = self.get_bucket(key);
        let epoch = self.lock_bucket_object(&bucket).await;
        (bucket, epoch)
    }

    /// Like [`Self::lock_bucket`] for a bucket the caller already holds
    pub async fn lock_bucket_object(&self, bucket: &Bucket) -> LockEpoch {
        // The gate is never closed, so acquisition only fails if the limiter is being torn down
        let permit = Arc::clone(&bucket.gate).acquire_owned().await.ok();

        self.wait_for(bucket).await;

        let mut slot = None;
        if self.max_concurrent_requests > 0 {
            let mut waited = false;
            loop {
                let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
                if now <= self.max_concurrent_requests {
                    slot = Some(InFlightSlot::new(&self.in_flight));
                    break;
                }
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                waited = true;
                sleep(CONCURRENCY_POLL).await;
            }

            // Limits may have changed while polling
            if waited {
                self.wait_for(bucket).await;
            }
        }

        let counted = slot.map_or(false, InFlightSlot::disarm);
        bucket.enter(permit, counted)
    }

    async fn wait_for(&self, bucket: &Bucket) {
        let wait = self.get_wait_time(bucket, 1);
        if !wait.is_zero() {
            debug!(bucket = %bucket.key(), wait_ms = wait.as_millis() as u64, "Waiting on rate limit");
            sleep(wait).await;
        }
    }
}

/// Gives back an in-flight slot if locking is cancelled before it completes
struct InFlightSlot<'a> {
    counter: &'a AtomicUsize,
    armed: bool,
}

impl<'a> InFlightSlot<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        Self { counter, armed: true }
    }

    fn disarm(mut self) -> bool {
        self.armed = false;
        true
    }
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.counter.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
