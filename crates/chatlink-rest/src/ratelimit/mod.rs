//! Per-route rate limit buckets and the global lock

mod bucket;
mod limiter;

pub use bucket::{Bucket, CustomRateLimit, LockEpoch};
pub use limiter::RateLimiter;
