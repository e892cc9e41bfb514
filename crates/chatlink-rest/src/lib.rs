//! # chatlink-rest
//!
//! REST layer for the chat platform API.
//!
//! Every call goes through a [`RateLimiter`]: a per-route [`Bucket`] serializes
//! requests on the same route, a process-wide global lock blocks every route at
//! once, and an optional cap bounds the number of requests in flight. The
//! [`RestClient`] performs the HTTP call, feeds the response headers back into the
//! bucket and retries gateway errors and rate-limit responses.

pub mod client;
pub mod error;
pub mod ratelimit;
pub mod types;

pub use client::{RestClient, RestConfig};
pub use error::{HttpError, RateLimitError, RestError};
pub use ratelimit::{Bucket, CustomRateLimit, LockEpoch, RateLimiter};
pub use types::{ApiErrorMessage, GatewayBotResponse, GatewayResponse, SessionStartLimit, TooManyRequests};

// Re-exported so callers don't need a direct reqwest dependency for the method type
pub use reqwest::Method;
