//! Request execution and the retry loop

use super::{default_bucket_id, RestClient};
use crate::error::{HttpError, RestError};
use crate::ratelimit::{Bucket, LockEpoch};
use crate::types::TooManyRequests;
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

/// Result of a single HTTP attempt
enum Attempt {
    Done(Vec<u8>),
    /// Slept out a 429; try again without spending the retry budget
    RateLimited,
    Retry(RestError),
    Fail(RestError),
}

impl RestClient {
    /// Perform a request keyed by the URL without its query string
    pub async fn request(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Vec<u8>, RestError> {
        self.request_with_bucket_id(method, url, body, "").await
    }

    /// Perform a request on an explicit route key; an empty key falls back to the URL
    pub async fn request_with_bucket_id(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        bucket_id: &str,
    ) -> Result<Vec<u8>, RestError> {
        let url = self.endpoint(url);
        let body = body.map(serde_json::to_vec).transpose()?;
        let bucket_id = if bucket_id.is_empty() {
            default_bucket_id(&url)
        } else {
            bucket_id
        };

        self.execute(method, &url, body.as_deref(), bucket_id).await
    }

    /// Perform a request and decode the JSON response
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<T, RestError> {
        let bytes = self.request(method, url, body).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        body: Option<&[u8]>,
        bucket_id: &str,
    ) -> Result<Vec<u8>, RestError> {
        let bucket = self.ratelimiter.get_bucket(bucket_id);
        let max_attempts = self.config.max_retries.max(1);
        let mut failures: u32 = 0;

        loop {
            match self.attempt(&method, url, body, &bucket).await {
                Attempt::Done(bytes) => return Ok(bytes),
                Attempt::Fail(err) => return Err(err),
                Attempt::RateLimited => failures = 0,
                Attempt::Retry(err) => {
                    failures += 1;
                    if failures >= max_attempts {
                        return Err(err);
                    }
                    let delay = Duration::from_secs(u64::from(failures - 1));
                    warn!(%method, url, attempt = failures, delay_secs = delay.as_secs(), error = %err, "Request failed, retrying");
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
            }
        }
    }

    async fn attempt(&self, method: &Method, url: &str, body: Option<&[u8]>, bucket: &Bucket) -> Attempt {
        let epoch = self.ratelimiter.lock_bucket_object(bucket).await;
        let guard = ReleaseGuard { bucket, epoch };

        debug!(%method, url, bucket = %bucket.key(), "Sending request");

        let mut req = self
            .http
            .request(method.clone(), url)
            .header(AUTHORIZATION, &self.config.token)
            .header(USER_AGENT, &self.config.user_agent);
        if let Some(body) = body {
            req = req.header(CONTENT_TYPE, "application/json").body(body.to_vec());
        }

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => return Attempt::Retry(e.into()),
        };

        let status = resp.status();
        let headers = resp.headers().clone();
        if let Err(e) = bucket.release(Some(&headers), epoch) {
            warn!(bucket = %bucket.key(), error = %e, "Failed to update rate limit bucket");
        }
        drop(guard);

        let bytes = match resp.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => return Attempt::Retry(e.into()),
        };

        if status.is_success() {
            return Attempt::Done(bytes);
        }

        match status {
            StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT => {
                Attempt::Retry(HttpError::new(method.clone(), url, status, headers, bytes).into())
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let Some(rl) = parse_too_many_requests(&bytes, &headers) else {
                    warn!(url, body = %String::from_utf8_lossy(&bytes), "Unreadable rate limit response");
                    return Attempt::Fail(HttpError::new(method.clone(), url, status, headers, bytes).into());
                };

                let wait = rl.retry_after_dur();
                if rl.global {
                    self.ratelimiter.set_global_until(Instant::now() + wait);
                }
                info!(
                    url,
                    bucket = %bucket.key(),
                    global = rl.global,
                    retry_after_ms = wait.as_millis() as u64,
                    "Rate limited"
                );
                sleep(wait).await;
                Attempt::RateLimited
            }
            _ => Attempt::Fail(HttpError::new(method.clone(), url, status, headers, bytes).into()),
        }
    }
}

/// Releases without headers if the attempt ends before a response arrives
struct ReleaseGuard<'a> {
    bucket: &'a Bucket,
    epoch: LockEpoch,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        // A no-op when the response headers were already applied
        let _ = self.bucket.release(None, self.epoch);
    }
}

/// Decode a 429 body, falling back to the `Retry-After` header
fn parse_too_many_requests(body: &[u8], headers: &HeaderMap) -> Option<TooManyRequests> {
    if let Ok(rl) = serde_json::from_slice::<TooManyRequests>(body) {
        return Some(rl);
    }

    let retry_after = headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()?;

    Some(TooManyRequests {
        message: String::new(),
        retry_after,
        global: headers.contains_key("x-ratelimit-global"),
    })
}
