//! REST client

mod executor;

use crate::error::RestError;
use crate::ratelimit::RateLimiter;
use crate::types::{GatewayBotResponse, GatewayResponse};
use chatlink_common::RestSettings;
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Settings for [`RestClient`]
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Base URL that relative paths are joined onto, without a trailing slash
    pub api_base: String,
    /// Sent verbatim as the `Authorization` header
    pub token: String,
    /// Total attempts for 502/504 and transport failures; rate-limit responses don't count
    pub max_retries: u32,
    /// 0 disables the cap
    pub max_concurrent_requests: usize,
    pub timeout: Duration,
    pub user_agent: String,
}

impl RestConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            api_base: "https://discord.com/api/v10".to_string(),
            token: token.into(),
            max_retries: 3,
            max_concurrent_requests: 0,
            timeout: Duration::from_secs(30),
            user_agent: default_user_agent(),
        }
    }

    pub fn from_settings(token: impl Into<String>, settings: &RestSettings) -> Self {
        Self {
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            max_retries: settings.max_retries,
            max_concurrent_requests: settings.max_concurrent_requests,
            timeout: Duration::from_secs(settings.timeout_secs),
            ..Self::new(token)
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

fn default_user_agent() -> String {
    format!("DiscordBot (chatlink, {})", env!("CARGO_PKG_VERSION"))
}

/// HTTP client whose every call is gated by a shared [`RateLimiter`]
///
/// Cheap to clone; clones share the connection pool and the buckets.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    ratelimiter: Arc<RateLimiter>,
    config: Arc<RestConfig>,
}

impl RestClient {
    pub fn new(config: RestConfig) -> Result<Self, RestError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        let ratelimiter = Arc::new(RateLimiter::with_max_concurrent_requests(
            config.max_concurrent_requests,
        ));

        Ok(Self {
            http,
            ratelimiter,
            config: Arc::new(config),
        })
    }

    #[must_use]
    pub fn ratelimiter(&self) -> &Arc<RateLimiter> {
        &self.ratelimiter
    }

    #[must_use]
    pub fn config(&self) -> &RestConfig {
        &self.config
    }

    /// Absolute URL for `path`; absolute URLs pass through unchanged
    #[must_use]
    pub fn endpoint(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let path = path.strip_prefix('/').unwrap_or(path);
        format!("{}/{}", self.config.api_base, path)
    }

    /// Resolve the gateway URL, always ending in `/`
    #[instrument(skip(self))]
    pub async fn gateway(&self) -> Result<String, RestError> {
        let resp: GatewayResponse = self.request_json(Method::GET, "/gateway", None).await?;
        Ok(with_trailing_slash(resp.url))
    }

    /// Gateway URL plus the recommended shard count
    #[instrument(skip(self))]
    pub async fn gateway_bot(&self) -> Result<GatewayBotResponse, RestError> {
        let mut resp: GatewayBotResponse = self.request_json(Method::GET, "/gateway/bot", None).await?;
        resp.url = with_trailing_slash(resp.url);
        Ok(resp)
    }
}

fn with_trailing_slash(mut url: String) -> String {
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}

/// Route key used when the caller doesn't supply one: the URL without its query string
#[must_use]
pub fn default_bucket_id(url: &str) -> &str {
    url.split_once('?').map_or(url, |(path, _)| path)
}
