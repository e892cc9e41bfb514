//! REST error types

use crate::types::ApiErrorMessage;
use reqwest::{header::HeaderMap, Method, StatusCode};
use std::fmt;

/// Errors surfaced by [`crate::RestClient`]
#[derive(Debug, thiserror::Error)]
pub enum RestError {
    /// Terminal non-2xx response, or the last 502/504 once retries ran out
    #[error(transparent)]
    Http(Box<HttpError>),

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Rate limit error: {0}")]
    RateLimit(#[from] RateLimitError),
}

impl RestError {
    /// Status code of an HTTP error, if this is one
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Http(e) => Some(e.status),
            Self::Transport(e) => e.status(),
            _ => None,
        }
    }
}

impl From<HttpError> for RestError {
    fn from(err: HttpError) -> Self {
        Self::Http(Box::new(err))
    }
}

/// Diagnostics for an HTTP response the client gave up on
#[derive(Debug, Clone)]
pub struct HttpError {
    pub method: Method,
    pub url: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Decoded `{code, message}` body, when it parses
    pub message: Option<ApiErrorMessage>,
}

impl HttpError {
    pub(crate) fn new(method: Method, url: &str, status: StatusCode, headers: HeaderMap, body: Vec<u8>) -> Self {
        let message = serde_json::from_slice::<ApiErrorMessage>(&body).ok();
        Self {
            method,
            url: url.to_string(),
            status,
            headers,
            body,
            message,
        }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(
                f,
                "HTTP {} on {} {}: {} (code {})",
                self.status, self.method, self.url, msg.message, msg.code
            ),
            None => write!(
                f,
                "HTTP {} on {} {}: {}",
                self.status,
                self.method,
                self.url,
                String::from_utf8_lossy(&self.body)
            ),
        }
    }
}

impl std::error::Error for HttpError {}

/// Errors updating bucket state from response headers
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("Invalid {name} header value: {value:?}")]
    InvalidHeader { name: &'static str, value: String },
}
