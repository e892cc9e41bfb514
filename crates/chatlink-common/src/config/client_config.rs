//! Client configuration structs
//!
//! Loads configuration from environment variables (and an optional `.env` file).

use serde::Deserialize;
use std::env;
use std::str::FromStr;

/// Main client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Bot token, sent verbatim in Identify/Resume and the `Authorization` header
    pub token: String,
    #[serde(default = "default_env")]
    pub env: Environment,
    pub gateway: GatewaySettings,
    pub rest: RestSettings,
}

/// Environment type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    #[must_use]
    pub fn is_development(&self) -> bool {
        matches!(self, Self::Development)
    }
}

/// Gateway connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    /// Skips `GET /gateway` when set
    pub url_override: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: u8,
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
    #[serde(default = "default_intents")]
    pub intents: u64,
    #[serde(default = "default_compress")]
    pub compress: bool,
    #[serde(default = "default_large_threshold")]
    pub large_threshold: u32,
    #[serde(default = "default_max_missed_acks")]
    pub max_missed_acks: u32,
    #[serde(default = "default_identify_interval_ms")]
    pub identify_interval_ms: u64,
}

/// REST client settings
#[derive(Debug, Clone, Deserialize)]
pub struct RestSettings {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 0 disables the in-flight cap
    #[serde(default)]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

// Default value functions
fn default_env() -> Environment {
    Environment::Development
}

fn default_api_version() -> u8 {
    10
}

fn default_shard_count() -> u32 {
    1
}

fn default_intents() -> u64 {
    // GUILDS | GUILD_MESSAGES
    (1 << 0) | (1 << 9)
}

fn default_compress() -> bool {
    true
}

fn default_large_threshold() -> u32 {
    250
}

fn default_max_missed_acks() -> u32 {
    1
}

fn default_identify_interval_ms() -> u64 {
    5_000
}

fn default_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    30
}

impl ClientConfig {
    /// Load configuration from environment variables
    ///
    /// # Errors
    /// Returns an error if a required variable is missing or a value fails to parse
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let token = lookup("CHATLINK_TOKEN")
            .filter(|t| !t.trim().is_empty())
            .ok_or(ConfigError::MissingVar("CHATLINK_TOKEN"))?;

        let env = lookup("APP_ENV")
            .and_then(|s| match s.to_lowercase().as_str() {
                "production" => Some(Environment::Production),
                "staging" => Some(Environment::Staging),
                "development" => Some(Environment::Development),
                _ => None,
            })
            .unwrap_or_default();

        let gateway = GatewaySettings {
            url_override: lookup("CHATLINK_GATEWAY_URL").filter(|s| !s.is_empty()),
            api_version: parse_or(&lookup, "CHATLINK_API_VERSION", default_api_version)?,
            shard_count: parse_or(&lookup, "CHATLINK_SHARD_COUNT", default_shard_count)?,
            intents: parse_or(&lookup, "CHATLINK_INTENTS", default_intents)?,
            compress: parse_or(&lookup, "CHATLINK_COMPRESS", default_compress)?,
            large_threshold: parse_or(&lookup, "CHATLINK_LARGE_THRESHOLD", default_large_threshold)?,
            max_missed_acks: parse_or(&lookup, "CHATLINK_MAX_MISSED_ACKS", default_max_missed_acks)?,
            identify_interval_ms: parse_or(
                &lookup,
                "CHATLINK_IDENTIFY_INTERVAL_MS",
                default_identify_interval_ms,
            )?,
        };

        let rest = RestSettings {
            api_base: lookup("CHATLINK_API_BASE").unwrap_or_else(default_api_base),
            max_retries: parse_or(&lookup, "CHATLINK_MAX_REST_RETRIES", default_max_retries)?,
            max_concurrent_requests: parse_or(&lookup, "CHATLINK_MAX_CONCURRENT_REQUESTS", || 0)?,
            timeout_secs: parse_or(&lookup, "CHATLINK_REST_TIMEOUT_SECS", default_timeout_secs)?,
        };

        Ok(Self {
            token,
            env,
            gateway,
            rest,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: fn() -> T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key, raw)),
        None => Ok(default()),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}
