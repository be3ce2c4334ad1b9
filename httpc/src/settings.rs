//! Deserializable client settings.
//!
//! ```toml
//! env = "prod"
//! base_url = "https://api.example.com"
//! timeout = "5s"
//! retry_on_statuses = [429, 503]
//!
//! [api_key]
//! key = "sekret"
//! in = "query"
//! name = "api_key"
//! ```

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;

use crate::auth::{ApiKeySettings, BasicSettings, Credentials, JwtSettings};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryConfig;
use crate::{HttpClientConfig, HttpClientConfigBuilder, HttpClientError, Result};

/// Deployment environment tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Development.
    #[default]
    Dev,
    /// Production.
    Prod,
}

/// Client settings as read from a configuration source.
///
/// Every key is optional and falls back to the client defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Environment tag, `dev` or `prod`.
    pub env: Environment,
    /// Base URL.
    pub base_url: String,
    /// Default call timeout.
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    /// Maximum idle connections per host.
    pub max_idle_conns: usize,
    /// Idle connection lifetime.
    #[serde(deserialize_with = "deserialize_duration")]
    pub idle_conn_timeout: Duration,
    /// Retry by default.
    pub retry_enabled: bool,
    /// Maximum attempts, the first included.
    pub retry_max_attempts: u32,
    /// Base backoff.
    #[serde(deserialize_with = "deserialize_duration")]
    pub retry_base_backoff: Duration,
    /// Backoff cap.
    #[serde(deserialize_with = "deserialize_duration")]
    pub retry_max_backoff: Duration,
    /// Retryable statuses.
    pub retry_on_statuses: Vec<u16>,
    /// Use the circuit breaker by default.
    pub breaker_enabled: bool,
    /// API key credentials.
    pub api_key: ApiKeySettings,
    /// Basic credentials.
    pub basic: BasicSettings,
    /// JWT credentials.
    pub jwt: JwtSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        let config = HttpClientConfig::default();
        let retry = RetryConfig::default();
        Self {
            env: Environment::default(),
            base_url: String::new(),
            timeout: config.timeout,
            max_idle_conns: config.pool_max_idle_per_host,
            idle_conn_timeout: config.pool_idle_timeout,
            retry_enabled: config.retry_enabled,
            retry_max_attempts: retry.max_attempts,
            retry_base_backoff: retry.base_backoff,
            retry_max_backoff: retry.max_backoff,
            retry_on_statuses: retry.retry_status_codes,
            breaker_enabled: config.breaker_enabled,
            api_key: ApiKeySettings::default(),
            basic: BasicSettings::default(),
            jwt: JwtSettings::default(),
        }
    }
}

impl ClientSettings {
    /// Parse settings from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| HttpClientError::Config(format!("TOML parse error: {e}")))
    }

    /// Load settings from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            HttpClientError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Credentials section.
    pub fn credentials(&self) -> Credentials {
        Credentials {
            api_key: self.api_key.clone(),
            basic: self.basic.clone(),
            jwt: self.jwt.clone(),
        }
    }

    /// Start a configuration builder from these settings.
    ///
    /// Zero counts and durations and an empty status list fall back to the
    /// client defaults.
    pub fn into_config(self) -> HttpClientConfigBuilder {
        let credentials = self.credentials();
        let config = HttpClientConfig::default();
        let defaults = RetryConfig::default();
        let retry = RetryConfig {
            max_attempts: nonzero(self.retry_max_attempts, defaults.max_attempts),
            base_backoff: nonzero(self.retry_base_backoff, defaults.base_backoff),
            max_backoff: nonzero(self.retry_max_backoff, defaults.max_backoff),
            retry_status_codes: if self.retry_on_statuses.is_empty() {
                defaults.retry_status_codes
            } else {
                self.retry_on_statuses
            },
            ..defaults
        };

        let mut builder = HttpClientConfig::builder()
            .environment(self.env)
            .timeout(self.timeout)
            .pool_max_idle_per_host(nonzero(self.max_idle_conns, config.pool_max_idle_per_host))
            .pool_idle_timeout(nonzero(self.idle_conn_timeout, config.pool_idle_timeout))
            .retry(retry)
            .retry_enabled(self.retry_enabled)
            .circuit_breaker(CircuitBreakerConfig::default())
            .breaker_enabled(self.breaker_enabled)
            .credentials(credentials);
        if !self.base_url.is_empty() {
            builder = builder.base_url(self.base_url);
        }
        builder
    }
}

fn nonzero<T: Default + PartialEq>(value: T, fallback: T) -> T {
    if value == T::default() { fallback } else { value }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationRepr {
    Millis(u64),
    Text(String),
}

/// Deserialize a duration from integer milliseconds or a string such as
/// `"250ms"`, `"1.5s"`, `"2m"` or `"1h"`.
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match DurationRepr::deserialize(deserializer)? {
        DurationRepr::Millis(ms) => Ok(Duration::from_millis(ms)),
        DurationRepr::Text(text) => parse_duration(&text).map_err(D::Error::custom),
    }
}

/// Parse a duration string; a bare number is milliseconds.
pub fn parse_duration(text: &str) -> std::result::Result<Duration, String> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration {text:?}"))?;
    let seconds = match unit.trim() {
        "" | "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("unknown duration unit {other:?} in {text:?}")),
    };
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("invalid duration {text:?}: {e}"))
}
