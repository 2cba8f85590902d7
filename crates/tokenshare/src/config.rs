//! Configuration for the shared token lifecycle.
//!
//! Every section can be deserialized (for example from a YAML or TOML file loaded by the
//! application) or assembled with the generated builders. Only the credentials and the two
//! provider URLs are required; everything else has a default.
use std::time::Duration;

use serde::Deserialize;
use typed_builder::TypedBuilder;
use url::Url;

use crate::{
    error::{Error, Result},
    retry::RetryPolicy,
};

/// Suffix of the key holding the distributed refresh lock.
pub const LOCK_SUFFIX: &str = "lock";

/// Client id and secret of this deployment. Loaded once, never mutated.
#[derive(Clone, Deserialize, veil::Redact)]
pub struct ClientCredentials {
    pub client_id: String,
    #[redact]
    pub client_secret: String,
}

impl ClientCredentials {
    #[must_use]
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

/// Top level configuration of a [`TokenManager`](crate::TokenManager).
#[derive(Debug, Clone, Deserialize, TypedBuilder)]
pub struct TokenConfig {
    pub credentials: ClientCredentials,
    /// Endpoint issuing a new token pair for the client credentials.
    pub create_token_url: Url,
    /// Endpoint exchanging a refresh token for a new token pair.
    pub refresh_token_url: Url,
    /// Minutes subtracted from the access token lifetime before caching it.
    #[builder(default = 1)]
    #[serde(default = "default_buffer")]
    pub access_token_buffer_minutes: u64,
    /// Days subtracted from the refresh token lifetime before caching it.
    #[builder(default = 1)]
    #[serde(default = "default_buffer")]
    pub refresh_token_buffer_days: u64,
    #[builder(default)]
    #[serde(default)]
    pub keys: KeyConfig,
    #[builder(default)]
    #[serde(default)]
    pub retry: RetryConfig,
    #[builder(default)]
    #[serde(default)]
    pub locking: LockConfig,
    #[builder(default)]
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Requests whose URL contains one of these fragments never get a token attached.
    #[builder(default = default_bypass_patterns())]
    #[serde(default = "default_bypass_patterns")]
    pub bypass_patterns: Vec<String>,
}

impl TokenConfig {
    /// Check the configuration for values the token lifecycle cannot work with.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        require_non_blank("credentials.client_id", &self.credentials.client_id)?;
        require_non_blank("credentials.client_secret", &self.credentials.client_secret)?;
        require_non_blank("keys.key_prefix", &self.keys.key_prefix)?;
        require_non_blank("keys.access_token_key", &self.keys.access_token_key)?;
        require_non_blank("keys.refresh_token_key", &self.keys.refresh_token_key)?;
        if self.keys.access_token_key == self.keys.refresh_token_key
            || self.keys.access_token_key == LOCK_SUFFIX
            || self.keys.refresh_token_key == LOCK_SUFFIX
        {
            return Err(Error::InvalidConfig(
                "keys.access_token_key, keys.refresh_token_key and the lock key must differ"
                    .to_string(),
            ));
        }
        require_min("access_token_buffer_minutes", self.access_token_buffer_minutes, 1)?;
        require_min("refresh_token_buffer_days", self.refresh_token_buffer_days, 1)?;
        require_min("retry.max_attempts", u64::from(self.retry.max_attempts), 1)?;
        require_min("retry.backoff_delay_ms", self.retry.backoff_delay_ms, 100)?;
        require_min("retry.max_backoff_delay_ms", self.retry.max_backoff_delay_ms, 1000)?;
        require_min("locking.lock_timeout_secs", self.locking.lock_timeout_secs, 1)?;
        require_min("locking.poll_interval_ms", self.locking.poll_interval_ms, 1)?;
        require_min(
            "schedule.access_token_interval_secs",
            self.schedule.access_token_interval_secs,
            1,
        )?;
        require_min(
            "schedule.refresh_token_interval_secs",
            self.schedule.refresh_token_interval_secs,
            1,
        )?;
        Ok(())
    }
}

/// Layout of the entries in the shared store.
#[derive(Debug, Clone, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct KeyConfig {
    #[builder(default = "vp:token:".to_string(), setter(into))]
    pub key_prefix: String,
    #[builder(default = "access_token".to_string(), setter(into))]
    pub access_token_key: String,
    #[builder(default = "refresh_token".to_string(), setter(into))]
    pub refresh_token_key: String,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl KeyConfig {
    #[must_use]
    pub fn access_token(&self) -> String {
        format!("{}{}", self.key_prefix, self.access_token_key)
    }

    #[must_use]
    pub fn refresh_token(&self) -> String {
        format!("{}{}", self.key_prefix, self.refresh_token_key)
    }

    #[must_use]
    pub fn lock(&self) -> String {
        format!("{}{LOCK_SUFFIX}", self.key_prefix)
    }
}

/// Retry policy applied to every call to the token provider.
#[derive(Debug, Clone, Copy, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct RetryConfig {
    #[builder(default = 3)]
    pub max_attempts: u32,
    #[builder(default = 1000)]
    pub backoff_delay_ms: u64,
    #[builder(default = 10_000)]
    pub max_backoff_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryConfig {
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.backoff_delay_ms),
            Duration::from_millis(self.max_backoff_delay_ms),
        )
    }
}

/// Timing of the distributed refresh lock.
///
/// `lock_timeout_secs` must exceed the worst case duration of one refresh, as the lock is
/// never renewed while held.
#[derive(Debug, Clone, Copy, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct LockConfig {
    #[builder(default = 30)]
    pub lock_timeout_secs: u64,
    /// Total time a non-holder waits for the holder to publish a token.
    #[builder(default = 10_000)]
    pub wait_timeout_ms: u64,
    #[builder(default = 500)]
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl LockConfig {
    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    #[must_use]
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Cadences of the [`RefreshScheduler`](crate::RefreshScheduler).
#[derive(Debug, Clone, Copy, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct ScheduleConfig {
    #[builder(default = 600)]
    pub access_token_interval_secs: u64,
    #[builder(default = 5 * 86_400)]
    pub refresh_token_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ScheduleConfig {
    #[must_use]
    pub fn access_token_interval(&self) -> Duration {
        Duration::from_secs(self.access_token_interval_secs)
    }

    #[must_use]
    pub fn refresh_token_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_token_interval_secs)
    }
}

fn default_buffer() -> u64 {
    1
}

fn default_bypass_patterns() -> Vec<String> {
    vec!["/v1/token/create".to_string(), "/v1/token/refresh".to_string()]
}

fn require_non_blank(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidConfig(format!("{field} must not be blank")));
    }
    Ok(())
}

fn require_min(field: &str, value: u64, min: u64) -> Result<()> {
    if value < min {
        return Err(Error::InvalidConfig(format!(
            "{field} must be at least {min}, got {value}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn config() -> TokenConfig {
        TokenConfig::builder()
            .credentials(ClientCredentials::new("my-client", "my-secret"))
            .create_token_url("https://idp.example.com/v1/token/create".parse().unwrap())
            .refresh_token_url("https://idp.example.com/v1/token/refresh".parse().unwrap())
            .build()
    }

    #[test]
    fn test_defaults() {
        let config = config();
        config.validate().unwrap();

        assert_eq!(config.keys.access_token(), "vp:token:access_token");
        assert_eq!(config.keys.refresh_token(), "vp:token:refresh_token");
        assert_eq!(config.keys.lock(), "vp:token:lock");
        assert_eq!(config.locking.lock_timeout(), Duration::from_secs(30));
        assert_eq!(config.locking.wait_timeout(), Duration::from_secs(10));
        assert_eq!(config.locking.poll_interval(), Duration::from_millis(500));
        assert_eq!(
            config.bypass_patterns,
            vec!["/v1/token/create", "/v1/token/refresh"]
        );
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: TokenConfig = serde_json::from_value(serde_json::json!({
            "credentials": {"client_id": "my-client", "client_secret": "my-secret"},
            "create_token_url": "https://idp.example.com/v1/token/create",
            "refresh_token_url": "https://idp.example.com/v1/token/refresh",
            "access_token_buffer_minutes": 2,
            "keys": {"key_prefix": "mbi:vp:token:"},
            "retry": {"max_attempts": 5}
        }))
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.access_token_buffer_minutes, 2);
        assert_eq!(config.refresh_token_buffer_days, 1);
        assert_eq!(config.keys.access_token(), "mbi:vp:token:access_token");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff_delay_ms, 1000);
        assert_eq!(config.schedule.refresh_token_interval_secs, 432_000);
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let mut config = config();
        config.retry.backoff_delay_ms = 10;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry.backoff_delay_ms"), "{err}");

        let mut config = self::config();
        config.credentials.client_secret = "  ".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("client_secret"), "{err}");

        let mut config = self::config();
        config.keys.refresh_token_key = "access_token".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_client_secret_is_redacted() {
        let credentials = ClientCredentials::new("my-client", "my-secret");
        let debug = format!("{credentials:?}");
        assert!(debug.contains("my-client"));
        assert!(!debug.contains("my-secret"));
    }
}
