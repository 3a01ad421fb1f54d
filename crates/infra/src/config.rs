//! Runtime configuration from environment variables.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::coordinator::DEFAULT_MAX_ATTEMPTS;
use crate::publisher::PublishPolicy;

pub const DEFAULT_EXPIRY_WINDOW_SECS: u64 = 15 * 60;
pub const DEFAULT_EXPIRY_DEADLINE_SECS: u64 = 30;
pub const DEFAULT_PUBLISH_ATTEMPTS: u32 = 3;
pub const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_TOPIC: &str = "payrecon:invoice-events";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key} must be a positive integer, got '{value}'")]
    InvalidNumber { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileConfig {
    pub max_attempts: u32,
    pub expiry_window: Duration,
    pub expiry_deadline: Duration,
    pub publish_attempts: u32,
    pub publish_timeout: Duration,
    pub topic: String,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            expiry_window: Duration::from_secs(DEFAULT_EXPIRY_WINDOW_SECS),
            expiry_deadline: Duration::from_secs(DEFAULT_EXPIRY_DEADLINE_SECS),
            publish_attempts: DEFAULT_PUBLISH_ATTEMPTS,
            publish_timeout: Duration::from_millis(DEFAULT_PUBLISH_TIMEOUT_MS),
            topic: DEFAULT_TOPIC.to_string(),
            database_url: None,
            redis_url: None,
        }
    }
}

impl ReconcileConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys fall back to defaults with a warning.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_attempts = number(&lookup, "PAYRECON_MAX_ATTEMPTS", u64::from(DEFAULT_MAX_ATTEMPTS))?;
        let window_secs = number(&lookup, "PAYRECON_EXPIRY_WINDOW_SECS", DEFAULT_EXPIRY_WINDOW_SECS)?;
        let deadline_secs =
            number(&lookup, "PAYRECON_EXPIRY_DEADLINE_SECS", DEFAULT_EXPIRY_DEADLINE_SECS)?;
        let publish_attempts = number(
            &lookup,
            "PAYRECON_PUBLISH_ATTEMPTS",
            u64::from(DEFAULT_PUBLISH_ATTEMPTS),
        )?;
        let publish_timeout_ms =
            number(&lookup, "PAYRECON_PUBLISH_TIMEOUT_MS", DEFAULT_PUBLISH_TIMEOUT_MS)?;

        let topic = lookup("PAYRECON_TOPIC")
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| {
                warn!(default = DEFAULT_TOPIC, "PAYRECON_TOPIC not set; using default");
                defaults.topic.clone()
            });

        let database_url = lookup("DATABASE_URL").filter(|v| !v.is_empty());
        if database_url.is_none() {
            warn!("DATABASE_URL not set; only the in-memory invoice store is available");
        }
        let redis_url = lookup("REDIS_URL").filter(|v| !v.is_empty());

        Ok(Self {
            max_attempts: to_u32("PAYRECON_MAX_ATTEMPTS", max_attempts)?,
            expiry_window: Duration::from_secs(window_secs),
            expiry_deadline: Duration::from_secs(deadline_secs),
            publish_attempts: to_u32("PAYRECON_PUBLISH_ATTEMPTS", publish_attempts)?,
            publish_timeout: Duration::from_millis(publish_timeout_ms),
            topic,
            database_url,
            redis_url,
        })
    }

    pub fn publish_policy(&self) -> PublishPolicy {
        PublishPolicy::default()
            .with_max_attempts(self.publish_attempts)
            .with_attempt_timeout(self.publish_timeout)
    }

    /// Expiry window as a calendar duration for `Invoice::open`.
    pub fn expiry_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.expiry_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_EXPIRY_WINDOW_SECS as i64))
    }
}

fn number<F>(lookup: &F, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        warn!(key, default, "not set; using default");
        return Ok(default);
    };
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(ConfigError::InvalidNumber { key, value: raw }),
    }
}

fn to_u32(key: &'static str, value: u64) -> Result<u32, ConfigError> {
    u32::try_from(value).map_err(|_| ConfigError::InvalidNumber {
        key,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = ReconcileConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ReconcileConfig::default());
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.expiry_window(), chrono::Duration::minutes(15));
        assert_eq!(config.topic, "payrecon:invoice-events");
    }

    #[test]
    fn overrides_are_applied() {
        let config = ReconcileConfig::from_lookup(lookup(&[
            ("PAYRECON_MAX_ATTEMPTS", "8"),
            ("PAYRECON_EXPIRY_WINDOW_SECS", "60"),
            ("PAYRECON_PUBLISH_TIMEOUT_MS", "250"),
            ("PAYRECON_TOPIC", "billing"),
            ("REDIS_URL", "redis://cache:6379"),
        ]))
        .unwrap();
        assert_eq!(config.max_attempts, 8);
        assert_eq!(config.expiry_window, Duration::from_secs(60));
        assert_eq!(config.publish_policy().attempt_timeout, Duration::from_millis(250));
        assert_eq!(config.topic, "billing");
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.database_url, None);
    }

    #[test]
    fn invalid_numbers_are_errors() {
        for bad in ["abc", "0", "-3"] {
            let err = ReconcileConfig::from_lookup(lookup(&[("PAYRECON_PUBLISH_ATTEMPTS", bad)]))
                .unwrap_err();
            assert_eq!(
                err,
                ConfigError::InvalidNumber {
                    key: "PAYRECON_PUBLISH_ATTEMPTS",
                    value: bad.to_string(),
                }
            );
        }
    }
}
