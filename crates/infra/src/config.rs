//! Environment configuration for the scheduler and consumer processes.

use std::time::Duration;

use thiserror::Error;

use crate::consumer::ConsumerConfig;
use crate::pagination::DEFAULT_PAGE_SIZE;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },
}

/// Process configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Use Postgres (and Redis, when built with the `redis` feature) instead of
    /// in-memory backends.
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub campaigner_topic: String,
    pub send_email_topic: String,
    pub campaigner_group: String,
    pub concurrency: usize,
    pub max_in_flight: usize,
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
    pub page_size: usize,
    pub configuration_set_exists: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            use_persistent_stores: false,
            database_url: None,
            redis_url: "redis://localhost:6379".to_string(),
            campaigner_topic: "campaigner".to_string(),
            send_email_topic: "send_email".to_string(),
            campaigner_group: "campaigner".to_string(),
            concurrency: 20,
            max_in_flight: 200,
            visibility_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(250),
            page_size: DEFAULT_PAGE_SIZE,
            configuration_set_exists: false,
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let use_persistent_stores =
            parse_bool(&lookup, "USE_PERSISTENT_STORES")?.unwrap_or(false);
        let database_url = lookup("DATABASE_URL").filter(|v| !v.is_empty());
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        Ok(Self {
            use_persistent_stores,
            database_url,
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            campaigner_topic: lookup("CAMPAIGNER_TOPIC").unwrap_or(defaults.campaigner_topic),
            send_email_topic: lookup("SEND_EMAIL_TOPIC").unwrap_or(defaults.send_email_topic),
            campaigner_group: lookup("CAMPAIGNER_GROUP").unwrap_or(defaults.campaigner_group),
            concurrency: parse_positive(&lookup, "CAMPAIGNER_CONCURRENCY")?
                .unwrap_or(defaults.concurrency),
            max_in_flight: parse_positive(&lookup, "CAMPAIGNER_MAX_IN_FLIGHT")?
                .unwrap_or(defaults.max_in_flight),
            visibility_timeout: parse_positive(&lookup, "CAMPAIGNER_VISIBILITY_TIMEOUT_SECS")?
                .map(|s| Duration::from_secs(s as u64))
                .unwrap_or(defaults.visibility_timeout),
            poll_interval: parse_positive(&lookup, "CAMPAIGNER_POLL_INTERVAL_MS")?
                .map(|ms| Duration::from_millis(ms as u64))
                .unwrap_or(defaults.poll_interval),
            page_size: parse_positive(&lookup, "SUBSCRIBER_PAGE_SIZE")?
                .unwrap_or(defaults.page_size),
            configuration_set_exists: parse_bool(&lookup, "CONFIGURATION_SET_EXISTS")?
                .unwrap_or(defaults.configuration_set_exists),
        })
    }

    /// Pool settings derived from this configuration.
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig::default()
            .with_name("campaigner")
            .with_topic(&self.campaigner_topic, &self.campaigner_group)
            .with_concurrency(self.concurrency)
            .with_poll_interval(self.poll_interval)
    }
}

fn parse_bool<F>(lookup: &F, key: &'static str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(Some(true)),
            "0" | "false" | "no" | "" => Ok(Some(false)),
            _ => Err(ConfigError::Invalid { key, value: v }),
        },
    }
}

fn parse_positive<F>(lookup: &F, key: &'static str) -> Result<Option<usize>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(v) => match v.trim().parse::<usize>() {
            Ok(n) if n > 0 => Ok(Some(n)),
            _ => Err(ConfigError::Invalid { key, value: v }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<DispatchConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DispatchConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(config(&[]).unwrap(), DispatchConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = config(&[
            ("USE_PERSISTENT_STORES", "true"),
            ("DATABASE_URL", "postgres://localhost/campaigns"),
            ("CAMPAIGNER_CONCURRENCY", "4"),
            ("CAMPAIGNER_POLL_INTERVAL_MS", "50"),
            ("SEND_EMAIL_TOPIC", "outbound"),
        ])
        .unwrap();
        assert!(cfg.use_persistent_stores);
        assert_eq!(cfg.concurrency, 4);
        assert_eq!(cfg.poll_interval, Duration::from_millis(50));
        assert_eq!(cfg.send_email_topic, "outbound");

        let pool = cfg.consumer_config();
        assert_eq!(pool.concurrency, 4);
        assert_eq!(pool.topic, "campaigner");
    }

    #[test]
    fn persistent_stores_need_a_database() {
        assert_eq!(
            config(&[("USE_PERSISTENT_STORES", "1")]),
            Err(ConfigError::Missing("DATABASE_URL"))
        );
    }

    #[test]
    fn bad_numbers_are_reported_with_their_key() {
        assert_eq!(
            config(&[("SUBSCRIBER_PAGE_SIZE", "0")]),
            Err(ConfigError::Invalid {
                key: "SUBSCRIBER_PAGE_SIZE",
                value: "0".to_string()
            })
        );
        assert!(matches!(
            config(&[("CAMPAIGNER_MAX_IN_FLIGHT", "lots")]),
            Err(ConfigError::Invalid { key: "CAMPAIGNER_MAX_IN_FLIGHT", .. })
        ));
    }
}
