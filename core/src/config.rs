//! Backbone configuration.
//!
//! Everything a producing or consuming service needs to reach the broker and
//! stamp its envelopes, loadable from environment variables.
//!
//! | Variable                   | Default              |
//! |----------------------------|----------------------|
//! | `KAFKA_BROKERS`            | `localhost:9092`     |
//! | `KAFKA_CLIENT_ID`          | `commerce-events`    |
//! | `SERVICE_NAME`             | required             |
//! | `SERVICE_VERSION`          | `1.0.0`              |
//! | `KAFKA_GROUP_ID`           | `{SERVICE_NAME}-group` |
//! | `KAFKA_FROM_BEGINNING`     | `false`              |
//! | `KAFKA_AUTO_COMMIT`        | `true`               |
//! | `KAFKA_TOPIC_PREFIX`       | none                 |
//! | `KAFKA_TRANSACTIONAL_ID`   | none                 |
//! | `EVENT_MAX_RETRIES`        | `3`                  |
//! | `EVENT_RETRY_DELAY_MS`     | `1000`               |
//! | `EVENT_RETRY_MAX_DELAY_MS` | `30000`              |
//! | `EVENT_RETRY_BACKOFF`      | `exponential`        |
//!
//! # Example
//!
//! ```no_run
//! use commerce_events_core::config::BackboneConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BackboneConfig::from_env()?;
//! println!("brokers: {}", config.brokers);
//! # Ok(())
//! # }
//! ```

use crate::factory::FactoryConfig;
use crate::topic::TopicRegistry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Configuration error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required environment variable not set
    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    /// Environment variable present but unparseable
    #[error("Invalid value for {key}: {value}")]
    InvalidValue {
        /// Variable name
        key: String,
        /// Offending value
        value: String,
    },

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// How the delay between handler retries grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Same delay before every retry
    Constant,
    /// Delay doubles with every retry
    Exponential,
}

impl FromStr for BackoffKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "constant" | "fixed" => Ok(Self::Constant),
            "exponential" | "exp" => Ok(Self::Exponential),
            other => Err(ConfigError::InvalidValue {
                key: "EVENT_RETRY_BACKOFF".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for BackoffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant => write!(f, "constant"),
            Self::Exponential => write!(f, "exponential"),
        }
    }
}

/// Handler retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries after the first attempt before dead-lettering
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds
    pub delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds
    pub max_delay_ms: u64,
    /// Growth of the delay
    pub backoff: BackoffKind,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff: BackoffKind::Exponential,
        }
    }
}

/// Broker, identity, and retry configuration for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackboneConfig {
    /// Comma-separated bootstrap servers
    pub brokers: String,
    /// Client id reported to the broker
    pub client_id: String,
    /// Identity stamped into produced envelopes
    pub service: FactoryConfig,
    /// Consumer group id
    pub group_id: String,
    /// Whether a new group starts at the earliest retained offset
    pub from_beginning: bool,
    /// Whether the consumer commits offsets after each processed record
    pub auto_commit: bool,
    /// Environment-isolation prefix for topic names
    pub topic_prefix: Option<String>,
    /// Transactional id; required for transactional publishing
    pub transactional_id: Option<String>,
    /// Handler retry settings
    pub retry: RetrySettings,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        let service = FactoryConfig::default();
        Self {
            brokers: "localhost:9092".to_string(),
            client_id: "commerce-events".to_string(),
            group_id: format!("{}-group", service.service_name),
            service,
            from_beginning: false,
            auto_commit: true,
            topic_prefix: None,
            transactional_id: None,
            retry: RetrySettings::default(),
        }
    }
}

impl BackboneConfig {
    /// Load configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EnvVarNotSet`] if `SERVICE_NAME` is missing,
    /// [`ConfigError::InvalidValue`] for unparseable values, and
    /// [`ConfigError::ValidationError`] if the result is inconsistent.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let service_name =
            get("SERVICE_NAME").ok_or_else(|| ConfigError::EnvVarNotSet("SERVICE_NAME".to_string()))?;
        let defaults = Self::default();

        let config = Self {
            brokers: get("KAFKA_BROKERS").unwrap_or(defaults.brokers),
            client_id: get("KAFKA_CLIENT_ID").unwrap_or(defaults.client_id),
            group_id: get("KAFKA_GROUP_ID").unwrap_or_else(|| format!("{service_name}-group")),
            service: FactoryConfig::new(
                service_name,
                get("SERVICE_VERSION").unwrap_or(defaults.service.version),
            ),
            from_beginning: parse_or("KAFKA_FROM_BEGINNING", get("KAFKA_FROM_BEGINNING"), false)?,
            auto_commit: parse_or("KAFKA_AUTO_COMMIT", get("KAFKA_AUTO_COMMIT"), true)?,
            topic_prefix: get("KAFKA_TOPIC_PREFIX"),
            transactional_id: get("KAFKA_TRANSACTIONAL_ID"),
            retry: RetrySettings {
                max_retries: parse_or(
                    "EVENT_MAX_RETRIES",
                    get("EVENT_MAX_RETRIES"),
                    defaults.retry.max_retries,
                )?,
                delay_ms: parse_or(
                    "EVENT_RETRY_DELAY_MS",
                    get("EVENT_RETRY_DELAY_MS"),
                    defaults.retry.delay_ms,
                )?,
                max_delay_ms: parse_or(
                    "EVENT_RETRY_MAX_DELAY_MS",
                    get("EVENT_RETRY_MAX_DELAY_MS"),
                    defaults.retry.max_delay_ms,
                )?,
                backoff: get("EVENT_RETRY_BACKOFF")
                    .map(|value| value.parse::<BackoffKind>())
                    .transpose()?
                    .unwrap_or(defaults.retry.backoff),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for inconsistencies.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.trim().is_empty() {
            return Err(ConfigError::ValidationError("brokers cannot be empty".to_string()));
        }
        if self.service.service_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "service name cannot be empty".to_string(),
            ));
        }
        if self.group_id.trim().is_empty() {
            return Err(ConfigError::ValidationError("group id cannot be empty".to_string()));
        }
        if self.retry.max_delay_ms < self.retry.delay_ms {
            return Err(ConfigError::ValidationError(format!(
                "retry max delay ({}ms) is shorter than the base delay ({}ms)",
                self.retry.max_delay_ms, self.retry.delay_ms
            )));
        }
        Ok(())
    }

    /// Topic registry honouring the configured prefix.
    #[must_use]
    pub fn topics(&self) -> TopicRegistry {
        self.topic_prefix
            .as_deref()
            .map_or_else(TopicRegistry::new, TopicRegistry::with_prefix)
    }
}

fn parse_or<T: FromStr>(key: &str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test assertions
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn service_name_is_required() {
        assert_eq!(
            BackboneConfig::from_lookup(lookup(&[])),
            Err(ConfigError::EnvVarNotSet("SERVICE_NAME".to_string()))
        );
    }

    #[test]
    fn defaults_fill_everything_else() {
        let config = BackboneConfig::from_lookup(lookup(&[("SERVICE_NAME", "order-service")]))
            .unwrap();
        assert_eq!(config.brokers, "localhost:9092");
        assert_eq!(config.group_id, "order-service-group");
        assert_eq!(config.service.version, "1.0.0");
        assert!(!config.from_beginning);
        assert!(config.auto_commit);
        assert_eq!(config.retry, RetrySettings::default());
        assert_eq!(config.topics(), TopicRegistry::new());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = BackboneConfig::from_lookup(lookup(&[
            ("SERVICE_NAME", "cart-service"),
            ("KAFKA_BROKERS", "a:9092,b:9092"),
            ("KAFKA_FROM_BEGINNING", "true"),
            ("KAFKA_AUTO_COMMIT", "false"),
            ("KAFKA_TOPIC_PREFIX", "staging"),
            ("EVENT_MAX_RETRIES", "5"),
            ("EVENT_RETRY_BACKOFF", "constant"),
        ]))
        .unwrap();
        assert_eq!(config.brokers, "a:9092,b:9092");
        assert!(config.from_beginning);
        assert!(!config.auto_commit);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.backoff, BackoffKind::Constant);
        assert_eq!(
            config.topics().resolve("CartAbandoned"),
            "staging.cart-events"
        );
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = BackboneConfig::from_lookup(lookup(&[
            ("SERVICE_NAME", "svc"),
            ("EVENT_MAX_RETRIES", "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "EVENT_MAX_RETRIES"));
    }

    #[test]
    fn inconsistent_delays_fail_validation() {
        let err = BackboneConfig::from_lookup(lookup(&[
            ("SERVICE_NAME", "svc"),
            ("EVENT_RETRY_DELAY_MS", "5000"),
            ("EVENT_RETRY_MAX_DELAY_MS", "100"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }
}
