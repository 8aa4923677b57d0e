//! Queue process configuration, read from `MAILQUEUE_*` environment variables.

use std::time::Duration;

use mailqueue_observability::LogFormat;

use crate::email_queue::DeliveryWorkerConfig;
use crate::tenant::{PostgresConnectionResolver, TENANT_PLACEHOLDER};

pub const ENV_DATABASE_URL_TEMPLATE: &str = "MAILQUEUE_DATABASE_URL_TEMPLATE";
pub const ENV_MAX_CONNECTIONS: &str = "MAILQUEUE_MAX_CONNECTIONS";
pub const ENV_WORKERS: &str = "MAILQUEUE_WORKERS";
pub const ENV_BATCH_SIZE: &str = "MAILQUEUE_BATCH_SIZE";
pub const ENV_POLL_INTERVAL_MS: &str = "MAILQUEUE_POLL_INTERVAL_MS";
pub const ENV_FETCH_TIMEOUT_MS: &str = "MAILQUEUE_FETCH_TIMEOUT_MS";
pub const ENV_LOG_FORMAT: &str = "MAILQUEUE_LOG_FORMAT";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: invalid value `{value}`: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} is not set")]
    Missing(&'static str),
}

/// Queue settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Tenant database URL with a `{tenant_id}` placeholder
    pub database_url_template: Option<String>,
    pub max_connections: u32,
    pub workers: usize,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub fetch_timeout: Duration,
    pub log_format: LogFormat,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let worker = DeliveryWorkerConfig::default();
        Self {
            database_url_template: None,
            max_connections: 5,
            workers: worker.workers,
            batch_size: worker.batch_size,
            poll_interval: worker.poll_interval,
            fetch_timeout: worker.fetch_timeout,
            log_format: LogFormat::Json,
        }
    }
}

impl QueueConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup; unset keys fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let database_url_template = match lookup(ENV_DATABASE_URL_TEMPLATE) {
            Some(template) if !template.trim().is_empty() => {
                if !template.contains(TENANT_PLACEHOLDER) {
                    return Err(ConfigError::Invalid {
                        key: ENV_DATABASE_URL_TEMPLATE,
                        value: template,
                        reason: format!("missing `{TENANT_PLACEHOLDER}` placeholder"),
                    });
                }
                Some(template)
            }
            _ => None,
        };

        let log_format = match lookup(ENV_LOG_FORMAT) {
            Some(raw) => raw.parse().map_err(|e: mailqueue_observability::UnknownLogFormat| {
                ConfigError::Invalid {
                    key: ENV_LOG_FORMAT,
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?,
            None => defaults.log_format,
        };

        Ok(Self {
            database_url_template,
            max_connections: positive(&lookup, ENV_MAX_CONNECTIONS, defaults.max_connections)?,
            workers: positive(&lookup, ENV_WORKERS, defaults.workers)?,
            batch_size: positive(&lookup, ENV_BATCH_SIZE, defaults.batch_size)?,
            poll_interval: millis(&lookup, ENV_POLL_INTERVAL_MS, defaults.poll_interval)?,
            fetch_timeout: millis(&lookup, ENV_FETCH_TIMEOUT_MS, defaults.fetch_timeout)?,
            log_format,
        })
    }

    /// Worker pool settings derived from this config.
    pub fn worker_config(&self, name: impl Into<String>) -> DeliveryWorkerConfig {
        DeliveryWorkerConfig {
            name: name.into(),
            workers: self.workers,
            batch_size: self.batch_size,
            poll_interval: self.poll_interval,
            fetch_timeout: self.fetch_timeout,
        }
    }

    /// Postgres resolver for the configured URL template.
    pub fn postgres_resolver(&self) -> Result<PostgresConnectionResolver, ConfigError> {
        let template = self
            .database_url_template
            .as_deref()
            .ok_or(ConfigError::Missing(ENV_DATABASE_URL_TEMPLATE))?;
        Ok(PostgresConnectionResolver::new(template, self.max_connections))
    }
}

fn positive<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let value: T = raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: raw.clone(),
        reason: e.to_string(),
    })?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: raw,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn millis<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    positive(lookup, key, default_ms).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = QueueConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, QueueConfig::default());
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.workers, 4);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.fetch_timeout, Duration::from_secs(10));
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(matches!(
            config.postgres_resolver(),
            Err(ConfigError::Missing(ENV_DATABASE_URL_TEMPLATE))
        ));
    }

    #[test]
    fn reads_overrides() {
        let config = QueueConfig::from_lookup(lookup(&[
            (ENV_DATABASE_URL_TEMPLATE, "postgres://mail@db/tenant_{tenant_id}"),
            (ENV_MAX_CONNECTIONS, "12"),
            (ENV_WORKERS, "8"),
            (ENV_BATCH_SIZE, "100"),
            (ENV_POLL_INTERVAL_MS, "250"),
            (ENV_FETCH_TIMEOUT_MS, "3000"),
            (ENV_LOG_FORMAT, "pretty"),
        ]))
        .unwrap();

        assert_eq!(config.max_connections, 12);
        assert_eq!(config.log_format, LogFormat::Pretty);

        let worker = config.worker_config("broadcasts");
        assert_eq!(worker.name, "broadcasts");
        assert_eq!(worker.workers, 8);
        assert_eq!(worker.batch_size, 100);
        assert_eq!(worker.poll_interval, Duration::from_millis(250));
        assert_eq!(worker.fetch_timeout, Duration::from_secs(3));
        assert!(config.postgres_resolver().is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let zero = QueueConfig::from_lookup(lookup(&[(ENV_WORKERS, "0")])).unwrap_err();
        assert!(matches!(zero, ConfigError::Invalid { key: ENV_WORKERS, .. }));

        let garbage = QueueConfig::from_lookup(lookup(&[(ENV_BATCH_SIZE, "lots")])).unwrap_err();
        assert!(matches!(garbage, ConfigError::Invalid { key: ENV_BATCH_SIZE, .. }));

        let template =
            QueueConfig::from_lookup(lookup(&[(ENV_DATABASE_URL_TEMPLATE, "postgres://db/mail")]))
                .unwrap_err();
        assert!(matches!(template, ConfigError::Invalid { key: ENV_DATABASE_URL_TEMPLATE, .. }));

        let format = QueueConfig::from_lookup(lookup(&[(ENV_LOG_FORMAT, "xml")])).unwrap_err();
        assert!(matches!(format, ConfigError::Invalid { key: ENV_LOG_FORMAT, .. }));
    }
}
