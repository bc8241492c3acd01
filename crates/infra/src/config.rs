//! Service configuration from environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// Unset means in-memory stores.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    /// Unset means in-memory stream and no hold event consumer.
    pub redis_url: Option<String>,
    pub hold_service_url: String,
    pub hold_service_timeout: Duration,
    pub outbox_batch_size: usize,
    pub outbox_interval: Duration,
    pub outbox_max_attempts: u32,
    pub transaction_stream_key: String,
    pub hold_events_stream_key: String,
    pub hold_events_group: String,
    pub hold_events_max_deliveries: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: None,
            database_max_connections: 10,
            redis_url: None,
            hold_service_url: "http://localhost:8081".to_string(),
            hold_service_timeout: Duration::from_millis(5000),
            outbox_batch_size: 50,
            outbox_interval: Duration::from_millis(1000),
            outbox_max_attempts: 5,
            transaction_stream_key: "creditx:transactions".to_string(),
            hold_events_stream_key: "creditx:holds".to_string(),
            hold_events_group: "creditx-main".to_string(),
            hold_events_max_deliveries: 5,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or blank keys keep their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        Ok(Self {
            bind_addr: parse_or(&get, "BIND_ADDR", defaults.bind_addr)?,
            database_url: get("DATABASE_URL"),
            database_max_connections: parse_or(
                &get,
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            redis_url: get("REDIS_URL"),
            hold_service_url: get("HOLD_SERVICE_URL").unwrap_or(defaults.hold_service_url),
            hold_service_timeout: millis_or(&get, "HOLD_SERVICE_TIMEOUT_MS", defaults.hold_service_timeout)?,
            outbox_batch_size: parse_or(&get, "OUTBOX_BATCH_SIZE", defaults.outbox_batch_size)?,
            outbox_interval: millis_or(&get, "OUTBOX_INTERVAL_MS", defaults.outbox_interval)?,
            outbox_max_attempts: parse_or(&get, "OUTBOX_MAX_ATTEMPTS", defaults.outbox_max_attempts)?,
            transaction_stream_key: get("TRANSACTION_STREAM_KEY")
                .unwrap_or(defaults.transaction_stream_key),
            hold_events_stream_key: get("HOLD_EVENTS_STREAM_KEY")
                .unwrap_or(defaults.hold_events_stream_key),
            hold_events_group: get("HOLD_EVENTS_GROUP").unwrap_or(defaults.hold_events_group),
            hold_events_max_deliveries: parse_or(
                &get,
                "HOLD_EVENTS_MAX_DELIVERIES",
                defaults.hold_events_max_deliveries,
            )?,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}

fn millis_or<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let millis: u64 = parse_or(get, key, default.as_millis() as u64)?;
    if millis == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: "0".to_string(),
            reason: "must be positive".to_string(),
        });
    }
    Ok(Duration::from_millis(millis))
}
