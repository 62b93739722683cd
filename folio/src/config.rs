//! Typed configuration for the engine. Every knob the environment exposes
//! lands in one of these structs at startup; unparseable values are rejected
//! instead of silently defaulted. Binaries call [`AppConfig::from_env`] once
//! and pass the result into the service container.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::batch::BatchConfig;
use crate::error::{Error, Result};
use crate::external::breaker::BreakerConfig;
use crate::external::retry::RetryConfig;
use crate::processor::{NotFoundPolicy, ProcessorConfig};

/// Postgres connection and pool settings.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub pool_size: usize,
    pub connect_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "folio".to_string(),
            password: String::new(),
            dbname: "folio".to_string(),
            pool_size: 16,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Per-prefix cache lifetimes; the prefixes themselves live in the TTL
/// table.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    pub external_ttl: Duration,
    pub stats_ttl: Duration,
    pub summary_ttl: Duration,
    pub entity_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            external_ttl: Duration::from_secs(2 * 3600),
            stats_ttl: Duration::from_secs(300),
            summary_ttl: Duration::from_secs(30),
            entity_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Everything a binary needs to assemble the service.
#[derive(Clone, Debug, Default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub processor: ProcessorConfig,
    pub batch: BatchConfig,
    pub portfolio_service_url: Option<String>,
    pub security_service_url: Option<String>,
}

fn var<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| Error::Config(format!("{key}={raw}: {e}"))),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(Error::Config(format!("{key}: {err}"))),
    }
}

fn var_ms(key: &str, default: Duration) -> Result<Duration> {
    var(key, default.as_millis() as u64).map(Duration::from_millis)
}

fn var_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let store = StoreConfig {
            host: var("FOLIO_DB_HOST", "localhost".to_string())?,
            port: var("FOLIO_DB_PORT", 5432)?,
            user: var("FOLIO_DB_USER", "folio".to_string())?,
            password: var("FOLIO_DB_PASSWORD", String::new())?,
            dbname: var("FOLIO_DB_NAME", "folio".to_string())?,
            pool_size: var("FOLIO_DB_POOL_SIZE", 16)?,
            connect_timeout: var_ms("FOLIO_DB_CONNECT_TIMEOUT_MS", Duration::from_secs(5))?,
        };

        let cache_defaults = CacheConfig::default();
        let cache = CacheConfig {
            default_ttl: var_ms("FOLIO_CACHE_DEFAULT_TTL_MS", cache_defaults.default_ttl)?,
            external_ttl: var_ms("FOLIO_CACHE_EXTERNAL_TTL_MS", cache_defaults.external_ttl)?,
            stats_ttl: var_ms("FOLIO_CACHE_STATS_TTL_MS", cache_defaults.stats_ttl)?,
            summary_ttl: var_ms("FOLIO_CACHE_SUMMARY_TTL_MS", cache_defaults.summary_ttl)?,
            entity_ttl: var_ms("FOLIO_CACHE_ENTITY_TTL_MS", cache_defaults.entity_ttl)?,
            sweep_interval: var_ms("FOLIO_CACHE_SWEEP_INTERVAL_MS", cache_defaults.sweep_interval)?,
        };

        let retry_defaults = RetryConfig::default();
        let retry = RetryConfig {
            max_attempts: var("FOLIO_RETRY_MAX_ATTEMPTS", retry_defaults.max_attempts)?,
            initial_interval: var_ms(
                "FOLIO_RETRY_INITIAL_INTERVAL_MS",
                retry_defaults.initial_interval,
            )?,
            max_interval: var_ms("FOLIO_RETRY_MAX_INTERVAL_MS", retry_defaults.max_interval)?,
            multiplier: var("FOLIO_RETRY_BACKOFF_FACTOR", retry_defaults.multiplier)?,
            jitter: var("FOLIO_RETRY_JITTER", retry_defaults.jitter)?,
        };

        let breaker_defaults = BreakerConfig::default();
        let breaker = BreakerConfig {
            failure_threshold: var(
                "FOLIO_BREAKER_FAILURE_THRESHOLD",
                breaker_defaults.failure_threshold,
            )?,
            success_threshold: var(
                "FOLIO_BREAKER_SUCCESS_THRESHOLD",
                breaker_defaults.success_threshold,
            )?,
            max_requests: var("FOLIO_BREAKER_MAX_REQUESTS", breaker_defaults.max_requests)?,
            interval: var_ms("FOLIO_BREAKER_INTERVAL_MS", breaker_defaults.interval)?,
            timeout: var_ms("FOLIO_BREAKER_TIMEOUT_MS", breaker_defaults.timeout)?,
        };

        let processor_defaults = ProcessorConfig::default();
        let not_found_policy = match var("FOLIO_NOT_FOUND_POLICY", "error".to_string())?.as_str() {
            "error" => NotFoundPolicy::Error,
            "fatal" => NotFoundPolicy::Fatal,
            other => {
                return Err(Error::Config(format!(
                    "FOLIO_NOT_FOUND_POLICY={other}: expected error or fatal"
                )))
            }
        };
        let processor = ProcessorConfig {
            max_retries: var("FOLIO_MAX_RETRIES", processor_defaults.max_retries)?,
            not_found_policy,
        };

        let batch_defaults = BatchConfig::default();
        let batch = BatchConfig {
            max_batch_size: var("FOLIO_MAX_BATCH_SIZE", batch_defaults.max_batch_size)?,
            sort_run_size: var("FOLIO_SORT_RUN_SIZE", batch_defaults.sort_run_size)?,
        };

        Ok(Self {
            store,
            cache,
            retry,
            breaker,
            processor,
            batch,
            portfolio_service_url: var_opt("FOLIO_PORTFOLIO_SERVICE_URL"),
            security_service_url: var_opt("FOLIO_SECURITY_SERVICE_URL"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::AppConfig;

    #[test]
    fn test_that_defaults_stand_in_for_missing_environment() {
        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.store.port, 5432);
        assert_eq!(config.processor.max_retries, 3);
        assert_eq!(config.retry.multiplier, 2.0);
    }
}
