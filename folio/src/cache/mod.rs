//! Cache layer. Keys are hierarchical (`balance:portfolio:<p>:security:<s>`)
//! and each prefix carries its own TTL, so callers never pick lifetimes
//! inline. Backends are interchangeable behind the [`Cache`] trait; the
//! cache-aside helper never fails a read because a cache write failed.

pub mod memory;
pub mod noop;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::CacheConfig;
use crate::error::Result;
use crate::types::{BalanceId, TransactionId};

/// Key builders for the whole keyspace. Everything that writes a balance
/// invalidates through [`invalidate_portfolio`] so the set stays closed.
pub mod keys {
    use super::{BalanceId, TransactionId};

    pub fn transaction(id: TransactionId) -> String {
        format!("transaction:id:{id}")
    }

    pub fn transaction_source(source_id: &str) -> String {
        format!("transaction:source:{source_id}")
    }

    pub fn transaction_stats() -> String {
        "transaction:stats".to_string()
    }

    pub fn balance(id: BalanceId) -> String {
        format!("balance:id:{id}")
    }

    pub fn balance_for(portfolio_id: &str, security_id: Option<&str>) -> String {
        match security_id {
            Some(security) if !security.is_empty() => {
                format!("balance:portfolio:{portfolio_id}:security:{security}")
            }
            _ => format!("balance:portfolio:{portfolio_id}:security:cash"),
        }
    }

    pub fn portfolio_balances(portfolio_id: &str) -> String {
        format!("balance:portfolio:{portfolio_id}")
    }

    pub fn cash_balance(portfolio_id: &str) -> String {
        format!("balance:cash:{portfolio_id}")
    }

    pub fn balance_stats() -> String {
        "balance:stats".to_string()
    }

    pub fn portfolio_summary(portfolio_id: &str) -> String {
        format!("portfolio:summary:{portfolio_id}")
    }

    pub fn external_portfolio(portfolio_id: &str) -> String {
        format!("external:portfolio:{portfolio_id}")
    }

    pub fn external_security(security_id: &str) -> String {
        format!("external:security:{security_id}")
    }
}

/// Backend contract. Values are serialized JSON; a TTL of zero means "use
/// the backend default". `delete_pattern` understands a trailing `*`
/// wildcard only, which is all the keyspace needs.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn delete_pattern(&self, pattern: &str) -> Result<()>;
}

/// Per-prefix TTLs, consulted by every cache-aside call site. Longest
/// matching prefix wins so `transaction:stats` beats `transaction:`.
#[derive(Clone, Debug)]
pub struct TtlTable {
    entries: Vec<(&'static str, Duration)>,
    default_ttl: Duration,
}

impl TtlTable {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: vec![
                ("external:", config.external_ttl),
                ("transaction:stats", config.stats_ttl),
                ("balance:stats", config.stats_ttl),
                ("portfolio:summary:", config.summary_ttl),
                ("transaction:", config.entity_ttl),
                ("balance:", config.entity_ttl),
            ],
            default_ttl: config.default_ttl,
        }
    }

    pub fn ttl_for(&self, key: &str) -> Duration {
        self.entries
            .iter()
            .filter(|(prefix, _)| key.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, ttl)| *ttl)
            .unwrap_or(self.default_ttl)
    }
}

impl Default for TtlTable {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

/// Cache-aside read: serve the cached value, or run the loader and populate.
/// Cache read and write failures are logged and never fail the caller; the
/// loader's error propagates untouched.
pub async fn get_or_set<T, L, Fut>(
    cache: &dyn Cache,
    ttls: &TtlTable,
    key: &str,
    loader: L,
) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    L: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send,
{
    match cache.get(key).await {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(value) => return Ok(value),
            Err(err) => {
                log::warn!("discarding undecodable cache entry {key}: {err}");
            }
        },
        Ok(None) => {}
        Err(err) => {
            log::warn!("cache read for {key} failed: {err}");
        }
    }

    let value = loader().await?;
    match serde_json::to_string(&value) {
        Ok(raw) => {
            if let Err(err) = cache.set(key, raw, ttls.ttl_for(key)).await {
                log::warn!("cache write for {key} failed: {err}");
            }
        }
        Err(err) => {
            log::warn!("could not serialize cache entry {key}: {err}");
        }
    }
    Ok(value)
}

/// Drops every key a balance write can have gone stale: the specific balance
/// rows, the portfolio's balance set and cash key, its summary, and both
/// stats entries. Best-effort; failures are logged.
pub async fn invalidate_portfolio(
    cache: &dyn Cache,
    portfolio_id: &str,
    security_id: Option<&str>,
    balance_ids: &[BalanceId],
) {
    let mut targets = vec![
        keys::balance_for(portfolio_id, security_id),
        keys::portfolio_balances(portfolio_id),
        keys::cash_balance(portfolio_id),
        keys::portfolio_summary(portfolio_id),
        keys::balance_stats(),
        keys::transaction_stats(),
    ];
    for id in balance_ids {
        targets.push(keys::balance(*id));
    }
    for key in targets {
        if let Err(err) = cache.delete(&key).await {
            log::warn!("cache invalidation for {key} failed: {err}");
        }
    }
    let pattern = format!("{}:*", keys::portfolio_balances(portfolio_id));
    if let Err(err) = cache.delete_pattern(&pattern).await {
        log::warn!("cache invalidation for {pattern} failed: {err}");
    }
}

/// Drops the per-transaction keys after a status change.
pub async fn invalidate_transaction(
    cache: &dyn Cache,
    transaction_id: Option<TransactionId>,
    source_id: &str,
) {
    let mut targets = vec![
        keys::transaction_source(source_id),
        keys::transaction_stats(),
    ];
    if let Some(id) = transaction_id {
        targets.push(keys::transaction(id));
    }
    for key in targets {
        if let Err(err) = cache.delete(&key).await {
            log::warn!("cache invalidation for {key} failed: {err}");
        }
    }
}
