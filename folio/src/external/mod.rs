//! Reference-data lookups against the portfolio and security services.
//! Every remote call is composed as retry around circuit breaker around the
//! HTTP request, with a cache-aside layer on top holding records for hours.

pub mod breaker;
pub mod http;
pub mod retry;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::cache::{get_or_set, keys, Cache, TtlTable};
use crate::error::{Error, Result};

/// Portfolio master record as served by the portfolio service.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PortfolioRecord {
    pub portfolio_id: String,
    pub name: String,
    pub version: i32,
}

/// Security master record as served by the security service.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SecurityRecord {
    pub security_id: String,
    pub ticker: String,
    pub description: Option<String>,
    pub version: i32,
}

#[async_trait]
pub trait PortfolioSource: Send + Sync {
    async fn get_portfolio(&self, portfolio_id: &str) -> Result<PortfolioRecord>;
}

#[async_trait]
pub trait SecuritySource: Send + Sync {
    async fn get_security(&self, security_id: &str) -> Result<SecurityRecord>;
}

/// Cache-aside wrapper over a portfolio source, keyed `external:portfolio:*`.
pub struct CachedPortfolioSource {
    inner: Arc<dyn PortfolioSource>,
    cache: Arc<dyn Cache>,
    ttls: TtlTable,
}

impl CachedPortfolioSource {
    pub fn new(inner: Arc<dyn PortfolioSource>, cache: Arc<dyn Cache>, ttls: TtlTable) -> Self {
        Self { inner, cache, ttls }
    }
}

#[async_trait]
impl PortfolioSource for CachedPortfolioSource {
    async fn get_portfolio(&self, portfolio_id: &str) -> Result<PortfolioRecord> {
        get_or_set(
            self.cache.as_ref(),
            &self.ttls,
            &keys::external_portfolio(portfolio_id),
            || self.inner.get_portfolio(portfolio_id),
        )
        .await
    }
}

/// Cache-aside wrapper over a security source, keyed `external:security:*`.
pub struct CachedSecuritySource {
    inner: Arc<dyn SecuritySource>,
    cache: Arc<dyn Cache>,
    ttls: TtlTable,
}

impl CachedSecuritySource {
    pub fn new(inner: Arc<dyn SecuritySource>, cache: Arc<dyn Cache>, ttls: TtlTable) -> Self {
        Self { inner, cache, ttls }
    }
}

#[async_trait]
impl SecuritySource for CachedSecuritySource {
    async fn get_security(&self, security_id: &str) -> Result<SecurityRecord> {
        get_or_set(
            self.cache.as_ref(),
            &self.ttls,
            &keys::external_security(security_id),
            || self.inner.get_security(security_id),
        )
        .await
    }
}

/// Reference data held in process. A permissive source acknowledges every
/// well-formed id, which is what the file importer falls back to when no
/// reference services are configured; a strict one only knows the records
/// fed to it. Failure injection covers the transient-lookup paths in tests.
pub struct StaticSource {
    portfolios: DashMap<String, PortfolioRecord>,
    securities: DashMap<String, SecurityRecord>,
    permissive: bool,
    failures: AtomicU32,
}

impl StaticSource {
    pub fn strict() -> Self {
        Self {
            portfolios: DashMap::new(),
            securities: DashMap::new(),
            permissive: false,
            failures: AtomicU32::new(0),
        }
    }

    pub fn permissive() -> Self {
        Self {
            portfolios: DashMap::new(),
            securities: DashMap::new(),
            permissive: true,
            failures: AtomicU32::new(0),
        }
    }

    pub fn add_portfolio(&self, portfolio_id: impl Into<String>, name: impl Into<String>) {
        let portfolio_id = portfolio_id.into();
        self.portfolios.insert(
            portfolio_id.clone(),
            PortfolioRecord {
                portfolio_id,
                name: name.into(),
                version: 1,
            },
        );
    }

    pub fn add_security(&self, security_id: impl Into<String>, ticker: impl Into<String>) {
        let security_id = security_id.into();
        self.securities.insert(
            security_id.clone(),
            SecurityRecord {
                security_id,
                ticker: ticker.into(),
                description: None,
                version: 1,
            },
        );
    }

    /// Makes the next `count` lookups fail with a transient error.
    pub fn fail_lookups(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn maybe_fail(&self) -> Result<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::TransientIo("injected lookup failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PortfolioSource for StaticSource {
    async fn get_portfolio(&self, portfolio_id: &str) -> Result<PortfolioRecord> {
        self.maybe_fail()?;
        if let Some(record) = self.portfolios.get(portfolio_id) {
            return Ok(record.clone());
        }
        if self.permissive {
            return Ok(PortfolioRecord {
                portfolio_id: portfolio_id.to_string(),
                name: portfolio_id.to_string(),
                version: 1,
            });
        }
        Err(Error::not_found("portfolio", portfolio_id))
    }
}

#[async_trait]
impl SecuritySource for StaticSource {
    async fn get_security(&self, security_id: &str) -> Result<SecurityRecord> {
        self.maybe_fail()?;
        if let Some(record) = self.securities.get(security_id) {
            return Ok(record.clone());
        }
        if self.permissive {
            return Ok(SecurityRecord {
                security_id: security_id.to_string(),
                ticker: security_id.to_string(),
                description: None,
                version: 1,
            });
        }
        Err(Error::not_found("security", security_id))
    }
}
