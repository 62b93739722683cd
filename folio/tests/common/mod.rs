#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use folio::cache::memory::MemoryCache;
use folio::cache::Cache;
use folio::config::CacheConfig;
use folio::external::{PortfolioSource, SecuritySource, StaticSource};
use folio::processor::ProcessorConfig;
use folio::service::{Services, TransactionPost};
use folio::store::memory::MemoryStore;

pub struct TestContext {
    pub store: Arc<MemoryStore>,
    pub source: Arc<StaticSource>,
    pub cache: Arc<MemoryCache>,
    pub services: Services,
}

/// 24-character portfolio id, numbered.
pub fn pid(n: u32) -> String {
    format!("{:0>24}", format!("P{n}"))
}

/// 24-character security id, numbered.
pub fn sid(n: u32) -> String {
    format!("{:0>24}", format!("S{n}"))
}

pub fn setup() -> TestContext {
    setup_with_config(ProcessorConfig::default())
}

pub fn setup_with_config(processor_config: ProcessorConfig) -> TestContext {
    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(StaticSource::strict());
    for n in 1..=4 {
        source.add_portfolio(pid(n), format!("Portfolio {n}"));
        source.add_security(sid(n), format!("SEC{n}"));
    }
    let cache = Arc::new(MemoryCache::new(Duration::from_secs(60)));

    let services = Services::build(
        store.clone(),
        source.clone() as Arc<dyn PortfolioSource>,
        source.clone() as Arc<dyn SecuritySource>,
        cache.clone() as Arc<dyn Cache>,
        processor_config,
        &CacheConfig::default(),
    );

    TestContext {
        store,
        source,
        cache,
        services,
    }
}

pub fn security_post(
    portfolio: &str,
    security: &str,
    source_id: &str,
    transaction_type: &str,
    quantity: i64,
    price: i64,
) -> TransactionPost {
    TransactionPost {
        portfolio_id: portfolio.to_string(),
        security_id: Some(security.to_string()),
        source_id: source_id.to_string(),
        transaction_type: transaction_type.to_string(),
        quantity: Decimal::from(quantity),
        price: Some(Decimal::from(price)),
        transaction_date: "20240130".to_string(),
    }
}

pub fn cash_post(
    portfolio: &str,
    source_id: &str,
    transaction_type: &str,
    quantity: i64,
) -> TransactionPost {
    TransactionPost {
        portfolio_id: portfolio.to_string(),
        security_id: None,
        source_id: source_id.to_string(),
        transaction_type: transaction_type.to_string(),
        quantity: Decimal::from(quantity),
        price: None,
        transaction_date: "20240130".to_string(),
    }
}
