use std::time::Duration;

use async_trait::async_trait;

use super::Cache;
use crate::error::Result;

/// A cache that stores nothing. Every read misses, so callers always hit
/// their loader; useful for tests and for running without a cache tier.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCache;

#[async_trait]
impl Cache for NoopCache {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn delete_pattern(&self, _pattern: &str) -> Result<()> {
        Ok(())
    }
}
