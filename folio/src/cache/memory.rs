use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::Cache;
use crate::error::Result;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

/// In-process cache over a concurrent map. Expired entries are dropped on
/// read and by a periodic sweep so the map does not grow unbounded between
/// reads.
pub struct MemoryCache {
    map: DashMap<String, Entry>,
    default_ttl: Duration,
}

impl MemoryCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            map: DashMap::new(),
            default_ttl,
        }
    }

    /// Runs a background sweep every `interval` for as long as the cache is
    /// alive.
    pub fn spawn_sweeper(cache: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(cache);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(cache) => cache.sweep(),
                    None => break,
                }
            }
        });
    }

    pub fn sweep(&self) {
        self.map.retain(|_, entry| !entry.expired());
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(entry) = self.map.get(key) {
            if !entry.expired() {
                return Ok(Some(entry.value.clone()));
            }
        }
        // Drop the stale entry outside the read guard.
        self.map.remove_if(key, |_, entry| entry.expired());
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };
        self.map.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.map.remove(key);
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<()> {
        match pattern.strip_suffix('*') {
            Some(prefix) => self.map.retain(|key, _| !key.starts_with(prefix)),
            None => {
                self.map.remove(pattern);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::MemoryCache;
    use crate::cache::Cache;

    fn setup() -> MemoryCache {
        MemoryCache::new(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_that_values_round_trip() {
        let cache = setup();
        cache
            .set("balance:id:1", "{}".to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(cache.get("balance:id:1").await.unwrap(), Some("{}".into()));
        cache.delete("balance:id:1").await.unwrap();
        assert_eq!(cache.get("balance:id:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_that_expired_entries_are_not_served() {
        let cache = setup();
        cache
            .set("k", "v".to_string(), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_that_pattern_delete_matches_prefix() {
        let cache = setup();
        for key in [
            "balance:portfolio:P1:security:S1",
            "balance:portfolio:P1:security:cash",
            "balance:portfolio:P2:security:S1",
        ] {
            cache
                .set(key, "{}".to_string(), Duration::from_secs(5))
                .await
                .unwrap();
        }
        cache.delete_pattern("balance:portfolio:P1:*").await.unwrap();
        assert_eq!(cache.get("balance:portfolio:P1:security:S1").await.unwrap(), None);
        assert!(cache
            .get("balance:portfolio:P2:security:S1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_that_sweep_drops_expired_entries() {
        let cache = setup();
        cache
            .set("short", "v".to_string(), Duration::from_millis(10))
            .await
            .unwrap();
        cache
            .set("long", "v".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.sweep();
        assert_eq!(cache.len(), 1);
    }
}
