use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::bus::RealtimeBus;
use crate::config::RelayConfig;
use crate::registry::ConnectionRegistry;
use crate::store::{Catalog, CommandStore};

/// Sliding-window set of idempotency keys this instance has already handed to
/// a local producer.  Deduplicates command deliveries across the direct, bus,
/// and poll paths; the janitor purges entries past the window.
#[derive(Default)]
pub struct IdempotencyCache {
    seen: Mutex<HashMap<String, Instant>>,
}

impl IdempotencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the key.  Returns false when it was already present, i.e. the
    /// command was delivered before and must not be delivered again.
    pub async fn insert(&self, key: &str) -> bool {
        let mut seen = self.seen.lock().await;
        if seen.contains_key(key) {
            return false;
        }
        seen.insert(key.to_owned(), Instant::now());
        true
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.seen.lock().await.contains_key(key)
    }

    pub async fn purge_older_than(&self, window: Duration) -> usize {
        let mut seen = self.seen.lock().await;
        let before = seen.len();
        seen.retain(|_, inserted| inserted.elapsed() <= window);
        before - seen.len()
    }
}

/// Everything a handler needs, cheap to clone.  Stores and bus sit behind
/// trait objects so production (Postgres + Redis) and tests (in-memory) wire
/// the same state type.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    /// Generated once per process start; owning_instance_id in the catalog.
    pub instance_id: Uuid,
    pub catalog: Arc<dyn Catalog>,
    pub commands: Arc<dyn CommandStore>,
    pub bus: Arc<dyn RealtimeBus>,
    pub registry: Arc<ConnectionRegistry>,
    pub recent_keys: Arc<IdempotencyCache>,
}

impl AppState {
    pub fn new(
        config: Arc<RelayConfig>,
        catalog: Arc<dyn Catalog>,
        commands: Arc<dyn CommandStore>,
        bus: Arc<dyn RealtimeBus>,
    ) -> Self {
        Self {
            config,
            instance_id: Uuid::new_v4(),
            catalog,
            commands,
            bus,
            registry: Arc::new(ConnectionRegistry::new()),
            recent_keys: Arc::new(IdempotencyCache::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn idempotency_cache_accepts_each_key_once() {
        let cache = IdempotencyCache::new();
        assert!(cache.insert("viewer-1:1:1000").await);
        assert!(!cache.insert("viewer-1:1:1000").await);
        assert!(cache.insert("viewer-1:2:1001").await);
        assert!(cache.contains("viewer-1:1:1000").await);
    }

    #[tokio::test]
    async fn idempotency_cache_purges_on_a_sliding_window() {
        let cache = IdempotencyCache::new();
        assert!(cache.insert("old-key").await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.insert("new-key").await);

        let purged = cache.purge_older_than(Duration::from_millis(10)).await;
        assert_eq!(purged, 1);
        assert!(!cache.contains("old-key").await);
        assert!(cache.contains("new-key").await);

        // A purged key may be delivered again.
        assert!(cache.insert("old-key").await);
    }
}
