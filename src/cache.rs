//! Short-lived store of prepared indices, keyed by document content hash.
//!
//! Re-asking questions about a document that was prepared recently skips
//! chunking and batch embedding. Entries are dropped when they are the
//! least recently used one at capacity, when their TTL has passed, or on
//! [`IndexCache::clear`].

use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::config::CacheConfig;
use crate::retriever::IndexHandle;

/// Point-in-time cache counters, served by `GET /cache/stats`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub ttl_secs: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct CachedIndex {
    handle: Arc<IndexHandle>,
    inserted_at: Instant,
}

struct CacheState {
    entries: LruCache<String, CachedIndex>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

pub struct IndexCache {
    state: Mutex<CacheState>,
    ttl: Duration,
}

impl IndexCache {
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            ttl,
        }
    }

    /// `None` when `capacity = 0`.
    pub fn from_config(config: &CacheConfig) -> Option<Self> {
        NonZeroUsize::new(config.capacity)
            .map(|capacity| Self::new(capacity, Duration::from_secs(config.ttl_secs)))
    }

    /// Look up a prepared index. Expired entries are removed and count as misses.
    pub async fn get(&self, document_id: &str) -> Option<Arc<IndexHandle>> {
        let mut state = self.state.lock().await;

        let expired = match state.entries.get(document_id) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                let handle = entry.handle.clone();
                state.hits += 1;
                return Some(handle);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            state.entries.pop(document_id);
            state.evictions += 1;
        }
        state.misses += 1;
        None
    }

    pub async fn insert(&self, handle: Arc<IndexHandle>) {
        let key = handle.document_id().to_string();
        let mut state = self.state.lock().await;
        let displaced = state.entries.push(
            key.clone(),
            CachedIndex {
                handle,
                inserted_at: Instant::now(),
            },
        );
        if matches!(displaced, Some((old_key, _)) if old_key != key) {
            state.evictions += 1;
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            entries: state.entries.len(),
            capacity: state.entries.cap().get(),
            ttl_secs: self.ttl.as_secs(),
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }

    /// Drop every entry and return how many were removed. Counters are kept.
    pub async fn clear(&self) -> usize {
        let mut state = self.state.lock().await;
        let removed = state.entries.len();
        state.entries.clear();
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkingConfig;
    use crate::embedding::HashingEmbedder;
    use crate::models::Document;
    use crate::retriever::{RetryPolicy, Retriever};

    async fn handle_for(text: &str) -> Arc<IndexHandle> {
        let retriever = Retriever::new(
            Arc::new(HashingEmbedder::new(32)),
            ChunkingConfig::default(),
            RetryPolicy::none(),
        );
        Arc::new(retriever.prepare(&Document::new("test", text)).await.unwrap())
    }

    fn cache(capacity: usize, ttl: Duration) -> IndexCache {
        IndexCache::new(NonZeroUsize::new(capacity).unwrap(), ttl)
    }

    #[tokio::test]
    async fn test_hit_and_miss() {
        let cache = cache(4, Duration::from_secs(60));
        let handle = handle_for("Dental cover is excluded.").await;
        let id = handle.document_id().to_string();

        assert!(cache.get(&id).await.is_none());
        cache.insert(handle.clone()).await;
        let hit = cache.get(&id).await.unwrap();
        assert!(Arc::ptr_eq(&hit, &handle));

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 0);
    }

    #[tokio::test]
    async fn test_least_recently_used_is_evicted() {
        let cache = cache(2, Duration::from_secs(60));
        let a = handle_for("Clause A.").await;
        let b = handle_for("Clause B.").await;
        let c = handle_for("Clause C.").await;

        cache.insert(a.clone()).await;
        cache.insert(b.clone()).await;
        // Touch A so B becomes the eviction candidate.
        assert!(cache.get(a.document_id()).await.is_some());
        cache.insert(c.clone()).await;

        assert!(cache.get(a.document_id()).await.is_some());
        assert!(cache.get(b.document_id()).await.is_none());
        assert!(cache.get(c.document_id()).await.is_some());
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_reinsert_same_document_is_not_an_eviction() {
        let cache = cache(2, Duration::from_secs(60));
        let a = handle_for("Clause A.").await;
        cache.insert(a.clone()).await;
        cache.insert(a.clone()).await;
        let stats = cache.stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.evictions, 0);
    }

    #[tokio::test]
    async fn test_expired_entries_are_dropped() {
        let cache = cache(4, Duration::from_millis(20));
        let a = handle_for("Clause A.").await;
        cache.insert(a.clone()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(cache.get(a.document_id()).await.is_none());
        let stats = cache.stats().await;
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = cache(4, Duration::from_secs(60));
        cache.insert(handle_for("Clause A.").await).await;
        cache.insert(handle_for("Clause B.").await).await;
        assert_eq!(cache.clear().await, 2);
        assert_eq!(cache.stats().await.entries, 0);
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let config = CacheConfig {
            capacity: 0,
            ttl_secs: 60,
        };
        assert!(IndexCache::from_config(&config).is_none());
    }
}
