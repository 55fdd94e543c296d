// Reconstruction cache: reassembled file content keyed by version id.
// Versions are immutable, so a cached entry can never go stale; bytes only
// leave through LRU capacity eviction.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::VersionId;

pub struct ContentCache {
    inner: Mutex<LruCache<VersionId, Arc<Vec<u8>>>>,
}

impl ContentCache {
    pub fn new(capacity: usize) -> Self {
        ContentCache {
            inner: Mutex::new(LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap())),
        }
    }

    /// Cached bytes of an immutable version, if still resident
    pub async fn get(&self, version_id: &str) -> Option<Arc<Vec<u8>>> {
        self.inner.lock().await.get(version_id).cloned()
    }

    /// Remember a reconstruction; the LRU may evict an older version's
    /// bytes to make room
    pub async fn put(&self, version_id: VersionId, content: Arc<Vec<u8>>) {
        self.inner.lock().await.put(version_id, content);
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}
