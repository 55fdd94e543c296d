// Content-addressable chunk storage with reference accounting
// Keys are hex SHA-256 digests; two chunks with equal hash are interchangeable

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::core::sha256_hex;
use crate::error::{AppError, AppResult};

#[derive(Debug)]
struct ChunkEntry {
    bytes: Arc<Vec<u8>>,
    refcount: u64,
}

/// In-memory chunk body store. Entries are removed only when their
/// refcount reaches zero.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    chunks: Arc<RwLock<HashMap<String, ChunkEntry>>>,
    stats: Arc<RwLock<ChunkStoreStats>>,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ChunkStoreStats {
    pub chunk_count: usize,
    pub total_bytes: u64,
    /// Bytes a duplicate put would have stored again
    pub dedup_bytes_saved: u64,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self {
            chunks: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ChunkStoreStats::default())),
        }
    }

    /// Store a chunk body and return its hash. Idempotent for identical
    /// bytes: a repeat put increments the refcount instead of duplicating.
    pub async fn put(&self, bytes: Vec<u8>) -> String {
        let hash = sha256_hex(&bytes);
        let len = bytes.len() as u64;
        let mut chunks = self.chunks.write().await;
        let mut stats = self.stats.write().await;
        match chunks.get_mut(&hash) {
            Some(entry) => {
                entry.refcount += 1;
                stats.dedup_bytes_saved += len;
                debug!("Chunk {} refcount -> {}", &hash[..8], entry.refcount);
            }
            None => {
                chunks.insert(
                    hash.clone(),
                    ChunkEntry {
                        bytes: Arc::new(bytes),
                        refcount: 1,
                    },
                );
                stats.chunk_count = chunks.len();
                stats.total_bytes += len;
            }
        }
        hash
    }

    pub async fn get(&self, hash: &str) -> AppResult<Arc<Vec<u8>>> {
        self.chunks
            .read()
            .await
            .get(hash)
            .map(|entry| Arc::clone(&entry.bytes))
            .ok_or_else(|| AppError::NotFound(format!("chunk {} not in store", hash)))
    }

    pub async fn has(&self, hash: &str) -> bool {
        self.chunks.read().await.contains_key(hash)
    }

    pub async fn refcount(&self, hash: &str) -> u64 {
        self.chunks
            .read()
            .await
            .get(hash)
            .map(|entry| entry.refcount)
            .unwrap_or(0)
    }

    /// Add a reference to an existing chunk
    pub async fn ref_chunk(&self, hash: &str) -> AppResult<()> {
        let mut chunks = self.chunks.write().await;
        match chunks.get_mut(hash) {
            Some(entry) => {
                entry.refcount += 1;
                Ok(())
            }
            None => Err(AppError::NotFound(format!("chunk {} not in store", hash))),
        }
    }

    /// Release a reference; the entry is dropped when the count hits zero
    pub async fn unref_chunk(&self, hash: &str) {
        let mut chunks = self.chunks.write().await;
        let remove = match chunks.get_mut(hash) {
            Some(entry) => {
                entry.refcount = entry.refcount.saturating_sub(1);
                entry.refcount == 0
            }
            None => false,
        };
        if remove {
            if let Some(entry) = chunks.remove(hash) {
                let mut stats = self.stats.write().await;
                stats.chunk_count = chunks.len();
                stats.total_bytes = stats.total_bytes.saturating_sub(entry.bytes.len() as u64);
                debug!("Chunk {} released", &hash[..8]);
            }
        }
    }

    pub async fn stats(&self) -> ChunkStoreStats {
        let mut stats = *self.stats.read().await;
        stats.chunk_count = self.chunks.read().await.len();
        stats
    }
}

impl Default for ChunkStore {
    fn default() -> Self {
        Self::new()
    }
}
