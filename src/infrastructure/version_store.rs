// Immutable per-file version DAGs: heads, history, restore, diff and
// concurrent-head conflict detection. Mutations per file are serialized by
// a logical mutex; readers work on snapshots.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::core::vector_clock::{
    causal_sort, is_concurrent_with_any, ClockManager, ClockOrdering, VectorClock,
};
use crate::core::{current_time_millis, sha256_hex, FileId, VersionId};
use crate::error::{AppError, AppResult};
use crate::infrastructure::chunk_store::ChunkStore;
use crate::infrastructure::delta_engine::DeltaEngine;
use crate::infrastructure::metadata_store::MetadataStore;
use crate::models::{ChunkSignature, Conflict, Delta, FileMeta, FileVersion};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct FileRecord {
    meta: FileMeta,
    versions: HashMap<VersionId, FileVersion>,
    heads: Vec<VersionId>,
}

pub struct VersionStore {
    files: Arc<RwLock<HashMap<FileId, FileRecord>>>,
    conflicts: Arc<RwLock<HashMap<String, Conflict>>>,
    file_locks: Arc<RwLock<HashMap<FileId, Arc<Mutex<()>>>>>,
    chunk_store: ChunkStore,
    metadata: Arc<MetadataStore>,
}

/// Outcome of accepting a version: the stored version plus a conflict
/// record when the new head is concurrent with an existing one.
#[derive(Debug)]
pub struct VersionOutcome {
    pub version: FileVersion,
    pub conflict: Option<Conflict>,
}

impl VersionStore {
    pub fn new(chunk_store: ChunkStore, metadata: Arc<MetadataStore>) -> Self {
        Self {
            files: Arc::new(RwLock::new(HashMap::new())),
            conflicts: Arc::new(RwLock::new(HashMap::new())),
            file_locks: Arc::new(RwLock::new(HashMap::new())),
            chunk_store,
            metadata,
        }
    }

    /// Logical mutex for one file. Version mutations and replication
    /// session starts for the same file take this lock.
    pub async fn file_lock(&self, file_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.file_locks.write().await;
        locks
            .entry(file_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn register_file(&self, file_id: &str, name: &str) -> AppResult<FileMeta> {
        let mut files = self.files.write().await;
        if let Some(record) = files.get(file_id) {
            return Ok(record.meta.clone());
        }
        let meta = FileMeta {
            file_id: file_id.to_string(),
            name: name.to_string(),
            created_at: current_time_millis(),
        };
        self.metadata
            .insert_file(file_id, name, meta.created_at)
            .await?;
        files.insert(
            file_id.to_string(),
            FileRecord {
                meta: meta.clone(),
                versions: HashMap::new(),
                heads: Vec::new(),
            },
        );
        Ok(meta)
    }

    pub async fn list_files(&self) -> Vec<FileMeta> {
        let mut metas: Vec<FileMeta> = self
            .files
            .read()
            .await
            .values()
            .map(|r| r.meta.clone())
            .collect();
        metas.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        metas
    }

    /// Accept a new immutable version. The caller holds the file lock when
    /// racing replication; validation order is chunks, then staleness.
    pub async fn create_version(
        &self,
        file_id: &str,
        parent_ids: Vec<VersionId>,
        vector_clock: VectorClock,
        chunk_list: Vec<ChunkSignature>,
        originator: &str,
    ) -> AppResult<VersionOutcome> {
        for sig in &chunk_list {
            if !self.chunk_store.has(&sig.hash).await {
                return Err(AppError::MissingChunk(format!(
                    "chunk {} (index {}) must be uploaded before the version",
                    sig.hash, sig.index
                )));
            }
        }

        let mut files = self.files.write().await;
        let record = files
            .get_mut(file_id)
            .ok_or_else(|| AppError::NotFound(format!("file {} not registered", file_id)))?;

        for head_id in &record.heads {
            let head = &record.versions[head_id];
            match vector_clock.compare(&head.vector_clock) {
                ClockOrdering::Less | ClockOrdering::Equal => {
                    return Err(AppError::StaleVersion(format!(
                        "clock does not descend from head {}; merge and retry",
                        head_id
                    )));
                }
                _ => {}
            }
        }

        // The originator's own entry must advance past every parent
        let parent_max = parent_ids
            .iter()
            .filter_map(|id| record.versions.get(id))
            .map(|v| v.vector_clock.get(originator))
            .max()
            .unwrap_or(0);
        if !parent_ids.is_empty() && vector_clock.get(originator) <= parent_max {
            return Err(AppError::InvalidRequest(format!(
                "clock entry for {} must exceed its parents'",
                originator
            )));
        }

        let size: u64 = chunk_list.iter().map(|sig| sig.size as u64).sum();
        let content_hash = self.content_hash_of(&chunk_list).await?;

        let version = FileVersion {
            file_id: file_id.to_string(),
            version_id: Uuid::new_v4().to_string(),
            parent_version_ids: parent_ids.clone(),
            vector_clock: vector_clock.clone(),
            chunk_list: chunk_list.clone(),
            size,
            content_hash,
            created_by_node: originator.to_string(),
            created_at: current_time_millis(),
        };

        self.metadata.insert_version(&version).await?;
        for sig in &chunk_list {
            self.chunk_store.ref_chunk(&sig.hash).await?;
            let refcount = self.chunk_store.refcount(&sig.hash).await;
            self.metadata
                .set_chunk_ref(&sig.hash, refcount, sig.size)
                .await?;
        }

        // Parents leave the head set; the new version joins it
        record.heads.retain(|id| !parent_ids.contains(id));
        record.heads.push(version.version_id.clone());
        record
            .versions
            .insert(version.version_id.clone(), version.clone());

        let sibling_clocks: Vec<&VectorClock> = record
            .heads
            .iter()
            .filter(|id| **id != version.version_id)
            .map(|id| &record.versions[id].vector_clock)
            .collect();
        let conflict = if record.heads.len() >= 2
            && is_concurrent_with_any(&version.vector_clock, sibling_clocks)
        {
            let other = record
                .heads
                .iter()
                .filter(|id| **id != version.version_id)
                .find(|id| {
                    record.versions[*id]
                        .vector_clock
                        .is_concurrent(&version.vector_clock)
                })
                .cloned();
            match other {
                Some(other_id) => {
                    warn!(
                        "Concurrent heads for file {}: {} vs {}",
                        file_id, other_id, version.version_id
                    );
                    let conflict = Conflict::new(
                        file_id.to_string(),
                        other_id,
                        version.version_id.clone(),
                    );
                    self.metadata.insert_conflict(&conflict).await?;
                    self.conflicts
                        .write()
                        .await
                        .insert(conflict.conflict_id.clone(), conflict.clone());
                    Some(conflict)
                }
                None => None,
            }
        } else {
            None
        };

        info!(
            "Version {} created for file {} by {}",
            version.version_id, file_id, originator
        );
        Ok(VersionOutcome { version, conflict })
    }

    async fn content_hash_of(&self, chunk_list: &[ChunkSignature]) -> AppResult<String> {
        let mut content = Vec::new();
        for sig in chunk_list {
            let bytes = self.chunk_store.get(&sig.hash).await?;
            content.extend_from_slice(&bytes);
        }
        Ok(sha256_hex(&content))
    }

    pub async fn head(&self, file_id: &str) -> AppResult<Vec<FileVersion>> {
        let files = self.files.read().await;
        let record = files
            .get(file_id)
            .ok_or_else(|| AppError::NotFound(format!("file {} not registered", file_id)))?;
        let mut heads: Vec<FileVersion> = record
            .heads
            .iter()
            .map(|id| record.versions[id].clone())
            .collect();
        heads.sort_by(|a, b| a.version_id.cmp(&b.version_id));
        Ok(heads)
    }

    /// Deterministic single representative when callers need one base,
    /// even while a conflict leaves multiple heads standing
    pub async fn primary_head(&self, file_id: &str) -> AppResult<Option<FileVersion>> {
        let mut heads = self.head(file_id).await?;
        heads.sort_by(|a, b| {
            (b.created_at, &b.version_id).cmp(&(a.created_at, &a.version_id))
        });
        Ok(heads.into_iter().next())
    }

    pub async fn get_version(&self, file_id: &str, version_id: &str) -> AppResult<FileVersion> {
        let files = self.files.read().await;
        files
            .get(file_id)
            .and_then(|record| record.versions.get(version_id))
            .cloned()
            .ok_or_else(|| {
                AppError::NotFound(format!("version {} of file {} not found", version_id, file_id))
            })
    }

    /// All versions of a file in causal order
    pub async fn history(&self, file_id: &str) -> AppResult<Vec<FileVersion>> {
        let files = self.files.read().await;
        let record = files
            .get(file_id)
            .ok_or_else(|| AppError::NotFound(format!("file {} not registered", file_id)))?;
        Ok(causal_sort(record.versions.values().cloned().collect()))
    }

    /// Reassemble a version's content from the chunk store and verify it
    pub async fn reconstruct(&self, file_id: &str, version_id: &str) -> AppResult<Vec<u8>> {
        let version = self.get_version(file_id, version_id).await?;
        let mut content = Vec::with_capacity(version.size as usize);
        for sig in &version.chunk_list {
            let bytes = self.chunk_store.get(&sig.hash).await?;
            content.extend_from_slice(&bytes);
        }
        let actual = sha256_hex(&content);
        if actual != version.content_hash {
            return Err(AppError::DeltaIntegrity(format!(
                "version {} reconstructs to {} instead of {}",
                version_id, actual, version.content_hash
            )));
        }
        Ok(content)
    }

    /// Restore an old version as a new forward step: same content, a clock
    /// that merges all current heads plus a tick of the restoring node.
    /// History is never rewritten.
    pub async fn restore(
        &self,
        file_id: &str,
        version_id: &str,
        originator: &str,
        clocks: &ClockManager,
    ) -> AppResult<VersionOutcome> {
        let target = self.get_version(file_id, version_id).await?;
        let heads = self.head(file_id).await?;

        let mut merged = VectorClock::new();
        for head in &heads {
            merged.merge(&head.vector_clock);
        }
        let clock = clocks.merge(originator, &merged).await;
        let parent_ids = heads.into_iter().map(|v| v.version_id).collect();

        self.create_version(file_id, parent_ids, clock, target.chunk_list.clone(), originator)
            .await
    }

    /// Delta between two stored versions of a file
    pub async fn diff(
        &self,
        file_id: &str,
        from_version: &str,
        to_version: &str,
        engine: &DeltaEngine,
    ) -> AppResult<Delta> {
        let from_content = self.reconstruct(file_id, from_version).await?;
        let to_content = self.reconstruct(file_id, to_version).await?;
        Ok(engine.delta(&engine.signature(&from_content), &to_content))
    }

    pub async fn conflicts(&self, include_resolved: bool) -> Vec<Conflict> {
        let mut list: Vec<Conflict> = self
            .conflicts
            .read()
            .await
            .values()
            .filter(|c| include_resolved || !c.resolved)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.detected_at.cmp(&b.detected_at));
        list
    }

    pub async fn get_conflict(&self, conflict_id: &str) -> AppResult<Conflict> {
        self.conflicts
            .read()
            .await
            .get(conflict_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("conflict {} not found", conflict_id)))
    }

    /// Record a resolution: the winner's content becomes a new head whose
    /// clock merges both branches plus a tick of the resolving node.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        winner_version_id: &str,
        resolver: &str,
        clocks: &ClockManager,
    ) -> AppResult<(Conflict, FileVersion)> {
        let conflict = self.get_conflict(conflict_id).await?;
        if conflict.resolved {
            return Err(AppError::InvalidRequest(format!(
                "conflict {} already resolved",
                conflict_id
            )));
        }
        if winner_version_id != conflict.version_a && winner_version_id != conflict.version_b {
            return Err(AppError::InvalidRequest(format!(
                "version {} is not a party to conflict {}",
                winner_version_id, conflict_id
            )));
        }

        let winner = self
            .get_version(&conflict.file_id, winner_version_id)
            .await?;
        let loser_id = if winner_version_id == conflict.version_a {
            &conflict.version_b
        } else {
            &conflict.version_a
        };
        let loser = self.get_version(&conflict.file_id, loser_id).await?;

        let mut merged = winner.vector_clock.clone();
        merged.merge(&loser.vector_clock);
        let clock = clocks.merge(resolver, &merged).await;

        let outcome = self
            .create_version(
                &conflict.file_id,
                vec![winner.version_id.clone(), loser.version_id.clone()],
                clock,
                winner.chunk_list.clone(),
                resolver,
            )
            .await?;

        self.metadata
            .resolve_conflict(conflict_id, winner_version_id)
            .await?;
        let resolved = {
            let mut conflicts = self.conflicts.write().await;
            let entry = conflicts
                .get_mut(conflict_id)
                .ok_or_else(|| AppError::NotFound(format!("conflict {} not found", conflict_id)))?;
            entry.resolved = true;
            entry.resolution = Some(winner_version_id.to_string());
            entry.clone()
        };

        info!(
            "Conflict {} resolved in favor of {}",
            conflict_id, winner_version_id
        );
        Ok((resolved, outcome.version))
    }

    /// Drop in-memory conflicts referencing versions from a removed node
    pub async fn forget_conflicts_from(&self, node_id: &str) {
        let authored: Vec<String> = {
            let files = self.files.read().await;
            files
                .values()
                .flat_map(|record| record.versions.values())
                .filter(|v| v.created_by_node == node_id)
                .map(|v| v.version_id.clone())
                .collect()
        };
        self.conflicts.write().await.retain(|_, c| {
            !authored.contains(&c.version_a) && !authored.contains(&c.version_b)
        });
    }

    pub async fn version_count(&self) -> usize {
        self.files
            .read()
            .await
            .values()
            .map(|record| record.versions.len())
            .sum()
    }
}
