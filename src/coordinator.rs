// Unified coordinator interface - single entry point for all replication
// engine operations. Composes the clock manager, chunk store, delta engine,
// version store, node registry, event log and orchestrator assembled at
// startup; HTTP handlers and tests go through this layer only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::core::vector_clock::{ClockManager, VectorClock};
use crate::core::{sha256_hex, NodeId, VersionId};
use crate::error::{AppError, AppResult};
use crate::infrastructure::{
    ChunkStore, ChunkStoreStats, ContentCache, CoordinatorTransport, DeltaEngine, EventLog,
    MetadataStore, NodeRegistry, PeerTransport, ReplicationOrchestrator, ReplicationStats,
    VersionStore,
};
use crate::models::{
    ChunkSignature, Conflict, Delta, DeltaMetrics, DeltaOp, EventPayload, FileMeta, FileVersion,
    NodeInfo, RegisterNodeRequest, SyncEvent,
};
use serde::Serialize;

const EVENT_WINDOW: usize = 1000;

/// Result of accepting new content for a file
#[derive(Debug)]
pub struct UploadOutcome {
    pub version: FileVersion,
    pub conflict: Option<Conflict>,
    pub delta_metrics: DeltaMetrics,
    pub session_ids: Vec<String>,
}

/// Coordinator-wide aggregates for the /metrics endpoint
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorMetrics {
    pub node_count: usize,
    pub online_node_count: usize,
    pub file_count: usize,
    pub version_count: usize,
    pub unresolved_conflicts: usize,
    pub replication: ReplicationStats,
}

/// Chunk-level aggregates for the /delta-metrics endpoint
#[derive(Debug, Clone, Serialize)]
pub struct DeltaStoreMetrics {
    pub chunk_size: usize,
    pub chunk_count: usize,
    pub stored_bytes: u64,
    pub dedup_bytes_saved: u64,
    pub replication_bytes_saved: u64,
}

#[derive(Clone)]
pub struct SyncCoordinator {
    config: Config,
    metadata: Arc<MetadataStore>,
    chunks: ChunkStore,
    clocks: ClockManager,
    engine: DeltaEngine,
    versions: Arc<VersionStore>,
    nodes: NodeRegistry,
    events: Arc<EventLog>,
    orchestrator: ReplicationOrchestrator,
    content_cache: Arc<ContentCache>,
    fault_reported: Arc<AtomicBool>,
}

impl SyncCoordinator {
    pub async fn new(config: Config) -> AppResult<Self> {
        Self::with_transport(config, Arc::new(CoordinatorTransport)).await
    }

    pub async fn with_transport(
        config: Config,
        transport: Arc<dyn PeerTransport>,
    ) -> AppResult<Self> {
        let metadata = Arc::new(MetadataStore::new(&config.database.url).await?);
        metadata.init().await?;

        let chunks = ChunkStore::new();
        let clocks = ClockManager::new();
        let engine = DeltaEngine::new(config.sync.chunk_size);
        let versions = Arc::new(VersionStore::new(chunks.clone(), Arc::clone(&metadata)));
        let nodes = NodeRegistry::new();
        let events = Arc::new(EventLog::new(Arc::clone(&metadata), EVENT_WINDOW));
        let orchestrator = ReplicationOrchestrator::new(
            config.sync.clone(),
            transport,
            clocks.clone(),
            Arc::clone(&versions),
            nodes.clone(),
            Arc::clone(&events),
        );

        let coordinator = Self {
            content_cache: Arc::new(ContentCache::new(config.cache.capacity)),
            fault_reported: Arc::new(AtomicBool::new(false)),
            config,
            metadata,
            chunks,
            clocks,
            engine,
            versions,
            nodes,
            events,
            orchestrator,
        };

        // Known nodes survive a coordinator restart
        for node in coordinator.metadata.load_nodes().await? {
            coordinator.clocks.register(&node.node_id).await;
            coordinator.nodes.register(RegisterNodeRequest {
                node_id: node.node_id.clone(),
                name: node.name,
                address: node.address,
                port: node.port,
                capabilities: node.capabilities,
            })
            .await;
        }

        Ok(coordinator)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Mutations are rejected once the metadata store degrades to
    /// read-only; the first rejection pushes a system_fault event to
    /// subscribers (reads continue).
    async fn ensure_writable(&self) -> AppResult<()> {
        if let Err(err) = self.metadata.guard_writes() {
            if !self.fault_reported.swap(true, Ordering::Relaxed) {
                error!("Metadata store is read-only, broadcasting system fault");
                self.events
                    .broadcast_unpersisted(SyncEvent::new(
                        "coordinator".to_string(),
                        None,
                        EventPayload::SystemFault {
                            detail: "metadata store degraded to read-only".to_string(),
                        },
                        VectorClock::new(),
                    ))
                    .await;
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn chunk_size(&self) -> usize {
        self.engine.chunk_size()
    }

    // === Node membership ===

    pub async fn register_node(&self, req: RegisterNodeRequest) -> AppResult<NodeInfo> {
        if req.node_id.is_empty() {
            return Err(AppError::InvalidRequest("node_id must not be empty".into()));
        }
        self.ensure_writable().await?;
        let known_before = self.nodes.get(&req.node_id).await.is_ok();

        let node = self.nodes.register(req).await;
        self.clocks.register(&node.node_id).await;
        self.metadata.upsert_node(&node).await?;

        let clock = self.clocks.tick(&node.node_id).await;
        self.events
            .append(
                node.node_id.clone(),
                None,
                EventPayload::NodeRegistered {
                    name: node.name.clone(),
                    address: node.address.clone(),
                    port: node.port,
                },
                clock,
            )
            .await?;

        // A rejoining node explicitly asks to be caught up
        if known_before {
            self.catch_up(&node.node_id).await?;
        }
        Ok(node)
    }

    pub async fn heartbeat(&self, node_id: &str) -> AppResult<()> {
        self.nodes.heartbeat(node_id).await
    }

    pub async fn list_nodes(&self) -> Vec<NodeInfo> {
        self.nodes.list().await
    }

    pub async fn get_node(&self, node_id: &str) -> AppResult<NodeInfo> {
        self.nodes.get(node_id).await
    }

    /// Remove a node and cascade: fail its in-flight sessions, forget its
    /// clock and replica bookkeeping, delete its owned events and conflicts.
    pub async fn remove_node(&self, node_id: &str) -> AppResult<NodeInfo> {
        let node = self.nodes.remove(node_id).await?;
        self.orchestrator
            .fail_sessions_for(node_id, "node removed")
            .await?;

        // Tombstone clock spans the fleet as it was, removed node included
        let clock = self.clocks.snapshot().await.into_values().fold(
            VectorClock::new(),
            |mut acc, vc| {
                acc.merge(&vc);
                acc
            },
        );

        self.orchestrator.forget_node(node_id).await;
        self.versions.forget_conflicts_from(node_id).await;
        self.metadata.delete_conflicts_for_node(node_id).await?;
        self.events.purge_node(node_id).await;
        self.metadata.delete_node(node_id).await?;
        self.clocks.forget(node_id).await;

        self.events
            .append(
                node_id.to_string(),
                None,
                EventPayload::NodeRemoved {
                    reason: "removed by operator".into(),
                },
                clock,
            )
            .await?;
        info!("Node {} removed", node_id);
        Ok(node)
    }

    /// Sweep heartbeats; newly offline nodes get their in-flight sessions
    /// failed promptly.
    pub async fn sweep_offline(&self) -> AppResult<Vec<NodeId>> {
        let flipped = self
            .nodes
            .sweep_offline(self.config.sync.node_offline_after_ms)
            .await;
        for node_id in &flipped {
            self.orchestrator
                .fail_sessions_for(node_id, "target went offline")
                .await?;
            if let Ok(node) = self.nodes.get(node_id).await {
                self.metadata.upsert_node(&node).await?;
            }
        }
        Ok(flipped)
    }

    /// Mark a node offline immediately (tests and admin tooling)
    pub async fn force_offline(&self, node_id: &str) -> AppResult<()> {
        self.nodes.mark_offline(node_id).await;
        self.orchestrator
            .fail_sessions_for(node_id, "target went offline")
            .await
    }

    // === Files and versions ===

    /// Accept a full-content upload, creating a new version and fanning it
    /// out. The vector clock is the client's if supplied, otherwise the
    /// coordinator advances the node's clock past the current head.
    pub async fn upload_file(
        &self,
        file_id: &str,
        file_name: &str,
        content: Vec<u8>,
        node_id: &str,
        client_clock: Option<VectorClock>,
    ) -> AppResult<UploadOutcome> {
        self.ensure_writable().await?;
        self.nodes.get(node_id).await?;
        self.versions.register_file(file_id, file_name).await?;
        self.create_from_content(file_id, content, node_id, client_clock)
            .await
    }

    /// Accept a delta upload against the current head
    pub async fn submit_delta(
        &self,
        file_id: &str,
        delta: &Delta,
        declared_content_hash: &str,
        node_id: &str,
        client_clock: Option<VectorClock>,
    ) -> AppResult<UploadOutcome> {
        self.ensure_writable().await?;
        self.nodes.get(node_id).await?;

        let base_content = match self.versions.primary_head(file_id).await? {
            Some(head) => self.reconstruct_cached(file_id, &head.version_id).await?,
            None => Vec::new(),
        };

        // Senders omit insert bodies the coordinator already holds;
        // hydrate those from the chunk store before applying
        let mut hydrated = delta.clone();
        for op in &mut hydrated.operations {
            if let DeltaOp::Insert {
                chunk_hash, bytes, ..
            } = op
            {
                if bytes.is_none() {
                    let body = self.chunks.get(chunk_hash).await.map_err(|_| {
                        AppError::MissingChunk(format!(
                            "delta inserts chunk {} without bytes and it is not in the store",
                            chunk_hash
                        ))
                    })?;
                    *bytes = Some(body.as_ref().clone());
                }
            }
        }

        let content = self
            .engine
            .apply(&base_content, &hydrated, declared_content_hash)?;
        self.create_from_content(file_id, content, node_id, client_clock)
            .await
    }

    async fn create_from_content(
        &self,
        file_id: &str,
        content: Vec<u8>,
        node_id: &str,
        client_clock: Option<VectorClock>,
    ) -> AppResult<UploadOutcome> {
        let lock = self.versions.file_lock(file_id).await;
        let _guard = lock.lock().await;

        let prior = self.versions.primary_head(file_id).await?;
        let prior_signature: Vec<ChunkSignature> = prior
            .as_ref()
            .map(|v| v.chunk_list.clone())
            .unwrap_or_default();

        // Stage chunk bodies; the version takes its own references
        let signature = self.engine.signature(&content);
        let mut staged: Vec<String> = Vec::with_capacity(signature.len());
        for sig in &signature {
            let start = sig.offset as usize;
            let hash = self.chunks.put(content[start..start + sig.size].to_vec()).await;
            staged.push(hash);
        }

        let clock = match client_clock {
            Some(clock) => clock,
            None => match &prior {
                Some(head) => self.clocks.merge(node_id, &head.vector_clock).await,
                None => self.clocks.tick(node_id).await,
            },
        };

        let heads = match self.versions.head(file_id).await {
            Ok(heads) => heads,
            Err(_) => Vec::new(),
        };
        let parent_ids: Vec<VersionId> = heads
            .iter()
            .filter(|head| clock.compare(&head.vector_clock) == crate::core::vector_clock::ClockOrdering::Greater)
            .map(|head| head.version_id.clone())
            .collect();

        let outcome = self
            .versions
            .create_version(file_id, parent_ids, clock, signature.clone(), node_id)
            .await;

        // Release staging references whatever the outcome
        for hash in &staged {
            self.chunks.unref_chunk(hash).await;
        }
        let outcome = outcome?;
        let version = outcome.version.clone();

        let event_clock = self.clocks.merge(node_id, &version.vector_clock).await;
        self.events
            .append(
                node_id.to_string(),
                Some(file_id.to_string()),
                EventPayload::FileModified {
                    file_name: self
                        .versions
                        .list_files()
                        .await
                        .iter()
                        .find(|f| f.file_id == file_id)
                        .map(|f| f.name.clone())
                        .unwrap_or_else(|| file_id.to_string()),
                    version_id: version.version_id.clone(),
                    size: version.size,
                },
                event_clock,
            )
            .await?;

        if let Some(conflict) = &outcome.conflict {
            warn!(
                "Conflict {} recorded for file {}",
                conflict.conflict_id, file_id
            );
            let clock = self.clocks.tick(node_id).await;
            self.events
                .append(
                    node_id.to_string(),
                    Some(file_id.to_string()),
                    EventPayload::ConflictDetected {
                        conflict_id: conflict.conflict_id.clone(),
                        version_a: conflict.version_a.clone(),
                        version_b: conflict.version_b.clone(),
                    },
                    clock,
                )
                .await?;
        }

        let delta_metrics =
            DeltaEngine::metrics(&self.engine.delta(&prior_signature, &content));

        // Fan-out runs before the file lock is released, so sessions for
        // successive versions of one file start in causal order
        let session_ids = self.orchestrator.replicate_version(&version).await?;

        Ok(UploadOutcome {
            version,
            conflict: outcome.conflict,
            delta_metrics,
            session_ids,
        })
    }

    pub async fn list_files(&self) -> Vec<FileMeta> {
        self.versions.list_files().await
    }

    pub async fn file_heads(&self, file_id: &str) -> AppResult<Vec<FileVersion>> {
        self.versions.head(file_id).await
    }

    pub async fn primary_head(&self, file_id: &str) -> AppResult<FileVersion> {
        self.versions
            .primary_head(file_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("file {} has no versions", file_id)))
    }

    /// Chunk signature of the current head, for peers preparing a delta
    pub async fn head_signature(&self, file_id: &str) -> AppResult<Vec<ChunkSignature>> {
        Ok(self.primary_head(file_id).await?.chunk_list)
    }

    pub async fn history(&self, file_id: &str) -> AppResult<Vec<FileVersion>> {
        self.versions.history(file_id).await
    }

    /// Reconstructed bytes of the current head
    pub async fn content(&self, file_id: &str) -> AppResult<Vec<u8>> {
        let head = self.primary_head(file_id).await?;
        self.reconstruct_cached(file_id, &head.version_id).await
    }

    async fn reconstruct_cached(&self, file_id: &str, version_id: &str) -> AppResult<Vec<u8>> {
        if let Some(content) = self.content_cache.get(version_id).await {
            return Ok(content.as_ref().clone());
        }
        let content = self.versions.reconstruct(file_id, version_id).await?;
        self.content_cache
            .put(version_id.to_string(), Arc::new(content.clone()))
            .await;
        Ok(content)
    }

    pub async fn restore(
        &self,
        file_id: &str,
        version_id: &str,
        node_id: &str,
    ) -> AppResult<UploadOutcome> {
        self.ensure_writable().await?;
        self.nodes.get(node_id).await?;
        let lock = self.versions.file_lock(file_id).await;
        let _guard = lock.lock().await;

        let outcome = self
            .versions
            .restore(file_id, version_id, node_id, &self.clocks)
            .await?;
        let version = outcome.version.clone();

        let event_clock = self.clocks.merge(node_id, &version.vector_clock).await;
        self.events
            .append(
                node_id.to_string(),
                Some(file_id.to_string()),
                EventPayload::FileModified {
                    file_name: file_id.to_string(),
                    version_id: version.version_id.clone(),
                    size: version.size,
                },
                event_clock,
            )
            .await?;

        let session_ids = self.orchestrator.replicate_version(&version).await?;
        Ok(UploadOutcome {
            version,
            conflict: outcome.conflict,
            delta_metrics: DeltaMetrics::default(),
            session_ids,
        })
    }

    pub async fn diff(
        &self,
        file_id: &str,
        from_version: &str,
        to_version: &str,
    ) -> AppResult<Delta> {
        self.versions
            .diff(file_id, from_version, to_version, &self.engine)
            .await
    }

    // === Conflicts ===

    pub async fn conflicts(&self, include_resolved: bool) -> Vec<Conflict> {
        self.versions.conflicts(include_resolved).await
    }

    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        winner_version_id: &str,
    ) -> AppResult<(Conflict, FileVersion)> {
        self.ensure_writable().await?;
        let conflict = self.versions.get_conflict(conflict_id).await?;
        let winner = self
            .versions
            .get_version(&conflict.file_id, winner_version_id)
            .await?;
        let resolver = winner.created_by_node.clone();

        let lock = self.versions.file_lock(&conflict.file_id).await;
        let _guard = lock.lock().await;
        let (resolved, merged) = self
            .versions
            .resolve_conflict(conflict_id, winner_version_id, &resolver, &self.clocks)
            .await?;

        let clock = self.clocks.merge(&resolver, &merged.vector_clock).await;
        self.events
            .append(
                resolver.clone(),
                Some(conflict.file_id.clone()),
                EventPayload::ConflictResolved {
                    conflict_id: conflict_id.to_string(),
                    winner_version_id: winner_version_id.to_string(),
                    merged_version_id: merged.version_id.clone(),
                },
                clock,
            )
            .await?;

        self.orchestrator.replicate_version(&merged).await?;
        Ok((resolved, merged))
    }

    // === Replication ===

    /// Re-replicate the current head of every file this target is behind
    /// on. Each catch-up is an ordinary new session.
    pub async fn catch_up(&self, node_id: &str) -> AppResult<Vec<String>> {
        let mut session_ids = Vec::new();
        for file in self.versions.list_files().await {
            let Some(head) = self.versions.primary_head(&file.file_id).await? else {
                continue;
            };
            if head.created_by_node == node_id {
                continue;
            }
            let behind = match self
                .orchestrator
                .replica_signature(&file.file_id, node_id)
                .await
            {
                Some(signature) => signature != head.chunk_list,
                None => true,
            };
            if behind {
                session_ids.push(
                    self.orchestrator
                        .replicate_to_target(&head, node_id)
                        .await?,
                );
            }
        }
        Ok(session_ids)
    }

    pub async fn sessions_for_target(&self, node_id: &str) -> Vec<crate::models::ReplicationSession> {
        self.orchestrator.sessions_for_target(node_id).await
    }

    pub async fn replica_signature(
        &self,
        file_id: &str,
        node_id: &str,
    ) -> Option<Vec<ChunkSignature>> {
        self.orchestrator.replica_signature(file_id, node_id).await
    }

    // === Events and observability ===

    pub async fn recent_events(&self, limit: usize) -> Vec<SyncEvent> {
        self.events.recent(limit).await
    }

    pub async fn causal_events(&self, limit: usize) -> Vec<SyncEvent> {
        self.events.causal_recent(limit).await
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub async fn vector_clocks(&self) -> std::collections::HashMap<NodeId, VectorClock> {
        self.clocks.snapshot().await
    }

    pub async fn metrics(&self) -> CoordinatorMetrics {
        let nodes = self.nodes.list().await;
        let online = nodes
            .iter()
            .filter(|n| n.status == crate::models::NodeStatus::Online)
            .count();
        CoordinatorMetrics {
            node_count: nodes.len(),
            online_node_count: online,
            file_count: self.versions.list_files().await.len(),
            version_count: self.versions.version_count().await,
            unresolved_conflicts: self.versions.conflicts(false).await.len(),
            replication: self.orchestrator.stats().await,
        }
    }

    pub async fn delta_metrics(&self) -> DeltaStoreMetrics {
        let chunk_stats: ChunkStoreStats = self.chunks.stats().await;
        let replication = self.orchestrator.stats().await;
        DeltaStoreMetrics {
            chunk_size: self.engine.chunk_size(),
            chunk_count: chunk_stats.chunk_count,
            stored_bytes: chunk_stats.total_bytes,
            dedup_bytes_saved: chunk_stats.dedup_bytes_saved,
            replication_bytes_saved: replication.bytes_saved_total,
        }
    }

    /// Verify a declared content hash before accepting chunked input
    pub fn verify_declared_hash(content: &[u8], declared: Option<&str>) -> AppResult<()> {
        if let Some(declared) = declared {
            let actual = sha256_hex(content);
            if actual != declared {
                return Err(AppError::InvalidRequest(format!(
                    "content hashes to {} but {} was declared",
                    actual, declared
                )));
            }
        }
        Ok(())
    }

    /// Background worker flipping silent nodes offline
    pub fn start_offline_sweeper(&self) {
        let coordinator = self.clone();
        let interval_ms = self.config.sync.heartbeat_interval_ms;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                interval.tick().await;
                if let Err(e) = coordinator.sweep_offline().await {
                    warn!("Offline sweep failed: {}", e);
                }
            }
        });
    }
}
