// Replication orchestrator: fans a newly created version out to every
// online peer, one session per (file, target), with progress reporting and
// per-peer failure handling. Sessions for the same (file, target) pair are
// serialized; distinct pairs proceed in parallel under the configured caps.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::core::vector_clock::ClockManager;
use crate::core::{FileId, NodeId};
use crate::error::{AppError, AppResult};
use crate::infrastructure::delta_engine::DeltaEngine;
use crate::infrastructure::event_log::EventLog;
use crate::infrastructure::node_registry::NodeRegistry;
use crate::infrastructure::version_store::VersionStore;
use crate::models::{
    Delta, DeltaMetrics, DeltaOp, EventPayload, FileVersion, NodeInfo, ReplicationSession,
    SessionState,
};

/// Transport seam towards peer nodes. The default implementation applies
/// replicas authoritatively in-process; tests substitute failing variants.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Deliver the delta description (insert bytes stripped) to the target
    async fn send_delta(&self, target: &NodeInfo, file_id: &str, delta: &Delta) -> AppResult<()>;

    /// Deliver one chunk body the target does not yet hold
    async fn send_chunk(&self, target: &NodeInfo, chunk_hash: &str, bytes: &[u8]) -> AppResult<()>;
}

/// Passive-replica transport: targets are bookkept by the coordinator, so
/// delivery is an in-process acknowledgement.
pub struct CoordinatorTransport;

#[async_trait]
impl PeerTransport for CoordinatorTransport {
    async fn send_delta(&self, target: &NodeInfo, file_id: &str, delta: &Delta) -> AppResult<()> {
        debug!(
            "Delta with {} ops for file {} acknowledged by {}",
            delta.operations.len(),
            file_id,
            target.node_id
        );
        Ok(())
    }

    async fn send_chunk(&self, target: &NodeInfo, chunk_hash: &str, _bytes: &[u8]) -> AppResult<()> {
        debug!("Chunk {} acknowledged by {}", &chunk_hash[..8], target.node_id);
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ReplicationStats {
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub in_flight: u64,
    pub bytes_transferred_total: u64,
    pub bytes_saved_total: u64,
    pub avg_compression_ratio: f64,
    #[serde(skip)]
    ratio_sum: f64,
}

#[derive(Clone)]
pub struct ReplicationOrchestrator {
    config: SyncConfig,
    transport: Arc<dyn PeerTransport>,
    clocks: ClockManager,
    versions: Arc<VersionStore>,
    nodes: NodeRegistry,
    events: Arc<EventLog>,
    engine: DeltaEngine,
    sessions: Arc<RwLock<HashMap<String, ReplicationSession>>>,
    /// Last signature each target is known to have applied, per file
    replica_state: Arc<RwLock<HashMap<(FileId, NodeId), Vec<crate::models::ChunkSignature>>>>,
    /// Chunk hashes each target holds (survives failed sessions, so a
    /// re-replication only ships what is still missing)
    node_chunks: Arc<RwLock<HashMap<NodeId, HashSet<String>>>>,
    /// Serializes successive sessions for one (file, target) pair
    lanes: Arc<Mutex<HashMap<(FileId, NodeId), Arc<Mutex<()>>>>>,
    target_slots: Arc<Mutex<HashMap<NodeId, Arc<Semaphore>>>>,
    global_slots: Arc<Semaphore>,
    stats: Arc<RwLock<ReplicationStats>>,
}

impl ReplicationOrchestrator {
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn PeerTransport>,
        clocks: ClockManager,
        versions: Arc<VersionStore>,
        nodes: NodeRegistry,
        events: Arc<EventLog>,
    ) -> Self {
        let engine = DeltaEngine::new(config.chunk_size);
        let global_slots = Arc::new(Semaphore::new(config.max_parallel_sessions_total));
        Self {
            config,
            transport,
            clocks,
            versions,
            nodes,
            events,
            engine,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            replica_state: Arc::new(RwLock::new(HashMap::new())),
            node_chunks: Arc::new(RwLock::new(HashMap::new())),
            lanes: Arc::new(Mutex::new(HashMap::new())),
            target_slots: Arc::new(Mutex::new(HashMap::new())),
            global_slots,
            stats: Arc::new(RwLock::new(ReplicationStats::default())),
        }
    }

    /// Fan a new version out to every online sync-capable peer except the
    /// originator. Returns the session ids once every session is terminal.
    pub async fn replicate_version(&self, version: &FileVersion) -> AppResult<Vec<String>> {
        let source = version.created_by_node.clone();
        let targets: Vec<NodeInfo> = self
            .nodes
            .online_nodes()
            .await
            .into_iter()
            .filter(|n| n.node_id != source && n.supports_sync())
            .collect();

        if targets.is_empty() {
            debug!("No replication targets for version {}", version.version_id);
            return Ok(Vec::new());
        }

        let mut handles = Vec::with_capacity(targets.len());
        for target in targets {
            let orchestrator = self.clone();
            let version = version.clone();
            handles.push(tokio::spawn(async move {
                orchestrator.replicate_to_target(&version, &target.node_id).await
            }));
        }

        let mut session_ids = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(session_id) => session_ids.push(session_id?),
                Err(e) => return Err(AppError::Internal(format!("session task panicked: {}", e))),
            }
        }
        Ok(session_ids)
    }

    /// Run one replication session to a single target and drive it to a
    /// terminal state. Public so a rejoining node can be caught up
    /// explicitly; re-replication is always a new session.
    pub async fn replicate_to_target(
        &self,
        version: &FileVersion,
        target_id: &str,
    ) -> AppResult<String> {
        let session = ReplicationSession::new(
            version.file_id.clone(),
            version.version_id.clone(),
            version.created_by_node.clone(),
            target_id.to_string(),
        );
        let session_id = session.session_id.clone();
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), session);
        {
            let mut stats = self.stats.write().await;
            stats.sessions_started += 1;
            stats.in_flight += 1;
        }

        self.emit_progress(version, target_id, &session_id, 0).await?;

        // Pending until the lane and the concurrency slots free up
        let lane = self.lane(&version.file_id, target_id).await;
        let _lane_guard = lane.lock().await;
        let target_slot = self.target_slot(target_id).await;
        let _target_permit = target_slot.acquire().await.map_err(|_| {
            AppError::Internal("target semaphore closed".to_string())
        })?;
        let _global_permit = self.global_slots.acquire().await.map_err(|_| {
            AppError::Internal("global semaphore closed".to_string())
        })?;

        self.set_state(&session_id, SessionState::InProgress, None).await;

        let deadline = Duration::from_millis(self.config.session_deadline_ms);
        let result = match timeout(deadline, self.run_transfer(version, target_id, &session_id)).await
        {
            Ok(result) => result,
            Err(_) => Err(AppError::SessionTimeout(format!(
                "session {} exceeded {}ms",
                session_id, self.config.session_deadline_ms
            ))),
        };

        match result {
            Ok((bytes_transferred, metrics)) => {
                self.set_state(&session_id, SessionState::Completed, None).await;
                {
                    let mut sessions = self.sessions.write().await;
                    if let Some(s) = sessions.get_mut(&session_id) {
                        s.bytes_transferred = bytes_transferred;
                        s.completed_at = Some(crate::core::current_time_millis());
                    }
                }
                {
                    let mut stats = self.stats.write().await;
                    stats.in_flight = stats.in_flight.saturating_sub(1);
                    stats.sessions_completed += 1;
                    stats.bytes_transferred_total += metrics.bytes_transferred;
                    stats.bytes_saved_total += metrics.bytes_saved;
                    stats.ratio_sum += metrics.compression_ratio;
                    stats.avg_compression_ratio =
                        stats.ratio_sum / stats.sessions_completed as f64;
                }
                let clock = self.clocks.tick(&version.created_by_node).await;
                self.events
                    .append(
                        version.created_by_node.clone(),
                        Some(version.file_id.clone()),
                        EventPayload::SyncCompleted {
                            session_id: session_id.clone(),
                            source: version.created_by_node.clone(),
                            target: target_id.to_string(),
                            version_id: version.version_id.clone(),
                            bytes_transferred,
                            delta_metrics: metrics,
                        },
                        clock,
                    )
                    .await?;
                info!(
                    "Session {} completed: {} -> {} ({} bytes)",
                    session_id, version.created_by_node, target_id, bytes_transferred
                );
            }
            Err(err) => {
                let reason = err.to_string();
                self.fail_session(&session_id, version, target_id, &reason).await?;
            }
        }
        Ok(session_id)
    }

    /// One transfer attempt: delta against the target's last signature,
    /// then the chunk bodies it is missing, with quantized progress.
    async fn run_transfer(
        &self,
        version: &FileVersion,
        target_id: &str,
        session_id: &str,
    ) -> AppResult<(u64, DeltaMetrics)> {
        let target = self.nodes.get(target_id).await?;
        if !self.nodes.is_online(target_id).await {
            return Err(AppError::TargetOffline(format!(
                "node {} is offline",
                target_id
            )));
        }

        let base_signature = self
            .replica_state
            .read()
            .await
            .get(&(version.file_id.clone(), target_id.to_string()))
            .cloned()
            .unwrap_or_default();

        let content = self
            .versions
            .reconstruct(&version.file_id, &version.version_id)
            .await?;
        let delta = self.engine.delta(&base_signature, &content);

        // Which insert bodies does this target actually need?
        let held = self
            .node_chunks
            .read()
            .await
            .get(target_id)
            .cloned()
            .unwrap_or_default();
        let mut to_send: Vec<(String, Vec<u8>)> = Vec::new();
        let mut skipped_bytes = 0u64;
        for op in &delta.operations {
            if let DeltaOp::Insert {
                chunk_hash,
                bytes: Some(bytes),
                size,
                ..
            } = op
            {
                if held.contains(chunk_hash) {
                    skipped_bytes += *size as u64;
                } else {
                    to_send.push((chunk_hash.clone(), bytes.clone()));
                }
            }
        }

        // The wire delta never carries bodies; they follow as chunks
        let wire_delta = Delta {
            base_signature_digest: delta.base_signature_digest.clone(),
            operations: delta
                .operations
                .iter()
                .map(|op| match op {
                    DeltaOp::Insert {
                        index,
                        chunk_hash,
                        size,
                        ..
                    } => DeltaOp::Insert {
                        index: *index,
                        chunk_hash: chunk_hash.clone(),
                        size: *size,
                        bytes: None,
                    },
                    copy => copy.clone(),
                })
                .collect(),
        };
        let chunk_deadline = Duration::from_millis(self.config.chunk_transfer_deadline_ms);
        timeout(
            chunk_deadline,
            self.transport.send_delta(&target, &version.file_id, &wire_delta),
        )
        .await
        .map_err(|_| AppError::SessionTimeout("delta transfer timed out".to_string()))??;

        let total_bytes: u64 = to_send.iter().map(|(_, bytes)| bytes.len() as u64).sum();
        let mut sent_bytes = 0u64;
        let mut last_milestone = 0u8;

        for (chunk_hash, bytes) in &to_send {
            if !self.nodes.is_online(target_id).await {
                return Err(AppError::TargetOffline(format!(
                    "node {} went offline mid-session",
                    target_id
                )));
            }
            timeout(
                chunk_deadline,
                self.transport.send_chunk(&target, chunk_hash, bytes),
            )
            .await
            .map_err(|_| {
                AppError::SessionTimeout(format!("chunk {} transfer timed out", chunk_hash))
            })??;

            sent_bytes += bytes.len() as u64;
            self.node_chunks
                .write()
                .await
                .entry(target_id.to_string())
                .or_default()
                .insert(chunk_hash.clone());

            let pct = (sent_bytes * 100 / total_bytes.max(1)) as u8;
            for milestone in [25u8, 50, 75] {
                if pct >= milestone && last_milestone < milestone && pct < 100 {
                    last_milestone = milestone;
                    self.emit_progress(version, target_id, session_id, milestone).await?;
                }
            }
        }

        // Record the applied version on the target's side
        {
            let mut replicas = self.replica_state.write().await;
            replicas.insert(
                (version.file_id.clone(), target_id.to_string()),
                version.chunk_list.clone(),
            );
        }
        {
            let mut chunks = self.node_chunks.write().await;
            let held = chunks.entry(target_id.to_string()).or_default();
            for sig in &version.chunk_list {
                held.insert(sig.hash.clone());
            }
        }

        self.emit_progress(version, target_id, session_id, 100).await?;

        // Transfer accounting: insert bodies the target already held count
        // as savings, not transfer
        let mut metrics = DeltaEngine::metrics(&delta);
        metrics.bytes_transferred = metrics.bytes_transferred.saturating_sub(skipped_bytes);
        metrics.bytes_saved += skipped_bytes;
        let total = metrics.bytes_transferred + metrics.bytes_saved;
        metrics.compression_ratio = if total > 0 {
            metrics.bytes_saved as f64 / total as f64
        } else {
            0.0
        };

        Ok((sent_bytes, metrics))
    }

    async fn fail_session(
        &self,
        session_id: &str,
        version: &FileVersion,
        target_id: &str,
        reason: &str,
    ) -> AppResult<()> {
        warn!(
            "Session {} failed: {} -> {}: {}",
            session_id, version.created_by_node, target_id, reason
        );
        self.set_state(session_id, SessionState::Failed, Some(reason.to_string()))
            .await;
        {
            let mut stats = self.stats.write().await;
            stats.in_flight = stats.in_flight.saturating_sub(1);
            stats.sessions_failed += 1;
        }
        let clock = self.clocks.tick(&version.created_by_node).await;
        self.events
            .append(
                version.created_by_node.clone(),
                Some(version.file_id.clone()),
                EventPayload::SyncError {
                    session_id: session_id.to_string(),
                    source: version.created_by_node.clone(),
                    target: target_id.to_string(),
                    version_id: version.version_id.clone(),
                    reason: reason.to_string(),
                },
                clock,
            )
            .await?;
        Ok(())
    }

    /// Promptly fail every non-terminal session targeting an offline node
    pub async fn fail_sessions_for(&self, node_id: &str, reason: &str) -> AppResult<()> {
        let doomed: Vec<ReplicationSession> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.target_node == node_id && !s.state.is_terminal())
                .cloned()
                .collect()
        };
        for session in doomed {
            let version = self
                .versions
                .get_version(&session.file_id, &session.version_id)
                .await?;
            self.fail_session(&session.session_id, &version, node_id, reason)
                .await?;
        }
        Ok(())
    }

    /// Forget per-target replica bookkeeping when a node is removed
    pub async fn forget_node(&self, node_id: &str) {
        self.replica_state
            .write()
            .await
            .retain(|(_, target), _| target != node_id);
        self.node_chunks.write().await.remove(node_id);
    }

    async fn emit_progress(
        &self,
        version: &FileVersion,
        target_id: &str,
        session_id: &str,
        progress: u8,
    ) -> AppResult<()> {
        let clock = self.clocks.tick(&version.created_by_node).await;
        self.events
            .append(
                version.created_by_node.clone(),
                Some(version.file_id.clone()),
                EventPayload::SyncProgress {
                    session_id: session_id.to_string(),
                    source: version.created_by_node.clone(),
                    target: target_id.to_string(),
                    version_id: version.version_id.clone(),
                    progress,
                },
                clock,
            )
            .await?;
        Ok(())
    }

    async fn set_state(&self, session_id: &str, state: SessionState, reason: Option<String>) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.state = state;
            if reason.is_some() {
                session.failure_reason = reason;
                session.completed_at = Some(crate::core::current_time_millis());
            }
        }
    }

    async fn lane(&self, file_id: &str, target_id: &str) -> Arc<Mutex<()>> {
        let mut lanes = self.lanes.lock().await;
        lanes
            .entry((file_id.to_string(), target_id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn target_slot(&self, target_id: &str) -> Arc<Semaphore> {
        let mut slots = self.target_slots.lock().await;
        slots
            .entry(target_id.to_string())
            .or_insert_with(|| {
                Arc::new(Semaphore::new(self.config.max_parallel_sessions_per_target))
            })
            .clone()
    }

    pub async fn sessions_for_target(&self, node_id: &str) -> Vec<ReplicationSession> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.target_node == node_id)
            .cloned()
            .collect()
    }

    /// Signature the target last applied for a file, if any
    pub async fn replica_signature(
        &self,
        file_id: &str,
        node_id: &str,
    ) -> Option<Vec<crate::models::ChunkSignature>> {
        self.replica_state
            .read()
            .await
            .get(&(file_id.to_string(), node_id.to_string()))
            .cloned()
    }

    pub async fn stats(&self) -> ReplicationStats {
        *self.stats.read().await
    }
}
