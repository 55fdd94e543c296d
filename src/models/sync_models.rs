// Data model for nodes, versions, chunks, deltas, events and conflicts.
// All boundary DTOs are named records; internal code never handles untyped maps.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::vector_clock::{CausallyOrdered, VectorClock};
use crate::core::{current_time_millis, FileId, NodeId, VersionId};

/// A registered client node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub capabilities: Vec<String>,
    pub status: NodeStatus,
    pub registered_at: i64,       // epoch millis
    pub last_heartbeat: i64,      // epoch millis
}

impl NodeInfo {
    pub fn supports_sync(&self) -> bool {
        self.capabilities.iter().any(|c| c == "sync")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
}

/// Registration payload accepted at /register
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    pub node_id: NodeId,
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Identity of one fixed-offset chunk of a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSignature {
    pub index: usize,
    pub offset: u64,
    pub size: usize,
    pub hash: String, // hex SHA-256 of the chunk bytes
}

/// Tracked file metadata (name is what clients display; id is authoritative)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub file_id: FileId,
    pub name: String,
    pub created_at: i64,
}

/// One immutable version in a file's DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileVersion {
    pub file_id: FileId,
    pub version_id: VersionId,
    pub parent_version_ids: Vec<VersionId>,
    pub vector_clock: VectorClock,
    pub chunk_list: Vec<ChunkSignature>,
    pub size: u64,
    pub content_hash: String, // hex SHA-256 of the concatenated ordered chunks
    pub created_by_node: NodeId,
    pub created_at: i64,
}

impl CausallyOrdered for FileVersion {
    fn clock(&self) -> &VectorClock {
        &self.vector_clock
    }
    fn tie_break(&self) -> (i64, &str) {
        (self.created_at, &self.version_id)
    }
}

/// One delta operation: either reuse a span of base chunks or splice new bytes.
/// Insert bytes are dropped before transmission when the receiver already
/// holds the chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DeltaOp {
    Copy {
        from_index: usize,
        count: usize,
        size: u64, // total bytes covered by the span
    },
    Insert {
        index: usize,
        chunk_hash: String,
        size: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        bytes: Option<Vec<u8>>,
    },
}

impl DeltaOp {
    pub fn byte_len(&self) -> u64 {
        match self {
            DeltaOp::Copy { size, .. } => *size,
            DeltaOp::Insert { size, .. } => *size as u64,
        }
    }
}

/// Copy/insert program transforming a base signature's content into new content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub base_signature_digest: String,
    pub operations: Vec<DeltaOp>,
}

/// Savings accounting for one delta
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeltaMetrics {
    pub chunks_total: usize,
    pub chunks_copied: usize,
    pub chunks_inserted: usize,
    pub bytes_transferred: u64,
    pub bytes_saved: u64,
    pub compression_ratio: f64, // bytes_saved / total_bytes
}

/// Closed set of event kinds the coordinator emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    NodeRegistered,
    NodeRemoved,
    FileModified,
    FileSyncProgress,
    SyncCompleted,
    SyncError,
    ConflictDetected,
    ConflictResolved,
    SystemFault,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::NodeRegistered => "node_registered",
            EventType::NodeRemoved => "node_removed",
            EventType::FileModified => "file_modified",
            EventType::FileSyncProgress => "file_sync_progress",
            EventType::SyncCompleted => "sync_completed",
            EventType::SyncError => "sync_error",
            EventType::ConflictDetected => "conflict_detected",
            EventType::ConflictResolved => "conflict_resolved",
            EventType::SystemFault => "system_fault",
        }
    }
}

/// Event payloads: the tag discriminates, each variant carries its fixed fields
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EventPayload {
    NodeRegistered {
        name: String,
        address: String,
        port: u16,
    },
    NodeRemoved {
        reason: String,
    },
    FileModified {
        file_name: String,
        version_id: VersionId,
        size: u64,
    },
    SyncProgress {
        session_id: String,
        source: NodeId,
        target: NodeId,
        version_id: VersionId,
        progress: u8, // 0..=100, quantized milestones
    },
    SyncCompleted {
        session_id: String,
        source: NodeId,
        target: NodeId,
        version_id: VersionId,
        bytes_transferred: u64,
        delta_metrics: DeltaMetrics,
    },
    SyncError {
        session_id: String,
        source: NodeId,
        target: NodeId,
        version_id: VersionId,
        reason: String,
    },
    ConflictDetected {
        conflict_id: String,
        version_a: VersionId,
        version_b: VersionId,
    },
    ConflictResolved {
        conflict_id: String,
        winner_version_id: VersionId,
        merged_version_id: VersionId,
    },
    SystemFault {
        detail: String,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::NodeRegistered { .. } => EventType::NodeRegistered,
            EventPayload::NodeRemoved { .. } => EventType::NodeRemoved,
            EventPayload::FileModified { .. } => EventType::FileModified,
            EventPayload::SyncProgress { .. } => EventType::FileSyncProgress,
            EventPayload::SyncCompleted { .. } => EventType::SyncCompleted,
            EventPayload::SyncError { .. } => EventType::SyncError,
            EventPayload::ConflictDetected { .. } => EventType::ConflictDetected,
            EventPayload::ConflictResolved { .. } => EventType::ConflictResolved,
            EventPayload::SystemFault { .. } => EventType::SystemFault,
        }
    }
}

/// One audited event, clock-stamped at issuance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub event_id: String,
    pub timestamp: i64, // epoch millis
    pub node_id: NodeId,
    pub file_id: Option<FileId>,
    pub event_type: EventType,
    pub data: EventPayload,
    pub vector_clock: VectorClock,
    pub processed: bool,
}

impl SyncEvent {
    pub fn new(
        node_id: NodeId,
        file_id: Option<FileId>,
        data: EventPayload,
        vector_clock: VectorClock,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: current_time_millis(),
            node_id,
            file_id,
            event_type: data.event_type(),
            data,
            vector_clock,
            processed: false,
        }
    }
}

impl CausallyOrdered for SyncEvent {
    fn clock(&self) -> &VectorClock {
        &self.vector_clock
    }
    fn tie_break(&self) -> (i64, &str) {
        (self.timestamp, &self.event_id)
    }
}

/// A detected pair of concurrent heads for one file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub conflict_id: String,
    pub file_id: FileId,
    pub version_a: VersionId,
    pub version_b: VersionId,
    pub detected_at: i64,
    pub resolved: bool,
    pub resolution: Option<VersionId>, // winning version once resolved
}

impl Conflict {
    pub fn new(file_id: FileId, version_a: VersionId, version_b: VersionId) -> Self {
        Self {
            conflict_id: Uuid::new_v4().to_string(),
            file_id,
            version_a,
            version_b,
            detected_at: current_time_millis(),
            resolved: false,
            resolution: None,
        }
    }
}

/// Replication session lifecycle. Failed is terminal but recoverable by an
/// explicit re-trigger (a new session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

/// One replication attempt: source node -> one target node for one version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSession {
    pub session_id: String,
    pub file_id: FileId,
    pub version_id: VersionId,
    pub source_node: NodeId,
    pub target_node: NodeId,
    pub state: SessionState,
    pub bytes_transferred: u64,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub failure_reason: Option<String>,
}

impl ReplicationSession {
    pub fn new(
        file_id: FileId,
        version_id: VersionId,
        source_node: NodeId,
        target_node: NodeId,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            file_id,
            version_id,
            source_node,
            target_node,
            state: SessionState::Pending,
            bytes_transferred: 0,
            created_at: current_time_millis(),
            completed_at: None,
            failure_reason: None,
        }
    }
}
