// Typed records for the replication engine

pub mod sync_models;

pub use sync_models::{
    ChunkSignature, Conflict, Delta, DeltaMetrics, DeltaOp, EventPayload, EventType, FileMeta,
    FileVersion, NodeInfo, NodeStatus, RegisterNodeRequest, ReplicationSession, SessionState,
    SyncEvent,
};
