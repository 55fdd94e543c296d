// Replication engine infrastructure
pub mod cache; // Reconstructed-content cache
pub mod chunk_store; // Content-addressable chunk bodies
pub mod delta_engine; // Signatures, deltas, reconstruction
pub mod event_log; // Causal audit log and push channel
pub mod metadata_store; // SQLite persistence
pub mod node_registry; // Fleet membership and heartbeats
pub mod replication; // Fan-out orchestrator
pub mod version_store; // Immutable version DAGs

// Re-export core infrastructure components
pub use cache::ContentCache;
pub use chunk_store::{ChunkStore, ChunkStoreStats};
pub use delta_engine::DeltaEngine;
pub use event_log::EventLog;
pub use metadata_store::MetadataStore;
pub use node_registry::NodeRegistry;
pub use replication::{
    CoordinatorTransport, PeerTransport, ReplicationOrchestrator, ReplicationStats,
};
pub use version_store::{VersionOutcome, VersionStore};
