// End-to-end flows through the composed coordinator: fan-out, delta reuse,
// concurrent modification, stale uploads, mid-session failure and restore.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use sync_coordinator::config::{CacheConfig, Config, DatabaseConfig, ServerConfig, SyncConfig};
use sync_coordinator::coordinator::SyncCoordinator;
use sync_coordinator::core::vector_clock::VectorClock;
use sync_coordinator::core::sha256_hex;
use sync_coordinator::error::{AppError, AppResult};
use sync_coordinator::infrastructure::replication::PeerTransport;
use sync_coordinator::infrastructure::DeltaEngine;
use sync_coordinator::models::{
    Delta, DeltaOp, EventPayload, EventType, NodeInfo, RegisterNodeRequest, SessionState,
};

const CHUNK: usize = 4096;

fn test_config(database_url: &str) -> Config {
    Config {
        database: DatabaseConfig {
            url: database_url.to_string(),
        },
        server: ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        },
        cache: CacheConfig { capacity: 64 },
        sync: SyncConfig::default(),
    }
}

async fn coordinator() -> SyncCoordinator {
    SyncCoordinator::new(test_config("sqlite::memory:"))
        .await
        .unwrap()
}

async fn register(coordinator: &SyncCoordinator, node_id: &str) {
    coordinator
        .register_node(RegisterNodeRequest {
            node_id: node_id.to_string(),
            name: format!("node {}", node_id),
            address: "127.0.0.1".into(),
            port: 9000,
            capabilities: vec!["sync".into()],
        })
        .await
        .unwrap();
}

fn clock(entries: &[(&str, u64)]) -> VectorClock {
    let mut vc = VectorClock::new();
    for (node, value) in entries {
        vc.clocks.insert(node.to_string(), *value);
    }
    vc
}

/// Transport that delivers a bounded number of chunks, then drops the link.
/// A negative budget delivers everything.
struct FlakyTransport {
    budget: AtomicI64,
}

#[async_trait::async_trait]
impl PeerTransport for FlakyTransport {
    async fn send_delta(&self, _target: &NodeInfo, _file_id: &str, _delta: &Delta) -> AppResult<()> {
        Ok(())
    }

    async fn send_chunk(
        &self,
        _target: &NodeInfo,
        _chunk_hash: &str,
        _bytes: &[u8],
    ) -> AppResult<()> {
        let budget = self.budget.load(Ordering::SeqCst);
        if budget < 0 {
            return Ok(());
        }
        if budget == 0 {
            return Err(AppError::Transport("peer link dropped".into()));
        }
        self.budget.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn initial_upload_fans_out_to_all_peers() {
    let coordinator = coordinator().await;
    for node in ["n1", "n2", "n3"] {
        register(&coordinator, node).await;
    }

    // 10 KiB -> two full chunks and one short tail
    let content: Vec<u8> = (0..10 * 1024).map(|i| (i % 251) as u8).collect();
    let outcome = coordinator
        .upload_file("report.bin", "report.bin", content.clone(), "n1", None)
        .await
        .unwrap();

    assert_eq!(outcome.session_ids.len(), 2);
    assert!(outcome.conflict.is_none());
    assert_eq!(outcome.delta_metrics.bytes_saved, 0);
    assert_eq!(outcome.delta_metrics.bytes_transferred, content.len() as u64);

    for target in ["n2", "n3"] {
        let sessions = coordinator.sessions_for_target(target).await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].state, SessionState::Completed);
        assert_eq!(sessions[0].bytes_transferred, content.len() as u64);
        assert_eq!(
            coordinator
                .replica_signature("report.bin", target)
                .await
                .unwrap(),
            outcome.version.chunk_list
        );
    }

    let heads = coordinator.file_heads("report.bin").await.unwrap();
    assert_eq!(heads.len(), 1);

    let events = coordinator.recent_events(100).await;
    let completed = events
        .iter()
        .filter(|e| e.event_type == EventType::SyncCompleted)
        .count();
    assert_eq!(completed, 2);

    // Progress per session is monotonic and ends at 100
    for session_id in &outcome.session_ids {
        let mut progress: Vec<u8> = events
            .iter()
            .rev()
            .filter_map(|e| match &e.data {
                EventPayload::SyncProgress {
                    session_id: sid,
                    progress,
                    ..
                } if sid == session_id => Some(*progress),
                _ => None,
            })
            .collect();
        assert!(progress.len() >= 3);
        assert_eq!(progress.last(), Some(&100));
        let mut sorted = progress.clone();
        sorted.sort_unstable();
        assert_eq!(progress, sorted);
        progress.dedup();
        assert_eq!(progress.first(), Some(&0));
    }

    assert_eq!(
        coordinator.content("report.bin").await.unwrap(),
        content
    );
}

#[tokio::test]
async fn second_upload_reuses_unchanged_chunks() {
    let coordinator = coordinator().await;
    for node in ["n1", "n2"] {
        register(&coordinator, node).await;
    }

    let base: Vec<u8> = (0..3 * CHUNK).map(|i| (i % 251) as u8).collect();
    coordinator
        .upload_file("report.bin", "report.bin", base.clone(), "n1", None)
        .await
        .unwrap();

    // Only the middle chunk changes
    let mut modified = base.clone();
    modified[CHUNK..2 * CHUNK].fill(0xAB);
    let outcome = coordinator
        .upload_file("report.bin", "report.bin", modified.clone(), "n1", None)
        .await
        .unwrap();

    assert_eq!(outcome.delta_metrics.chunks_copied, 2);
    assert_eq!(outcome.delta_metrics.chunks_inserted, 1);
    assert_eq!(outcome.delta_metrics.bytes_saved, (2 * CHUNK) as u64);
    assert!((outcome.delta_metrics.compression_ratio - 2.0 / 3.0).abs() < 0.01);

    // Exactly one chunk body crossed to n2 on the second session
    let sessions = coordinator.sessions_for_target("n2").await;
    assert_eq!(sessions.len(), 2);
    let second = sessions
        .iter()
        .find(|s| s.version_id == outcome.version.version_id)
        .unwrap();
    assert_eq!(second.state, SessionState::Completed);
    assert_eq!(second.bytes_transferred, CHUNK as u64);

    let completed_metrics = coordinator
        .recent_events(100)
        .await
        .into_iter()
        .find_map(|e| match e.data {
            EventPayload::SyncCompleted {
                version_id,
                delta_metrics,
                ..
            } if version_id == outcome.version.version_id => Some(delta_metrics),
            _ => None,
        })
        .unwrap();
    assert_eq!(completed_metrics.bytes_saved, (2 * CHUNK) as u64);
    assert_eq!(completed_metrics.bytes_transferred, CHUNK as u64);

    assert_eq!(coordinator.content("report.bin").await.unwrap(), modified);
}

#[tokio::test]
async fn delta_upload_splices_into_the_head() {
    let coordinator = coordinator().await;
    for node in ["n1", "n2"] {
        register(&coordinator, node).await;
    }

    let base: Vec<u8> = (0..3 * CHUNK).map(|i| (i % 251) as u8).collect();
    coordinator
        .upload_file("report.bin", "report.bin", base.clone(), "n1", None)
        .await
        .unwrap();

    // Client-built delta: keep chunks 0 and 2, replace the middle
    let signature = coordinator.head_signature("report.bin").await.unwrap();
    let new_middle = vec![0xCDu8; CHUNK];
    let mut expected = base.clone();
    expected[CHUNK..2 * CHUNK].copy_from_slice(&new_middle);

    let delta = Delta {
        base_signature_digest: DeltaEngine::signature_digest(&signature),
        operations: vec![
            DeltaOp::Copy {
                from_index: 0,
                count: 1,
                size: CHUNK as u64,
            },
            DeltaOp::Insert {
                index: 1,
                chunk_hash: sha256_hex(&new_middle),
                size: CHUNK,
                bytes: Some(new_middle),
            },
            DeltaOp::Copy {
                from_index: 2,
                count: 1,
                size: CHUNK as u64,
            },
        ],
    };

    let outcome = coordinator
        .submit_delta("report.bin", &delta, &sha256_hex(&expected), "n2", None)
        .await
        .unwrap();
    assert!(outcome.conflict.is_none());
    assert_eq!(coordinator.content("report.bin").await.unwrap(), expected);
    assert_eq!(outcome.delta_metrics.chunks_copied, 2);
    assert_eq!(outcome.delta_metrics.chunks_inserted, 1);

    // Inserts may omit bytes for chunks the coordinator already holds:
    // revert the middle chunk by hash alone (its body is still referenced
    // by the first version)
    let new_head_signature = coordinator.head_signature("report.bin").await.unwrap();
    let revert = Delta {
        base_signature_digest: DeltaEngine::signature_digest(&new_head_signature),
        operations: vec![
            DeltaOp::Copy {
                from_index: 0,
                count: 1,
                size: CHUNK as u64,
            },
            DeltaOp::Insert {
                index: 1,
                chunk_hash: sha256_hex(&base[CHUNK..2 * CHUNK]),
                size: CHUNK,
                bytes: None,
            },
            DeltaOp::Copy {
                from_index: 2,
                count: 1,
                size: CHUNK as u64,
            },
        ],
    };
    coordinator
        .submit_delta("report.bin", &revert, &sha256_hex(&base), "n2", None)
        .await
        .unwrap();
    assert_eq!(coordinator.content("report.bin").await.unwrap(), base);

    // A bytes-less insert whose chunk the store lacks is rejected
    let head_signature = coordinator.head_signature("report.bin").await.unwrap();
    let unknown = Delta {
        base_signature_digest: DeltaEngine::signature_digest(&head_signature),
        operations: vec![DeltaOp::Insert {
            index: 0,
            chunk_hash: sha256_hex(b"never uploaded"),
            size: 14,
            bytes: None,
        }],
    };
    let err = coordinator
        .submit_delta(
            "report.bin",
            &unknown,
            &sha256_hex(b"never uploaded"),
            "n2",
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::MissingChunk(_)));

    // A delta against a mismatched base is rejected outright
    let bad = Delta {
        base_signature_digest: "not-the-base".into(),
        operations: vec![],
    };
    let err = coordinator
        .submit_delta("report.bin", &bad, &sha256_hex(b""), "n2", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::DeltaIntegrity(_)));
}

#[tokio::test]
async fn empty_file_round_trips() {
    let coordinator = coordinator().await;
    for node in ["n1", "n2"] {
        register(&coordinator, node).await;
    }

    let outcome = coordinator
        .upload_file("empty.bin", "empty.bin", Vec::new(), "n1", None)
        .await
        .unwrap();
    assert_eq!(outcome.version.size, 0);
    assert!(outcome.version.chunk_list.is_empty());
    assert_eq!(outcome.delta_metrics.chunks_total, 0);

    let sessions = coordinator.sessions_for_target("n2").await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].state, SessionState::Completed);
    assert_eq!(sessions[0].bytes_transferred, 0);

    assert!(coordinator.content("empty.bin").await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_modifications_surface_a_conflict() {
    let coordinator = coordinator().await;
    for node in ["n1", "n2", "n3"] {
        register(&coordinator, node).await;
    }

    let base = vec![1u8; CHUNK];
    coordinator
        .upload_file("doc.txt", "doc.txt", base, "n1", Some(clock(&[("n1", 1)])))
        .await
        .unwrap();

    // n2 and n3 both extend the same base without seeing each other
    let from_n2 = coordinator
        .upload_file(
            "doc.txt",
            "doc.txt",
            vec![2u8; CHUNK],
            "n2",
            Some(clock(&[("n1", 1), ("n2", 1)])),
        )
        .await
        .unwrap();
    assert!(from_n2.conflict.is_none());

    let from_n3 = coordinator
        .upload_file(
            "doc.txt",
            "doc.txt",
            vec![3u8; CHUNK],
            "n3",
            Some(clock(&[("n1", 1), ("n3", 1)])),
        )
        .await
        .unwrap();

    let conflict = from_n3.conflict.expect("concurrent upload must conflict");
    assert_eq!(coordinator.file_heads("doc.txt").await.unwrap().len(), 2);

    let conflicts = coordinator.conflicts(false).await;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_id, conflict.conflict_id);

    let events = coordinator.recent_events(100).await;
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::ConflictDetected));

    // Both branches stay queryable through history
    let history = coordinator.history("doc.txt").await.unwrap();
    assert!(history
        .iter()
        .any(|v| v.version_id == from_n2.version.version_id));
    assert!(history
        .iter()
        .any(|v| v.version_id == from_n3.version.version_id));

    // Resolution collapses the heads and is audited with a merged clock
    let (resolved, merged) = coordinator
        .resolve_conflict(&conflict.conflict_id, &from_n2.version.version_id)
        .await
        .unwrap();
    assert!(resolved.resolved);
    assert_eq!(coordinator.file_heads("doc.txt").await.unwrap().len(), 1);
    assert!(merged.vector_clock.dominates(&from_n2.version.vector_clock));
    assert!(merged.vector_clock.dominates(&from_n3.version.vector_clock));
    assert!(coordinator
        .recent_events(100)
        .await
        .iter()
        .any(|e| e.event_type == EventType::ConflictResolved));
}

#[tokio::test]
async fn stale_clock_rejected_but_concurrent_clock_accepted() {
    let coordinator = coordinator().await;
    for node in ["n1", "n2"] {
        register(&coordinator, node).await;
    }

    coordinator
        .upload_file("doc.txt", "doc.txt", vec![1u8; 10], "n1", Some(clock(&[("n1", 1)])))
        .await
        .unwrap();
    coordinator
        .upload_file("doc.txt", "doc.txt", vec![2u8; 10], "n1", Some(clock(&[("n1", 2)])))
        .await
        .unwrap();

    // Strictly below the head: rejected, nothing changes
    let err = coordinator
        .upload_file("doc.txt", "doc.txt", vec![3u8; 10], "n1", Some(clock(&[("n1", 1)])))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::StaleVersion(_)));
    assert_eq!(coordinator.file_heads("doc.txt").await.unwrap().len(), 1);

    // The same bytes under a concurrent clock are accepted and flagged
    let outcome = coordinator
        .upload_file("doc.txt", "doc.txt", vec![3u8; 10], "n2", Some(clock(&[("n2", 1)])))
        .await
        .unwrap();
    assert!(outcome.conflict.is_some());
    assert_eq!(coordinator.file_heads("doc.txt").await.unwrap().len(), 2);
}

#[tokio::test]
async fn failed_session_resumes_with_only_missing_chunks() {
    let transport = Arc::new(FlakyTransport {
        budget: AtomicI64::new(2),
    });
    let coordinator =
        SyncCoordinator::with_transport(test_config("sqlite::memory:"), transport.clone())
            .await
            .unwrap();
    for node in ["n1", "n2"] {
        register(&coordinator, node).await;
    }

    // Three full chunks; the link drops after two of them
    let content: Vec<u8> = (0..3 * CHUNK).map(|i| (i % 239) as u8).collect();
    let outcome = coordinator
        .upload_file("big.bin", "big.bin", content.clone(), "n1", None)
        .await
        .unwrap();

    let sessions = coordinator.sessions_for_target("n2").await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].state, SessionState::Failed);
    assert!(coordinator
        .recent_events(100)
        .await
        .iter()
        .any(|e| e.event_type == EventType::SyncError));
    assert!(coordinator.replica_signature("big.bin", "n2").await.is_none());

    // Link restored; an explicit re-replication ships only the third chunk
    transport.budget.store(-1, Ordering::SeqCst);
    let catch_up = coordinator.catch_up("n2").await.unwrap();
    assert_eq!(catch_up.len(), 1);

    let sessions = coordinator.sessions_for_target("n2").await;
    let resumed = sessions
        .iter()
        .find(|s| s.session_id == catch_up[0])
        .unwrap();
    assert_eq!(resumed.state, SessionState::Completed);
    assert_eq!(resumed.bytes_transferred, CHUNK as u64);
    assert_eq!(
        coordinator
            .replica_signature("big.bin", "n2")
            .await
            .unwrap(),
        outcome.version.chunk_list
    );
}

#[tokio::test]
async fn offline_target_is_skipped_entirely() {
    let coordinator = coordinator().await;
    for node in ["n1", "n2", "n3"] {
        register(&coordinator, node).await;
    }
    coordinator.force_offline("n3").await.unwrap();

    let outcome = coordinator
        .upload_file("doc.txt", "doc.txt", vec![9u8; 100], "n1", None)
        .await
        .unwrap();
    assert_eq!(outcome.session_ids.len(), 1);
    assert!(coordinator.sessions_for_target("n3").await.is_empty());
}

#[tokio::test]
async fn restore_creates_a_forward_version() {
    let coordinator = coordinator().await;
    register(&coordinator, "n1").await;

    let contents = [
        (0..CHUNK).map(|i| (i % 7) as u8).collect::<Vec<u8>>(),
        (0..CHUNK).map(|i| (i % 11) as u8).collect::<Vec<u8>>(),
        (0..CHUNK).map(|i| (i % 13) as u8).collect::<Vec<u8>>(),
    ];
    let mut versions = Vec::new();
    for content in &contents {
        let outcome = coordinator
            .upload_file("doc.txt", "doc.txt", content.clone(), "n1", None)
            .await
            .unwrap();
        versions.push(outcome.version);
    }

    let restored = coordinator
        .restore("doc.txt", &versions[0].version_id, "n1")
        .await
        .unwrap()
        .version;

    let heads = coordinator.file_heads("doc.txt").await.unwrap();
    assert_eq!(heads.len(), 1);
    assert_eq!(heads[0].version_id, restored.version_id);
    assert_eq!(coordinator.content("doc.txt").await.unwrap(), contents[0]);
    assert!(restored.vector_clock.dominates(&versions[2].vector_clock));
    assert_ne!(restored.vector_clock, versions[2].vector_clock);

    let history = coordinator.history("doc.txt").await.unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].version_id, versions[0].version_id);
    assert_eq!(history[3].version_id, restored.version_id);
}

#[tokio::test]
async fn node_removal_cascades_events_and_clocks() {
    let coordinator = coordinator().await;
    for node in ["n1", "n2"] {
        register(&coordinator, node).await;
    }
    coordinator
        .upload_file("doc.txt", "doc.txt", vec![4u8; 50], "n1", None)
        .await
        .unwrap();

    coordinator.remove_node("n2").await.unwrap();
    assert!(coordinator.get_node("n2").await.is_err());
    assert!(!coordinator.vector_clocks().await.contains_key("n2"));

    let events = coordinator.recent_events(200).await;
    // n2's own events were cascaded away; the tombstone remains
    assert!(events
        .iter()
        .all(|e| e.node_id != "n2" || e.event_type == EventType::NodeRemoved));
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::NodeRemoved));
}

#[tokio::test]
async fn event_clocks_at_one_node_are_monotonic() {
    let coordinator = coordinator().await;
    for node in ["n1", "n2"] {
        register(&coordinator, node).await;
    }
    for round in 0..3u8 {
        coordinator
            .upload_file("doc.txt", "doc.txt", vec![round; 2 * CHUNK], "n1", None)
            .await
            .unwrap();
    }

    let events = coordinator.causal_events(200).await;
    let mut last_n1 = 0u64;
    for event in events.iter().filter(|e| e.node_id == "n1") {
        let entry = event.vector_clock.get("n1");
        assert!(entry >= last_n1, "clock at n1 regressed: {} < {}", entry, last_n1);
        last_n1 = entry;
    }
    assert!(last_n1 > 0);
}

#[tokio::test]
async fn registered_nodes_survive_a_coordinator_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("coordinator.db");
    let url = format!("sqlite://{}?mode=rwc", db_path.display());

    {
        let coordinator = SyncCoordinator::new(test_config(&url)).await.unwrap();
        register(&coordinator, "n1").await;
    }

    let coordinator = SyncCoordinator::new(test_config(&url)).await.unwrap();
    let nodes = coordinator.list_nodes().await;
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].node_id, "n1");
}
