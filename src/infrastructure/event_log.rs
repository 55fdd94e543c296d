// Causally consistent audit of replication activity, with a bounded push
// channel for dashboards and node listeners. Slow subscribers lag and drop
// messages; they never block producers.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::core::vector_clock::causal_sort;
use crate::core::{FileId, NodeId};
use crate::error::AppResult;
use crate::infrastructure::metadata_store::MetadataStore;
use crate::models::{EventPayload, SyncEvent};

const BROADCAST_CAPACITY: usize = 256;

pub struct EventLog {
    /// Recent window, newest at the back
    events: Arc<RwLock<VecDeque<SyncEvent>>>,
    max_log_size: usize,
    sender: broadcast::Sender<SyncEvent>,
    metadata: Arc<MetadataStore>,
}

impl EventLog {
    pub fn new(metadata: Arc<MetadataStore>, max_log_size: usize) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            events: Arc::new(RwLock::new(VecDeque::new())),
            max_log_size,
            sender,
            metadata,
        }
    }

    /// Append an event: persist, publish to subscribers, keep in the window
    pub async fn append(
        &self,
        node_id: NodeId,
        file_id: Option<FileId>,
        payload: EventPayload,
        vector_clock: crate::core::vector_clock::VectorClock,
    ) -> AppResult<SyncEvent> {
        let mut event = SyncEvent::new(node_id, file_id, payload, vector_clock);
        self.metadata.insert_event(&event).await?;

        // receiver_count == 0 just means nobody is listening yet
        if self.sender.send(event.clone()).is_ok() {
            event.processed = true;
            self.metadata.mark_event_processed(&event.event_id).await?;
        }

        debug!(
            "Event {} appended ({})",
            event.event_id,
            event.event_type.as_str()
        );

        let mut events = self.events.write().await;
        events.push_back(event.clone());
        if events.len() > self.max_log_size {
            events.pop_front();
            warn!("Event window full, dropping oldest entry");
        }
        Ok(event)
    }

    /// Fatal-path event: kept in the window and pushed to subscribers but
    /// never persisted, because the metadata store is what just failed
    pub async fn broadcast_unpersisted(&self, mut event: SyncEvent) {
        if self.sender.send(event.clone()).is_ok() {
            event.processed = true;
        }
        let mut events = self.events.write().await;
        events.push_back(event);
        if events.len() > self.max_log_size {
            events.pop_front();
        }
    }

    /// Most-recent-first slice of the in-memory window
    pub async fn recent(&self, limit: usize) -> Vec<SyncEvent> {
        self.events
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// The same window, in an order consistent with happens-before
    pub async fn causal_recent(&self, limit: usize) -> Vec<SyncEvent> {
        let window: Vec<SyncEvent> = {
            let events = self.events.read().await;
            let skip = events.len().saturating_sub(limit);
            events.iter().skip(skip).cloned().collect()
        };
        causal_sort(window)
    }

    /// Push channel. Subscribers receive only events appended after this
    /// call; there is no replay.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Node-removal cascade: drop the removed node's events from the window
    pub async fn purge_node(&self, node_id: &str) {
        self.events
            .write()
            .await
            .retain(|event| event.node_id != node_id);
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vector_clock::VectorClock;
    use crate::models::{NodeInfo, NodeStatus};

    async fn log() -> EventLog {
        let metadata = Arc::new(MetadataStore::new("sqlite::memory:").await.unwrap());
        metadata.init().await.unwrap();
        // Seed the node the events will be authored under
        metadata
            .upsert_node(&NodeInfo {
                node_id: "n1".into(),
                name: "node n1".into(),
                address: "127.0.0.1".into(),
                port: 9000,
                capabilities: vec![],
                status: NodeStatus::Online,
                registered_at: 0,
                last_heartbeat: 0,
            })
            .await
            .unwrap();
        EventLog::new(metadata, 100)
    }

    fn clock(node: &str, value: u64) -> VectorClock {
        let mut vc = VectorClock::new();
        vc.clocks.insert(node.to_string(), value);
        vc
    }

    fn payload(reason: &str) -> EventPayload {
        EventPayload::NodeRemoved {
            reason: reason.to_string(),
        }
    }

    #[tokio::test]
    async fn test_recent_is_most_recent_first() {
        let log = log().await;
        log.append("n1".into(), None, payload("a"), clock("n1", 1))
            .await
            .unwrap();
        log.append("n1".into(), None, payload("b"), clock("n1", 2))
            .await
            .unwrap();
        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert!(matches!(
            &recent[0].data,
            EventPayload::NodeRemoved { reason } if reason == "b"
        ));
    }

    #[tokio::test]
    async fn test_causal_recent_orders_by_clock() {
        let log = log().await;
        // Appended out of causal order
        log.append("n1".into(), None, payload("second"), clock("n1", 2))
            .await
            .unwrap();
        log.append("n1".into(), None, payload("first"), clock("n1", 1))
            .await
            .unwrap();
        let causal = log.causal_recent(10).await;
        assert!(matches!(
            &causal[0].data,
            EventPayload::NodeRemoved { reason } if reason == "first"
        ));
    }

    #[tokio::test]
    async fn test_subscribers_see_only_later_events() {
        let log = log().await;
        log.append("n1".into(), None, payload("before"), clock("n1", 1))
            .await
            .unwrap();
        let mut rx = log.subscribe();
        log.append("n1".into(), None, payload("after"), clock("n1", 2))
            .await
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert!(matches!(
            received.data,
            EventPayload::NodeRemoved { ref reason } if reason == "after"
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_window_trims_at_capacity() {
        let metadata = Arc::new(MetadataStore::new("sqlite::memory:").await.unwrap());
        metadata.init().await.unwrap();
        metadata
            .upsert_node(&NodeInfo {
                node_id: "n1".into(),
                name: "n".into(),
                address: "a".into(),
                port: 1,
                capabilities: vec![],
                status: NodeStatus::Online,
                registered_at: 0,
                last_heartbeat: 0,
            })
            .await
            .unwrap();
        let log = EventLog::new(metadata, 2);
        for i in 0..3 {
            log.append("n1".into(), None, payload(&format!("e{}", i)), clock("n1", i + 1))
                .await
                .unwrap();
        }
        assert_eq!(log.len().await, 2);
        let recent = log.recent(10).await;
        assert!(matches!(
            &recent[1].data,
            EventPayload::NodeRemoved { reason } if reason == "e1"
        ));
    }
}
