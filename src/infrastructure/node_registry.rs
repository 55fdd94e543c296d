// Fleet membership: registration, heartbeats, offline detection.
// Node removal cascades are driven by the coordinator; the registry only
// owns the in-memory membership view.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::core::{current_time_millis, NodeId};
use crate::error::{AppError, AppResult};
use crate::models::{NodeInfo, NodeStatus, RegisterNodeRequest};

#[derive(Debug, Clone)]
pub struct NodeRegistry {
    nodes: Arc<RwLock<HashMap<NodeId, NodeInfo>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a node or bring a known node back online with fresh details
    pub async fn register(&self, req: RegisterNodeRequest) -> NodeInfo {
        let now = current_time_millis();
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .entry(req.node_id.clone())
            .and_modify(|existing| {
                existing.name = req.name.clone();
                existing.address = req.address.clone();
                existing.port = req.port;
                existing.capabilities = req.capabilities.clone();
                existing.status = NodeStatus::Online;
                existing.last_heartbeat = now;
            })
            .or_insert_with(|| NodeInfo {
                node_id: req.node_id.clone(),
                name: req.name,
                address: req.address,
                port: req.port,
                capabilities: req.capabilities,
                status: NodeStatus::Online,
                registered_at: now,
                last_heartbeat: now,
            });
        info!("Node {} registered ({})", node.node_id, node.name);
        node.clone()
    }

    pub async fn heartbeat(&self, node_id: &str) -> AppResult<()> {
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(node_id) {
            Some(node) => {
                node.last_heartbeat = current_time_millis();
                if node.status == NodeStatus::Offline {
                    info!("Node {} back online", node_id);
                    node.status = NodeStatus::Online;
                }
                Ok(())
            }
            None => Err(AppError::NotFound(format!("node {} not registered", node_id))),
        }
    }

    pub async fn get(&self, node_id: &str) -> AppResult<NodeInfo> {
        self.nodes
            .read()
            .await
            .get(node_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("node {} not registered", node_id)))
    }

    pub async fn list(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.nodes.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub async fn online_nodes(&self) -> Vec<NodeInfo> {
        self.list()
            .await
            .into_iter()
            .filter(|n| n.status == NodeStatus::Online)
            .collect()
    }

    pub async fn is_online(&self, node_id: &str) -> bool {
        self.nodes
            .read()
            .await
            .get(node_id)
            .map(|n| n.status == NodeStatus::Online)
            .unwrap_or(false)
    }

    pub async fn remove(&self, node_id: &str) -> AppResult<NodeInfo> {
        self.nodes
            .write()
            .await
            .remove(node_id)
            .ok_or_else(|| AppError::NotFound(format!("node {} not registered", node_id)))
    }

    pub async fn mark_offline(&self, node_id: &str) {
        if let Some(node) = self.nodes.write().await.get_mut(node_id) {
            node.status = NodeStatus::Offline;
        }
    }

    /// Flip nodes whose heartbeat is older than the cutoff to offline;
    /// returns the ids that transitioned on this sweep.
    pub async fn sweep_offline(&self, offline_after_ms: u64) -> Vec<NodeId> {
        let cutoff = current_time_millis() - offline_after_ms as i64;
        let mut newly_offline = Vec::new();
        let mut nodes = self.nodes.write().await;
        for node in nodes.values_mut() {
            if node.status == NodeStatus::Online && node.last_heartbeat < cutoff {
                warn!("Node {} missed heartbeats, marking offline", node.node_id);
                node.status = NodeStatus::Offline;
                newly_offline.push(node.node_id.clone());
            }
        }
        newly_offline
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
