// Vector clocks for causal ordering of replication events
// Comparison semantics: pointwise over the union of node keys, absent keys read 0

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::NodeId;

/// Per-node logical counter map providing the happens-before relation.
/// Serializes as the bare map, which is also its wire format.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct VectorClock {
    pub clocks: HashMap<NodeId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self {
            clocks: HashMap::new(),
        }
    }

    /// Read an entry; absent keys are zero
    pub fn get(&self, node_id: &str) -> u64 {
        self.clocks.get(node_id).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, node_id: &str) {
        *self.clocks.entry(node_id.to_string()).or_insert(0) += 1;
    }

    /// Pointwise max with another clock
    pub fn merge(&mut self, other: &VectorClock) {
        for (node_id, clock) in &other.clocks {
            let current = self.clocks.entry(node_id.clone()).or_insert(0);
            *current = (*current).max(*clock);
        }
    }

    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_greater = false;
        let mut other_greater = false;

        let mut all_nodes: HashSet<&str> = self.clocks.keys().map(|k| k.as_str()).collect();
        all_nodes.extend(other.clocks.keys().map(|k| k.as_str()));

        for node_id in all_nodes {
            let self_clock = self.get(node_id);
            let other_clock = other.get(node_id);

            if self_clock > other_clock {
                self_greater = true;
            } else if other_clock > self_clock {
                other_greater = true;
            }
        }

        match (self_greater, other_greater) {
            (true, false) => ClockOrdering::Greater,
            (false, true) => ClockOrdering::Less,
            (false, false) => ClockOrdering::Equal,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// Componentwise >= over the union of keys
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(
            self.compare(other),
            ClockOrdering::Greater | ClockOrdering::Equal
        )
    }

    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    Less,
    Greater,
    Equal,
    Concurrent,
}

/// Items that carry a vector clock and a deterministic tie-break key.
/// Events and file versions both sort causally through this seam.
pub trait CausallyOrdered {
    fn clock(&self) -> &VectorClock;
    /// (timestamp, id) — lexicographic tie-break between concurrent items
    fn tie_break(&self) -> (i64, &str);
}

/// Total order refining happens-before: Kahn topological sort over the DAG
/// with an edge u -> v iff u.clock < v.clock, concurrent items ordered by
/// (timestamp, id).
pub fn causal_sort<T: CausallyOrdered>(mut items: Vec<T>) -> Vec<T> {
    let n = items.len();
    if n <= 1 {
        return items;
    }

    let mut indegree = vec![0usize; n];
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        for j in 0..n {
            if i != j && items[i].clock().compare(items[j].clock()) == ClockOrdering::Less {
                edges[i].push(j);
                indegree[j] += 1;
            }
        }
    }

    let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while !ready.is_empty() {
        // Smallest tie-break key among the ready set keeps the order deterministic
        let pos = ready
            .iter()
            .enumerate()
            .min_by_key(|(_, &i)| {
                let (ts, id) = items[i].tie_break();
                (ts, id.to_string())
            })
            .map(|(pos, _)| pos)
            .unwrap();
        let next = ready.swap_remove(pos);
        order.push(next);
        for &succ in &edges[next] {
            indegree[succ] -= 1;
            if indegree[succ] == 0 {
                ready.push(succ);
            }
        }
    }

    // Re-emit items in the computed order
    let mut slots: Vec<Option<T>> = items.drain(..).map(Some).collect();
    order
        .into_iter()
        .map(|i| slots[i].take().unwrap())
        .collect()
}

/// True iff any head's clock is concurrent with the candidate clock
pub fn is_concurrent_with_any<'a, I>(vc: &VectorClock, heads: I) -> bool
where
    I: IntoIterator<Item = &'a VectorClock>,
{
    heads.into_iter().any(|head| vc.is_concurrent(head))
}

/// Authoritative per-node clock snapshots for the whole fleet.
/// Operations are in-memory and infallible; persistence rides on events.
#[derive(Debug, Clone)]
pub struct ClockManager {
    clocks: Arc<RwLock<HashMap<NodeId, VectorClock>>>,
}

impl ClockManager {
    pub fn new() -> Self {
        Self {
            clocks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Ensure a node has a clock entry (zero-valued until its first tick)
    pub async fn register(&self, node_id: &str) {
        let mut clocks = self.clocks.write().await;
        clocks.entry(node_id.to_string()).or_default();
    }

    /// Increment the node's own entry and return a snapshot
    pub async fn tick(&self, node_id: &str) -> VectorClock {
        let mut clocks = self.clocks.write().await;
        let clock = clocks.entry(node_id.to_string()).or_default();
        clock.increment(node_id);
        clock.clone()
    }

    /// Absorb a clock received from a peer, then tick the local node
    pub async fn merge(&self, local_node: &str, incoming: &VectorClock) -> VectorClock {
        let mut clocks = self.clocks.write().await;
        let clock = clocks.entry(local_node.to_string()).or_default();
        clock.merge(incoming);
        clock.increment(local_node);
        clock.clone()
    }

    pub async fn get(&self, node_id: &str) -> VectorClock {
        self.clocks
            .read()
            .await
            .get(node_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of every node's clock, for the /vector-clocks endpoint
    pub async fn snapshot(&self) -> HashMap<NodeId, VectorClock> {
        self.clocks.read().await.clone()
    }

    /// Drop a removed node's clock entry
    pub async fn forget(&self, node_id: &str) {
        self.clocks.write().await.remove(node_id);
    }
}

impl Default for ClockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        let mut vc = VectorClock::new();
        for (node, count) in entries {
            vc.clocks.insert(node.to_string(), *count);
        }
        vc
    }

    struct Item {
        clock: VectorClock,
        ts: i64,
        id: String,
    }

    impl CausallyOrdered for Item {
        fn clock(&self) -> &VectorClock {
            &self.clock
        }
        fn tie_break(&self) -> (i64, &str) {
            (self.ts, &self.id)
        }
    }

    #[test]
    fn test_compare_orderings() {
        let a = clock(&[("n1", 1)]);
        let b = clock(&[("n1", 2)]);
        assert_eq!(a.compare(&b), ClockOrdering::Less);
        assert_eq!(b.compare(&a), ClockOrdering::Greater);
        assert_eq!(a.compare(&a), ClockOrdering::Equal);
    }

    #[test]
    fn test_disjoint_nodes_are_concurrent() {
        // {A:2} vs {B:3}: absent keys read 0, neither dominates
        let a = clock(&[("a", 2)]);
        let b = clock(&[("b", 3)]);
        assert_eq!(a.compare(&b), ClockOrdering::Concurrent);
        assert!(a.is_concurrent(&b));
    }

    #[test]
    fn test_merge_is_pointwise_max() {
        let mut a = clock(&[("n1", 3), ("n2", 1)]);
        let b = clock(&[("n1", 1), ("n2", 5), ("n3", 2)]);
        a.merge(&b);
        assert_eq!(a.get("n1"), 3);
        assert_eq!(a.get("n2"), 5);
        assert_eq!(a.get("n3"), 2);
    }

    #[test]
    fn test_dominates() {
        let a = clock(&[("n1", 2), ("n2", 2)]);
        let b = clock(&[("n1", 2), ("n2", 1)]);
        assert!(a.dominates(&b));
        assert!(a.dominates(&a));
        assert!(!b.dominates(&a));
    }

    #[tokio::test]
    async fn test_tick_twice_is_strictly_greater() {
        let manager = ClockManager::new();
        let before = manager.get("n1").await;
        manager.tick("n1").await;
        let after = manager.tick("n1").await;
        assert_eq!(after.compare(&before), ClockOrdering::Greater);
        assert_eq!(after.get("n1"), 2);
    }

    #[tokio::test]
    async fn test_merge_absorbs_and_ticks() {
        let manager = ClockManager::new();
        manager.tick("n1").await;
        let incoming = clock(&[("n2", 4)]);
        let merged = manager.merge("n1", &incoming).await;
        assert_eq!(merged.get("n1"), 2);
        assert_eq!(merged.get("n2"), 4);
    }

    #[test]
    fn test_causal_sort_respects_happens_before() {
        let items = vec![
            Item {
                clock: clock(&[("n1", 2)]),
                ts: 5,
                id: "b".into(),
            },
            Item {
                clock: clock(&[("n1", 1)]),
                ts: 10, // later wall time, earlier causally
                id: "a".into(),
            },
        ];
        let sorted = causal_sort(items);
        assert_eq!(sorted[0].id, "a");
        assert_eq!(sorted[1].id, "b");
    }

    #[test]
    fn test_causal_sort_ties_break_on_timestamp_then_id() {
        let items = vec![
            Item {
                clock: clock(&[("n2", 1)]),
                ts: 7,
                id: "z".into(),
            },
            Item {
                clock: clock(&[("n1", 1)]),
                ts: 7,
                id: "a".into(),
            },
            Item {
                clock: clock(&[("n3", 1)]),
                ts: 3,
                id: "m".into(),
            },
        ];
        let sorted = causal_sort(items);
        assert_eq!(sorted[0].id, "m");
        assert_eq!(sorted[1].id, "a");
        assert_eq!(sorted[2].id, "z");
    }

    #[test]
    fn test_is_concurrent_with_any() {
        let head_a = clock(&[("n1", 1), ("n2", 1)]);
        let head_b = clock(&[("n1", 1), ("n3", 1)]);
        let candidate = clock(&[("n1", 1), ("n4", 1)]);
        assert!(is_concurrent_with_any(&candidate, [&head_a, &head_b]));

        let descendant = clock(&[("n1", 2), ("n2", 1), ("n3", 1), ("n4", 1)]);
        assert!(!is_concurrent_with_any(&descendant, [&head_a, &head_b]));
    }
}
