use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A DAG of follow-up timers chained behind a root timer. Nodes reference
/// each other by id only (arena-style); cycle detection is the orchestrator's
/// concern, the kernel just never schedules a node twice.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TemporalGraphSpec {
    #[serde(default = "default_root_id")]
    pub root: String,
    #[serde(default)]
    pub nodes: Vec<TemporalGraphNode>,
}

fn default_root_id() -> String {
    "root".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TemporalGraphNode {
    pub id: String,
    #[serde(default)]
    pub after: Vec<String>,
    #[serde(default)]
    pub offset_ms: Option<u64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub action_bundle: Option<Value>,
    #[serde(default)]
    pub agent_binding: Option<Value>,
}

impl TemporalGraphNode {
    /// Delay between the unlocking fire and this node's own deadline.
    pub fn delay_ms(&self) -> u64 {
        self.offset_ms.or(self.duration_ms).unwrap_or(0).max(1)
    }
}

struct TemporalGraphState {
    root: String,
    nodes: HashMap<String, TemporalGraphNode>,
    scheduled: HashSet<String>,
    completed: HashSet<String>,
}

impl TemporalGraphState {
    fn new(spec: TemporalGraphSpec) -> Self {
        let root = spec.root.clone();
        let nodes = spec
            .nodes
            .into_iter()
            .map(|node| (node.id.clone(), node))
            .collect();
        let mut scheduled = HashSet::new();
        scheduled.insert(root.clone());
        Self {
            root,
            nodes,
            scheduled,
            completed: HashSet::new(),
        }
    }

    fn ready_nodes(&mut self) -> Vec<TemporalGraphNode> {
        let mut ready = Vec::new();
        for (id, node) in self.nodes.iter() {
            if self.scheduled.contains(id) {
                continue;
            }
            if node
                .after
                .iter()
                .all(|dependency| self.completed.contains(dependency))
            {
                ready.push(node.clone());
            }
        }
        for node in &ready {
            self.scheduled.insert(node.id.clone());
        }
        ready
    }

    fn finished(&self) -> bool {
        // The root counts as a node of its own.
        self.completed.len() >= self.nodes.len() + 1
    }
}

/// Tracks in-flight temporal graphs keyed by the root timer id. The kernel
/// registers a graph when its root timer is scheduled and reports completions
/// as timers fire; nodes whose dependencies are all complete come back ready
/// to be scheduled as fresh timers.
#[derive(Clone, Default)]
pub struct TemporalGraphExecutor {
    state: Arc<RwLock<HashMap<Uuid, TemporalGraphState>>>,
}

impl TemporalGraphExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a graph and return the nodes with no dependencies, which are
    /// schedulable right away.
    pub async fn register_root(
        &self,
        root_id: Uuid,
        spec: TemporalGraphSpec,
    ) -> Vec<TemporalGraphNode> {
        let mut graphs = self.state.write().await;
        let mut state = TemporalGraphState::new(spec);
        let independent: Vec<TemporalGraphNode> = state
            .nodes
            .values()
            .filter(|node| node.after.is_empty())
            .cloned()
            .collect();
        for node in &independent {
            state.scheduled.insert(node.id.clone());
        }
        graphs.insert(root_id, state);
        independent
    }

    /// Record that a node (or the root) fired and return the newly unlocked
    /// nodes. Finished graphs are evicted.
    pub async fn record_completion(&self, root_id: Uuid, node_id: &str) -> Vec<TemporalGraphNode> {
        let mut graphs = self.state.write().await;
        let Some(state) = graphs.get_mut(&root_id) else {
            return Vec::new();
        };
        state.completed.insert(node_id.to_string());
        let ready = state.ready_nodes();
        if state.finished() {
            graphs.remove(&root_id);
        }
        ready
    }

    pub async fn root_node(&self, root_id: Uuid) -> Option<String> {
        let graphs = self.state.read().await;
        graphs.get(&root_id).map(|state| state.root.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> TemporalGraphSpec {
        TemporalGraphSpec {
            root: "root".to_string(),
            nodes: vec![
                TemporalGraphNode {
                    id: "a".to_string(),
                    after: vec![],
                    offset_ms: Some(50),
                    duration_ms: None,
                    metadata: None,
                    labels: HashMap::new(),
                    action_bundle: None,
                    agent_binding: None,
                },
                TemporalGraphNode {
                    id: "b".to_string(),
                    after: vec!["root".to_string(), "a".to_string()],
                    offset_ms: Some(100),
                    duration_ms: None,
                    metadata: None,
                    labels: HashMap::new(),
                    action_bundle: None,
                    agent_binding: None,
                },
            ],
        }
    }

    #[tokio::test]
    async fn register_root_returns_independent_nodes() {
        let executor = TemporalGraphExecutor::new();
        let root_id = Uuid::new_v4();
        let ready = executor.register_root(root_id, sample_spec()).await;
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "a");
    }

    #[tokio::test]
    async fn completing_dependencies_unlocks_nodes() {
        let executor = TemporalGraphExecutor::new();
        let root_id = Uuid::new_v4();
        executor.register_root(root_id, sample_spec()).await;

        let after_root = executor.record_completion(root_id, "root").await;
        // still waiting on node "a"
        assert!(after_root.is_empty());

        let ready = executor.record_completion(root_id, "a").await;
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "b");

        // completed graphs are evicted from internal state
        let nothing_left = executor.record_completion(root_id, "b").await;
        assert!(nothing_left.is_empty());
        assert!(executor.root_node(root_id).await.is_none());
    }

    #[tokio::test]
    async fn nodes_are_never_scheduled_twice() {
        let executor = TemporalGraphExecutor::new();
        let root_id = Uuid::new_v4();
        executor.register_root(root_id, sample_spec()).await;
        executor.record_completion(root_id, "root").await;
        let first = executor.record_completion(root_id, "a").await;
        assert_eq!(first.len(), 1);
        // Re-reporting the same completion unlocks nothing new.
        let again = executor.record_completion(root_id, "a").await;
        assert!(again.is_empty());
    }
}
