use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::errors::ClusterError;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Node {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), labels: BTreeMap::new() }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// The cluster mutations strategies need in order to enforce and clean up.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError>;
    async fn set_node_label(&self, node: &str, key: &str, value: &str) -> Result<(), ClusterError>;
    async fn remove_node_label(&self, node: &str, key: &str) -> Result<(), ClusterError>;
}

/// Loopback cluster that keeps node labels in memory.
///
/// Used for dry runs and tests; a request fails for every node listed in
/// `failing_nodes`.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
}

#[derive(Debug, Default)]
struct ClusterState {
    nodes: BTreeMap<String, Node>,
    failing_nodes: Vec<String>,
    mutations: usize,
}

impl InMemoryCluster {
    pub fn with_nodes<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let nodes = names
            .into_iter()
            .map(|name| {
                let node = Node::new(name);
                (node.name.clone(), node)
            })
            .collect();
        Self { state: Mutex::new(ClusterState { nodes, ..ClusterState::default() }) }
    }

    pub async fn node(&self, name: &str) -> Option<Node> {
        self.state.lock().await.nodes.get(name).cloned()
    }

    pub async fn nodes_with_label(&self, key: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .nodes
            .values()
            .filter(|node| node.labels.contains_key(key))
            .map(|node| node.name.clone())
            .collect()
    }

    pub async fn fail_requests_for(&self, node: &str) {
        self.state.lock().await.failing_nodes.push(node.to_owned());
    }

    pub async fn heal(&self) {
        self.state.lock().await.failing_nodes.clear();
    }

    pub async fn mutation_count(&self) -> usize {
        self.state.lock().await.mutations
    }
}

impl ClusterState {
    fn node_mut(&mut self, name: &str) -> Result<&mut Node, ClusterError> {
        if self.failing_nodes.iter().any(|failing| failing == name) {
            return Err(ClusterError::Request(format!("patch of node `{name}` was rejected")));
        }
        self.nodes.get_mut(name).ok_or_else(|| ClusterError::NodeNotFound(name.to_owned()))
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        Ok(self.state.lock().await.nodes.values().cloned().collect())
    }

    async fn set_node_label(&self, node: &str, key: &str, value: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        state.node_mut(node)?.labels.insert(key.to_owned(), value.to_owned());
        state.mutations += 1;
        Ok(())
    }

    async fn remove_node_label(&self, node: &str, key: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        state.node_mut(node)?.labels.remove(key);
        state.mutations += 1;
        Ok(())
    }
}
