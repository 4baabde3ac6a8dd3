//! Peer registry: the node-local set of known peers, shared by discovery, upload,
//! download and the server.

use std::collections::HashSet;
use std::sync::Arc;

use chunkpod_core::Node;
use tokio::sync::RwLock;

/// Cheap to clone; all clones share one set. Never contains the local node.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    local: Node,
    peers: Arc<RwLock<HashSet<Node>>>,
}

impl PeerRegistry {
    pub fn new(local: Node) -> Self {
        Self {
            local,
            peers: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn local(&self) -> Node {
        self.local
    }

    /// Add a peer. Returns true if it was not known before. The local node and the
    /// null node are ignored.
    pub async fn insert(&self, node: Node) -> bool {
        if node == self.local || node.is_null() || node.port == 0 {
            return false;
        }
        self.peers.write().await.insert(node)
    }

    pub async fn extend(&self, nodes: impl IntoIterator<Item = Node>) -> usize {
        let mut added = 0;
        for node in nodes {
            if self.insert(node).await {
                added += 1;
            }
        }
        added
    }

    #[cfg(test)]
    pub async fn contains(&self, node: &Node) -> bool {
        self.peers.read().await.contains(node)
    }

    /// Current members. Order is unspecified.
    pub async fn snapshot(&self) -> Vec<Node> {
        self.peers.read().await.iter().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }
}
