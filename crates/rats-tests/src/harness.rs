//! Multi-node network harness.

use std::time::Duration;

use tracing::info;

use crate::node::TestNode;

/// A loopback network of test nodes.
pub struct TestNetwork {
    nodes: Vec<TestNode>,
}

impl TestNetwork {
    /// Starts `count` nodes on ephemeral ports.
    pub async fn with_nodes(count: usize) -> Self {
        let mut nodes = Vec::with_capacity(count);
        for _ in 0..count {
            nodes.push(TestNode::start().await);
        }
        info!(count, "test network up");
        Self { nodes }
    }

    /// The nodes in the network.
    pub fn nodes(&self) -> &[TestNode] {
        &self.nodes
    }

    /// A node by index.
    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    /// Connects every pair of nodes.
    pub async fn connect_mesh(&self) {
        for i in 0..self.nodes.len() {
            for j in (i + 1)..self.nodes.len() {
                self.nodes[i].connect_to(&self.nodes[j]).await;
            }
        }
    }

    /// Chains the nodes' DHTs: each node bootstraps off the previous.
    pub async fn bootstrap_chain(&self) {
        for pair in self.nodes.windows(2) {
            let seed = pair[0].dht_addr().await;
            pair[1]
                .client
                .bootstrap(vec![seed])
                .await
                .expect("bootstrap");
        }
    }

    /// Waits until every node has at least `min` live peers.
    pub async fn wait_for_peer_count(&self, min: usize, timeout: Duration) -> Result<(), &'static str> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut all = true;
            for node in &self.nodes {
                if node.client.peer_count().await < min {
                    all = false;
                    break;
                }
            }
            if all {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err("peer counts never converged");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Stops every node.
    pub async fn stop_all(&self) {
        for node in &self.nodes {
            node.client.stop().await;
        }
    }
}
