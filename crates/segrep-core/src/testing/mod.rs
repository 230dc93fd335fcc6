//! Testing infrastructure for segment replication
//!
//! [`TestCluster`] wires [`ReplicationNode`]s backed by
//! [`InMemorySegmentStore`]s together over a [`LocalHub`].
//!
//! # Usage
//!
//! ```rust,no_run
//! use segrep_core::ReplicationSettings;
//! use segrep_core::checkpoint::ShardId;
//! use segrep_core::testing::TestCluster;
//!
//! # async fn demo() {
//! let cluster = TestCluster::new(ReplicationSettings::default(), &["primary", "replica"]);
//! let shard = ShardId::new("logs", 0);
//! cluster.add_shard(&shard, "primary", &[("replica", "r1")]);
//! # }
//! ```

use crate::checkpoint::{Checkpoint, MergedSegmentCheckpoint, NodeId, ShardId};
use crate::config::ReplicationSettings;
use crate::node::ReplicationNode;
use crate::publisher::PublishOutcome;
use crate::replica::ReplicaReplicationState;
use crate::storage::{InMemorySegmentStore, ReplicationMode, SegmentStore};
use crate::transport::LocalHub;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// One node of a [`TestCluster`]
pub struct TestNode {
    /// Storage engine of the node
    pub store: Arc<InMemorySegmentStore>,
    /// Replication services of the node
    pub node: Arc<ReplicationNode>,
}

/// In-process cluster of replication nodes
pub struct TestCluster {
    hub: Arc<LocalHub>,
    nodes: BTreeMap<NodeId, TestNode>,
}

impl TestCluster {
    /// Start one node per id. Must be called from within a tokio runtime.
    pub fn new(settings: ReplicationSettings, node_ids: &[&str]) -> Self {
        let hub = LocalHub::new();
        let nodes = node_ids
            .iter()
            .map(|id| {
                let store = Arc::new(InMemorySegmentStore::new());
                let node = Arc::new(
                    ReplicationNode::new(store.clone(), hub.transport(*id), settings.clone())
                        .expect("Failed to create replication node"),
                );
                hub.register(*id, node.clone());
                (id.to_string(), TestNode { store, node })
            })
            .collect();
        Self { hub, nodes }
    }

    /// The transport hub, for fault injection
    pub fn hub(&self) -> &Arc<LocalHub> {
        &self.hub
    }

    /// Node by id
    pub fn node(&self, id: &str) -> &TestNode {
        self.nodes
            .get(id)
            .unwrap_or_else(|| panic!("No test node {}", id))
    }

    /// Create `shard` with its primary on `primary` and replicas on the
    /// given `(node, allocation id)` pairs.
    pub fn add_shard(&self, shard: &ShardId, primary: &str, replicas: &[(&str, &str)]) {
        self.add_shard_with_mode(shard, primary, replicas, ReplicationMode::Full);
    }

    /// [`TestCluster::add_shard`] with an explicit replica mode
    pub fn add_shard_with_mode(
        &self,
        shard: &ShardId,
        primary: &str,
        replicas: &[(&str, &str)],
        mode: ReplicationMode,
    ) {
        self.node(primary).store.create_shard(shard, 1, ReplicationMode::Full);
        for (node, allocation) in replicas {
            let replica = self.node(node);
            replica.store.create_shard(shard, 1, mode);
            replica.node.register_replica(shard.clone(), *allocation);
        }
    }

    /// Commit `files` on the primary and return the new checkpoint
    pub fn commit(&self, primary: &str, shard: &ShardId, files: &[(&str, &str)]) -> Checkpoint {
        let added = files
            .iter()
            .map(|(name, contents)| (name.to_string(), Bytes::copy_from_slice(contents.as_bytes())))
            .collect();
        self.node(primary)
            .store
            .commit(shard, added, &[])
            .expect("Failed to commit segment files")
    }

    /// Write a merge output on the primary without committing it
    pub fn stage_merge(&self, primary: &str, shard: &ShardId, name: &str, contents: &str) -> MergedSegmentCheckpoint {
        self.node(primary)
            .store
            .stage_merged_segment(shard, name, Bytes::copy_from_slice(contents.as_bytes()))
            .expect("Failed to stage merged segment")
    }

    /// Commit a staged merge of `sources` into `merged`
    pub fn commit_merge(&self, primary: &str, shard: &ShardId, sources: &[&str], merged: (&str, &str)) -> Checkpoint {
        let (name, contents) = merged;
        self.node(primary)
            .store
            .merge(
                shard,
                sources,
                (name.to_string(), Bytes::copy_from_slice(contents.as_bytes())),
            )
            .expect("Failed to commit merge")
    }

    /// Have `replicas` copy a staged merge
    pub async fn publish_merged(
        &self,
        primary: &str,
        merged: MergedSegmentCheckpoint,
        replicas: &[&str],
    ) -> PublishOutcome {
        let replicas: Vec<NodeId> = replicas.iter().map(|r| r.to_string()).collect();
        self.node(primary)
            .node
            .publish_merged_segment(merged, &replicas)
            .await
    }

    /// Publish the primary's current checkpoint to `replicas`
    pub async fn publish(&self, primary: &str, shard: &ShardId, replicas: &[&str]) -> Checkpoint {
        let replicas: Vec<NodeId> = replicas.iter().map(|r| r.to_string()).collect();
        let node = self.node(primary);
        node.node
            .on_checkpoint_committed(shard, &replicas)
            .await
            .expect("Failed to publish checkpoint");
        node.store
            .current_checkpoint(shard)
            .expect("Primary shard missing")
    }

    /// Replication state of `shard` on `replica`
    pub fn state(&self, replica: &str, shard: &ShardId) -> ReplicaReplicationState {
        self.node(replica)
            .node
            .replication_state(shard)
            .expect("Replica shard not registered")
    }

    /// Wait until `replica` applied `checkpoint` or something newer
    pub async fn wait_for_checkpoint(
        &self,
        replica: &str,
        shard: &ShardId,
        checkpoint: &Checkpoint,
        timeout: Duration,
    ) -> bool {
        self.wait_until(timeout, || {
            self.state(replica, shard)
                .last_applied
                .is_some_and(|applied| applied.key() >= checkpoint.key())
        })
        .await
    }

    /// Poll `condition` every 10ms until it holds or `timeout` passes
    pub async fn wait_until<F>(&self, timeout: Duration, condition: F) -> bool
    where
        F: Fn() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
