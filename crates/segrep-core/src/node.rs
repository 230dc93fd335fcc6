//! A node taking part in segment replication
//!
//! [`ReplicationNode`] bundles the primary side ([`SourceService`] and
//! [`CheckpointPublisher`]) with the replica side ([`ReplicaCoordinator`])
//! and answers every replication request addressed to the node.

use crate::checkpoint::{AllocationId, Checkpoint, MergedSegmentCheckpoint, NodeId, ShardId};
use crate::config::ReplicationSettings;
use crate::protocol::{ReplicationRequest, ReplicationResponse};
use crate::publisher::{CheckpointPublisher, PublishOutcome};
use crate::replica::{ReplicaCoordinator, ReplicaReplicationState, ShardFailureListener};
use crate::source::SourceService;
use crate::storage::SegmentStore;
use crate::transport::{RequestHandler, Transport};
use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Primary and replica replication services of one node
pub struct ReplicationNode {
    node_id: NodeId,
    settings: ReplicationSettings,
    source: SourceService,
    replica: ReplicaCoordinator,
    publisher: CheckpointPublisher,
}

impl ReplicationNode {
    /// Create the services of a node
    pub fn new(
        store: Arc<dyn SegmentStore>,
        transport: Arc<dyn Transport>,
        settings: ReplicationSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let node_id = transport.local_node().to_string();
        tracing::info!("Starting segment replication on {}", node_id);
        Ok(Self {
            source: SourceService::new(Arc::clone(&store), Arc::clone(&transport), &settings),
            replica: ReplicaCoordinator::new(Arc::clone(&store), Arc::clone(&transport), &settings),
            publisher: CheckpointPublisher::new(node_id.clone(), store, transport, &settings),
            node_id,
            settings,
        })
    }

    /// Node id on the transport
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Settings in effect
    pub fn settings(&self) -> &ReplicationSettings {
        &self.settings
    }

    /// Primary-side service
    pub fn source(&self) -> &SourceService {
        &self.source
    }

    /// Replica-side coordinator
    pub fn replica(&self) -> &ReplicaCoordinator {
        &self.replica
    }

    // Primary side

    /// Publish `checkpoint` to the nodes hosting in-sync replicas
    pub async fn publish_checkpoint(&self, checkpoint: Checkpoint, replicas: &[NodeId]) -> PublishOutcome {
        self.publisher.publish(checkpoint, replicas).await
    }

    /// A flush or merge committed on a primary shard
    pub async fn on_checkpoint_committed(&self, shard: &ShardId, replicas: &[NodeId]) -> Result<PublishOutcome> {
        self.publisher.on_checkpoint_committed(shard, replicas).await
    }

    /// Have the replicas copy a merged segment before the merge is committed
    pub async fn publish_merged_segment(
        &self,
        merged: MergedSegmentCheckpoint,
        replicas: &[NodeId],
    ) -> PublishOutcome {
        self.publisher.publish_merged_segment(merged, replicas).await
    }

    /// A node left the cluster
    pub fn on_node_removed(&self, node: &str) {
        self.source.on_node_removed(node);
    }

    /// The in-sync replica set of a primary shard changed
    pub fn on_in_sync_changed(&self, shard: &ShardId, in_sync: &[AllocationId]) {
        self.source.on_in_sync_changed(shard, in_sync);
    }

    /// A primary shard is about to close
    pub fn before_shard_closed(&self, shard: &ShardId) {
        self.source.before_shard_closed(shard);
        self.publisher.remove_shard(shard);
    }

    /// A replica of a primary shard on this node was promoted elsewhere
    pub fn on_replica_promoted(&self, shard: &ShardId, allocation: &str) {
        self.source.on_replica_promoted(shard, allocation);
    }

    /// Checkpoints the replicas of `shard` reported as visible
    pub fn replica_checkpoints(&self, shard: &ShardId) -> BTreeMap<AllocationId, Checkpoint> {
        self.source.replica_checkpoints(shard)
    }

    // Replica side

    /// Start replicating `shard` as replica `allocation`
    pub fn register_replica(&self, shard: ShardId, allocation: impl Into<AllocationId>) {
        self.replica.register_shard(shard, allocation);
    }

    /// A primary published `checkpoint`
    pub fn on_new_checkpoint(&self, checkpoint: Checkpoint, primary: impl Into<NodeId>) -> bool {
        self.replica.on_new_checkpoint(checkpoint, primary)
    }

    /// Tear down the running pull of a replica shard
    pub fn cancel_replication(&self, shard: &ShardId, reason: &str) -> bool {
        self.replica.cancel_replication(shard, reason)
    }

    /// Stop replicating a replica shard
    pub fn close_replica(&self, shard: &ShardId) {
        self.replica.close_shard(shard);
    }

    /// Replication state of a replica shard
    pub fn replication_state(&self, shard: &ShardId) -> Option<ReplicaReplicationState> {
        self.replica.replication_state(shard)
    }

    /// Install the listener told about fatal apply failures
    pub fn set_failure_listener(&self, listener: Arc<dyn ShardFailureListener>) {
        self.replica.set_failure_listener(listener);
    }

    /// Stop all replication work of this node
    pub fn shutdown(&self) {
        tracing::info!("Stopping segment replication on {}", self.node_id);
        self.publisher.close();
        self.replica.shutdown();
    }
}

#[async_trait]
impl RequestHandler for ReplicationNode {
    async fn handle(&self, from: &str, request: ReplicationRequest) -> Result<ReplicationResponse> {
        tracing::trace!("{} from {}", request.action(), from);
        match request {
            ReplicationRequest::CheckpointInfo(request) => {
                self.source.get_checkpoint_info(&request).map(Into::into)
            }
            ReplicationRequest::GetSegmentFiles(request) => {
                self.source.get_segment_files(&request).await.map(Into::into)
            }
            ReplicationRequest::FileChunk(chunk) | ReplicationRequest::MergedSegmentFileChunk(chunk) => {
                self.replica.handle_file_chunk(&chunk).map(Into::into)
            }
            ReplicationRequest::PublishCheckpoint(request) => {
                self.replica
                    .on_new_checkpoint(request.checkpoint, request.primary_node);
                Ok(ReplicationResponse::Ack)
            }
            ReplicationRequest::UpdateVisibleCheckpoint(request) => {
                Ok(self.source.update_visible_checkpoint(&request).into())
            }
            ReplicationRequest::CancelReplication(request) => {
                Ok(self.source.cancel_replication(&request).into())
            }
            ReplicationRequest::PublishMergedSegment(request) => {
                self.replica
                    .on_merged_segment(request.checkpoint, request.primary_node)
                    .await?;
                Ok(ReplicationResponse::Ack)
            }
            ReplicationRequest::GetMergedSegmentFiles(request) => {
                self.source.get_merged_segment_files(&request).await.map(Into::into)
            }
        }
    }
}

