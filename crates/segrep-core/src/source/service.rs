//! Primary-side request handling and cluster hooks

use super::ongoing::OngoingReplications;
use super::session::SessionResources;
use super::transfer::FileSender;
use crate::checkpoint::{AllocationId, Checkpoint, FileMeta, ShardId};
use crate::config::ReplicationSettings;
use crate::copy_state::CopyStateRegistry;
use crate::protocol::{
    Ack, CancelReplicationRequest, CheckpointInfoRequest, CheckpointInfoResponse,
    GetMergedSegmentFilesRequest, GetSegmentFilesRequest, GetSegmentFilesResponse, ReplicationRequest,
    UpdateVisibleCheckpointRequest,
};
use crate::retry::RetryableClient;
use crate::storage::SegmentStore;
use crate::transport::Transport;
use crate::{Error, Result};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Serves segment files of primary shards to their replicas
pub struct SourceService {
    ongoing: OngoingReplications,
    resources: SessionResources,
    replica_checkpoints: DashMap<(ShardId, AllocationId), Checkpoint>,
}

impl SourceService {
    /// Create the service for one node
    pub fn new(
        store: Arc<dyn SegmentStore>,
        transport: Arc<dyn Transport>,
        settings: &ReplicationSettings,
    ) -> Self {
        let resources = SessionResources::new(Arc::clone(&store), transport, settings);
        Self {
            ongoing: OngoingReplications::new(
                CopyStateRegistry::new(store),
                resources.clone(),
                settings.session_lease,
                settings.stale_checkpoint_retries,
            ),
            resources,
            replica_checkpoints: DashMap::new(),
        }
    }

    /// Session table
    pub fn ongoing(&self) -> &OngoingReplications {
        &self.ongoing
    }

    /// Open a session and describe the checkpoint it serves
    pub fn get_checkpoint_info(&self, request: &CheckpointInfoRequest) -> Result<CheckpointInfoResponse> {
        let started = Instant::now();
        let session = self.ongoing.prepare_for_replication(request)?;
        tracing::trace!(
            "Prepared {} for {} [{}] in {:?}",
            session.checkpoint(),
            request.replica,
            request.target_node,
            started.elapsed()
        );
        Ok(CheckpointInfoResponse {
            checkpoint: session.checkpoint().clone(),
            files: session.copy_state().files().clone(),
        })
    }

    /// Push the requested files of an open session
    pub async fn get_segment_files(&self, request: &GetSegmentFilesRequest) -> Result<GetSegmentFilesResponse> {
        let started = Instant::now();
        let response = self.ongoing.start_segment_copy(request).await?;
        tracing::trace!(
            "Sent {} files of {} to {} [{}] in {:?}",
            response.transferred_files.len(),
            request.checkpoint,
            request.replica,
            request.target_node,
            started.elapsed()
        );
        Ok(response)
    }

    /// Push files of a merged segment ahead of the checkpoint that will
    /// reference it
    pub async fn get_merged_segment_files(
        &self,
        request: &GetMergedSegmentFilesRequest,
    ) -> Result<GetSegmentFilesResponse> {
        let merged = &request.checkpoint;
        let current = self.resources.store.current_checkpoint(&merged.shard_id)?;
        if current.primary_term != merged.primary_term {
            return Err(Error::protocol(format!(
                "{} is from another primary term than {}",
                merged, current
            )));
        }
        let mut transfer: Vec<FileMeta> = Vec::with_capacity(request.requested_files.len());
        for file in &request.requested_files {
            match merged.files.get(&file.name) {
                Some(meta) if meta.is_same(file) => transfer.push(meta.clone()),
                _ => return Err(Error::UnknownFile(file.name.clone())),
            }
        }
        if transfer.is_empty() {
            return Ok(GetSegmentFilesResponse {
                transferred_files: transfer,
            });
        }

        let _permit = self
            .resources
            .transfers
            .acquire()
            .await
            .map_err(|_| Error::internal("transfer limiter closed"))?;
        let client = RetryableClient::new(
            Arc::clone(&self.resources.transport),
            request.target_node.clone(),
            self.resources.retry.clone(),
        )
        .with_retry_timeout(self.resources.merged_segment_timeout);
        let token = CancellationToken::new();
        let sender = FileSender {
            resources: &self.resources,
            client: &client,
            token: &token,
            replication_id: request.replication_id,
            shard: &merged.shard_id,
            wrap: ReplicationRequest::MergedSegmentFileChunk,
        };

        let started = Instant::now();
        let mut bytes = 0;
        for file in &transfer {
            bytes += sender.send_file(file, || {}).await?;
        }
        tracing::debug!(
            "Pre-copied {} ({} bytes) to {} [{}] in {:?}",
            merged,
            bytes,
            request.replica,
            request.target_node,
            started.elapsed()
        );
        Ok(GetSegmentFilesResponse {
            transferred_files: transfer,
        })
    }

    /// Record the checkpoint a replica now serves
    pub fn update_visible_checkpoint(&self, request: &UpdateVisibleCheckpointRequest) -> Ack {
        let key = (request.shard_id.clone(), request.replica.clone());
        let mut entry = self
            .replica_checkpoints
            .entry(key)
            .or_insert_with(|| request.checkpoint.clone());
        if request.checkpoint.is_ahead_of(entry.value()) {
            *entry.value_mut() = request.checkpoint.clone();
        }
        tracing::trace!(
            "Replica {} of {} is at {}",
            request.replica,
            request.shard_id,
            entry.value()
        );
        Ack
    }

    /// Drop the session a replica abandoned
    pub fn cancel_replication(&self, request: &CancelReplicationRequest) -> Ack {
        if !self.ongoing.cancel_replication(request) {
            tracing::debug!(
                "No session {:?} for {} [{}] to cancel",
                request.replication_id,
                request.shard_id,
                request.replica
            );
        }
        Ack
    }

    /// Latest checkpoint each replica of `shard` reported as visible
    pub fn replica_checkpoints(&self, shard: &ShardId) -> BTreeMap<AllocationId, Checkpoint> {
        self.replica_checkpoints
            .iter()
            .filter(|entry| &entry.key().0 == shard)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect()
    }

    /// A node left the cluster
    pub fn on_node_removed(&self, node: &str) {
        let cancelled = self.ongoing.cancel_for_node(node, "node left the cluster");
        if cancelled > 0 {
            tracing::info!("Cancelled {} replications to departed node {}", cancelled, node);
        }
    }

    /// The in-sync allocation set of a primary shard changed
    pub fn on_in_sync_changed(&self, shard: &ShardId, in_sync: &[AllocationId]) {
        self.ongoing.clear_out_of_sync(shard, in_sync);
        self.replica_checkpoints
            .retain(|key, _| &key.0 != shard || in_sync.contains(&key.1));
    }

    /// A primary shard is about to close
    pub fn before_shard_closed(&self, shard: &ShardId) {
        self.ongoing.cancel_for_shard(shard, "shard is closed");
        self.replica_checkpoints.retain(|key, _| &key.0 != shard);
    }

    /// A replica was promoted to primary
    pub fn on_replica_promoted(&self, shard: &ShardId, allocation: &str) {
        self.ongoing
            .cancel_for_allocation(allocation, "replica was promoted to primary");
        self.replica_checkpoints
            .remove(&(shard.clone(), allocation.to_string()));
    }
}
