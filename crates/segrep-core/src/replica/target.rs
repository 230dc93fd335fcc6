//! One pull of a checkpoint from the primary

use super::writer::MultiFileWriter;
use crate::checkpoint::{AllocationId, Checkpoint, FileMeta, NodeId, ShardId, diff_files};
use crate::error::RemoteErrorKind;
use crate::protocol::{
    Ack, CancelReplicationRequest, CheckpointInfoRequest, CheckpointInfoResponse, GetSegmentFilesRequest,
    GetSegmentFilesResponse, ReplicationRequest, UpdateVisibleCheckpointRequest, actions,
};
use crate::retry::{RetryConfig, RetryableClient};
use crate::storage::{SegmentFileSet, SegmentStore};
use crate::transport::{RequestOptions, Transport};
use crate::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Writers of running pulls, keyed by replication id
pub type ChunkReceivers = DashMap<u64, Arc<MultiFileWriter>>;

/// Replica side of one replication session
pub struct ReplicationTarget {
    replication_id: u64,
    checkpoint: Checkpoint,
    primary: NodeId,
    local_node: NodeId,
    allocation: AllocationId,
    store: Arc<dyn SegmentStore>,
    transport: Arc<dyn Transport>,
    retry: RetryConfig,
    client: RetryableClient,
    receivers: Arc<ChunkReceivers>,
}

impl ReplicationTarget {
    /// Prepare a pull of `checkpoint` from `primary`, cancelled with `token`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        replication_id: u64,
        checkpoint: Checkpoint,
        primary: NodeId,
        allocation: AllocationId,
        store: Arc<dyn SegmentStore>,
        transport: Arc<dyn Transport>,
        retry: RetryConfig,
        receivers: Arc<ChunkReceivers>,
        token: &CancellationToken,
    ) -> Self {
        let client = RetryableClient::new(Arc::clone(&transport), primary.clone(), retry.clone())
            .with_parent(token);
        Self {
            replication_id,
            checkpoint,
            local_node: transport.local_node().to_string(),
            primary,
            allocation,
            store,
            transport,
            retry,
            client,
            receivers,
        }
    }

    fn shard_id(&self) -> &ShardId {
        &self.checkpoint.shard_id
    }

    /// Open a session on the primary, pull the missing files and return the
    /// complete file set of the served checkpoint.
    pub async fn pull(&self) -> Result<SegmentFileSet> {
        let info = match self.checkpoint_info().await {
            Err(e) if e.remote_kind() == Some(RemoteErrorKind::ReplicationAlreadyInProgress) => {
                // Only this worker pulls for the allocation, so the primary
                // holds a session of an earlier pull that never cleaned up.
                tracing::debug!(
                    "Primary {} still serves an abandoned pull of {}, cancelling it",
                    self.primary,
                    self.shard_id()
                );
                self.client
                    .execute::<Ack>(
                        actions::CANCEL_REPLICATION,
                        ReplicationRequest::CancelReplication(CancelReplicationRequest {
                            replication_id: None,
                            shard_id: self.shard_id().clone(),
                            replica: self.allocation.clone(),
                            reason: "abandoned by the replica".to_string(),
                        }),
                    )
                    .await?;
                self.checkpoint_info().await?
            }
            result => result?,
        };
        if &info.checkpoint.shard_id != self.shard_id() {
            return Err(Error::protocol(format!(
                "asked for {} but was served {}",
                self.shard_id(),
                info.checkpoint
            )));
        }

        let mut local = self.store.local_files(self.shard_id())?;
        for (name, meta) in self.store.precopied_files(self.shard_id()) {
            if info.files.get(&name).is_some_and(|wanted| wanted.is_same(&meta)) {
                local.entry(name).or_insert(meta);
            }
        }
        let diff = diff_files(&info.files, &local);
        if !diff.different.is_empty() {
            let names: Vec<&str> = diff.different.iter().map(|f| f.name.as_str()).collect();
            return Err(Error::protocol(format!(
                "local files {:?} of {} differ from the primary's",
                names,
                self.shard_id()
            )));
        }
        tracing::debug!(
            "Pulling {} of {} files for {} from {}",
            diff.missing.len(),
            info.files.len(),
            info.checkpoint,
            self.primary
        );

        let writer = Arc::new(MultiFileWriter::new(
            self.replication_id,
            self.shard_id().clone(),
            &diff.missing,
        ));
        self.receivers.insert(self.replication_id, Arc::clone(&writer));
        let _registration = ReceiverRegistration {
            receivers: &self.receivers,
            replication_id: self.replication_id,
        };

        let response: GetSegmentFilesResponse = self
            .client
            .execute_with_timeout(
                actions::GET_SEGMENT_FILES,
                ReplicationRequest::GetSegmentFiles(GetSegmentFilesRequest {
                    replication_id: self.replication_id,
                    checkpoint: info.checkpoint.clone(),
                    replica: self.allocation.clone(),
                    target_node: self.local_node.clone(),
                    requested_files: diff.missing.clone(),
                }),
                self.retry.transfer_timeout,
            )
            .await?;
        if !same_files(&response.transferred_files, &diff.missing) {
            return Err(Error::protocol(format!(
                "primary transferred {} files, {} were requested",
                response.transferred_files.len(),
                diff.missing.len()
            )));
        }

        tracing::trace!(
            "Received {} bytes for {}",
            writer.bytes_received(),
            info.checkpoint
        );
        let received = writer.finish()?;
        Ok(SegmentFileSet {
            checkpoint: info.checkpoint,
            files: info.files,
            received,
        })
    }

    async fn checkpoint_info(&self) -> Result<CheckpointInfoResponse> {
        self.client
            .execute(
                actions::GET_CHECKPOINT_INFO,
                ReplicationRequest::CheckpointInfo(CheckpointInfoRequest {
                    replication_id: self.replication_id,
                    checkpoint: self.checkpoint.clone(),
                    replica: self.allocation.clone(),
                    target_node: self.local_node.clone(),
                }),
            )
            .await
    }

    /// Tell the primary to drop the session; failures are only logged
    pub async fn notify_cancelled(&self, reason: &str) {
        let request = ReplicationRequest::CancelReplication(CancelReplicationRequest {
            replication_id: Some(self.replication_id),
            shard_id: self.shard_id().clone(),
            replica: self.allocation.clone(),
            reason: reason.to_string(),
        });
        self.send_best_effort(actions::CANCEL_REPLICATION, request).await;
    }

    /// Report the checkpoint now visible on this replica
    pub async fn notify_visible(&self, checkpoint: &Checkpoint) {
        let request = ReplicationRequest::UpdateVisibleCheckpoint(UpdateVisibleCheckpointRequest {
            shard_id: self.shard_id().clone(),
            replica: self.allocation.clone(),
            checkpoint: checkpoint.clone(),
        });
        self.send_best_effort(actions::UPDATE_VISIBLE_CHECKPOINT, request).await;
    }

    async fn send_best_effort(&self, action: &'static str, request: ReplicationRequest) {
        let options = RequestOptions::with_timeout(self.retry.request_timeout);
        if let Err(e) = self
            .transport
            .send_request(&self.primary, action, &request, options)
            .await
        {
            tracing::debug!("{} to {} failed: {}", action, self.primary, e);
        }
    }
}

fn same_files(transferred: &[FileMeta], requested: &[FileMeta]) -> bool {
    let mut transferred: Vec<&str> = transferred.iter().map(|f| f.name.as_str()).collect();
    let mut requested: Vec<&str> = requested.iter().map(|f| f.name.as_str()).collect();
    transferred.sort_unstable();
    requested.sort_unstable();
    transferred == requested
}

/// Removes a writer from the receivers when the transfer ends
pub(super) struct ReceiverRegistration<'a> {
    pub(super) receivers: &'a ChunkReceivers,
    pub(super) replication_id: u64,
}

impl Drop for ReceiverRegistration<'_> {
    fn drop(&mut self) {
        self.receivers.remove(&self.replication_id);
    }
}
