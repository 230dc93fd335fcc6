//! Copy of a merged segment ahead of the checkpoint that references it

use super::target::{ChunkReceivers, ReceiverRegistration};
use super::writer::MultiFileWriter;
use crate::checkpoint::{AllocationId, FileMeta, FileMetadataMap, MergedSegmentCheckpoint, NodeId};
use crate::protocol::{GetMergedSegmentFilesRequest, GetSegmentFilesResponse, ReplicationRequest, actions};
use crate::retry::{RetryConfig, RetryableClient};
use crate::storage::SegmentStore;
use crate::transport::Transport;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Replica side of one merged-segment pre-copy
pub struct MergedSegmentTarget {
    replication_id: u64,
    merged: MergedSegmentCheckpoint,
    allocation: AllocationId,
    local_node: NodeId,
    store: Arc<dyn SegmentStore>,
    client: RetryableClient,
    timeout: Duration,
    receivers: Arc<ChunkReceivers>,
}

impl MergedSegmentTarget {
    /// Prepare a copy of `merged` from `primary`, cancelled with `token`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        replication_id: u64,
        merged: MergedSegmentCheckpoint,
        primary: NodeId,
        allocation: AllocationId,
        store: Arc<dyn SegmentStore>,
        transport: Arc<dyn Transport>,
        retry: RetryConfig,
        timeout: Duration,
        receivers: Arc<ChunkReceivers>,
        token: &CancellationToken,
    ) -> Self {
        let local_node = transport.local_node().to_string();
        let client = RetryableClient::new(transport, primary, retry)
            .with_parent(token)
            .with_retry_timeout(timeout);
        Self {
            replication_id,
            merged,
            allocation,
            local_node,
            store,
            client,
            timeout,
            receivers,
        }
    }

    /// Files of the merged segment found neither live nor copied ahead
    pub fn missing_files(&self) -> Result<Vec<FileMeta>> {
        let shard = &self.merged.shard_id;
        let local = self.store.local_files(shard)?;
        let precopied = self.store.precopied_files(shard);
        let held = |files: &FileMetadataMap, meta: &FileMeta| {
            files.get(&meta.name).is_some_and(|have| have.is_same(meta))
        };
        Ok(self
            .merged
            .files
            .values()
            .filter(|meta| !held(&local, meta) && !held(&precopied, meta))
            .cloned()
            .collect())
    }

    /// Receive the missing files and keep them for the next apply.
    ///
    /// Returns the number of files copied.
    pub async fn copy(&self) -> Result<usize> {
        let missing = self.missing_files()?;
        if missing.is_empty() {
            return Ok(0);
        }

        let writer = Arc::new(MultiFileWriter::new(
            self.replication_id,
            self.merged.shard_id.clone(),
            &missing,
        ));
        self.receivers.insert(self.replication_id, Arc::clone(&writer));
        let _registration = ReceiverRegistration {
            receivers: &self.receivers,
            replication_id: self.replication_id,
        };

        let response: GetSegmentFilesResponse = self
            .client
            .execute_with_timeout(
                actions::GET_MERGED_SEGMENT_FILES,
                ReplicationRequest::GetMergedSegmentFiles(GetMergedSegmentFilesRequest {
                    replication_id: self.replication_id,
                    checkpoint: self.merged.clone(),
                    replica: self.allocation.clone(),
                    target_node: self.local_node.clone(),
                    requested_files: missing.clone(),
                }),
                self.timeout,
            )
            .await?;
        if response.transferred_files.len() != missing.len() {
            return Err(Error::protocol(format!(
                "primary transferred {} files of {}, {} were requested",
                response.transferred_files.len(),
                self.merged,
                missing.len()
            )));
        }

        let received = writer.finish()?;
        let files: FileMetadataMap = missing
            .iter()
            .map(|meta| (meta.name.clone(), meta.clone()))
            .collect();
        self.store
            .store_precopied_files(&self.merged.shard_id, &files, received)?;
        Ok(missing.len())
    }
}
