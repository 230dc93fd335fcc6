//! One primary-to-replica file transfer

use super::throttle::TransferThrottle;
use super::transfer::FileSender;
use crate::checkpoint::{AllocationId, Checkpoint, FileMeta, NodeId, ShardId};
use crate::config::ReplicationSettings;
use crate::copy_state::CopyState;
use crate::protocol::ReplicationRequest;
use crate::retry::{RetryConfig, RetryableClient};
use crate::storage::SegmentStore;
use crate::transport::Transport;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Everything a session needs from its node
#[derive(Clone)]
pub struct SessionResources {
    /// Storage engine the files are read from
    pub store: Arc<dyn SegmentStore>,
    /// Transport chunks are pushed over
    pub transport: Arc<dyn Transport>,
    /// Retry timing of chunk sends
    pub retry: RetryConfig,
    /// Maximum bytes per chunk
    pub chunk_size: usize,
    /// Node-wide bound on concurrent transfers
    pub transfers: Arc<Semaphore>,
    /// Node-wide cap on chunk bytes per second
    pub throttle: Option<Arc<TransferThrottle>>,
    /// Retry budget of a merged-segment pre-copy
    pub merged_segment_timeout: Duration,
}

impl SessionResources {
    /// Resources of one node, sized from its settings
    pub fn new(
        store: Arc<dyn SegmentStore>,
        transport: Arc<dyn Transport>,
        settings: &ReplicationSettings,
    ) -> Self {
        Self {
            store,
            transport,
            retry: RetryConfig::from(settings),
            chunk_size: settings.chunk_size,
            transfers: Arc::new(Semaphore::new(settings.max_concurrent_transfers)),
            throttle: TransferThrottle::from_limit(settings.max_bytes_per_sec),
            merged_segment_timeout: settings.merged_segment_timeout,
        }
    }
}

/// Session serving one pinned checkpoint to one replica
pub struct SourceReplicationSession {
    id: u64,
    replication_id: u64,
    replica: AllocationId,
    target_node: NodeId,
    copy_state: CopyState,
    token: CancellationToken,
    client: RetryableClient,
    resources: SessionResources,
    lease: Duration,
    last_activity: Mutex<Instant>,
    started: AtomicBool,
    cancel_reason: Mutex<Option<String>>,
}

impl SourceReplicationSession {
    /// Open a session serving `copy_state` to `replica` on `target_node`
    pub fn new(
        replication_id: u64,
        replica: AllocationId,
        target_node: NodeId,
        copy_state: CopyState,
        lease: Duration,
        resources: SessionResources,
    ) -> Self {
        let token = CancellationToken::new();
        let client = RetryableClient::new(
            Arc::clone(&resources.transport),
            target_node.clone(),
            resources.retry.clone(),
        )
        .with_parent(&token);

        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            replication_id,
            replica,
            target_node,
            copy_state,
            token,
            client,
            resources,
            lease,
            last_activity: Mutex::new(Instant::now()),
            started: AtomicBool::new(false),
            cancel_reason: Mutex::new(None),
        }
    }

    /// Node-local session id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Replica-chosen id of the pull this session serves
    pub fn replication_id(&self) -> u64 {
        self.replication_id
    }

    /// Primary shard
    pub fn shard_id(&self) -> &ShardId {
        &self.copy_state.checkpoint().shard_id
    }

    /// Allocation id of the replica
    pub fn replica(&self) -> &str {
        &self.replica
    }

    /// Node receiving the files
    pub fn target_node(&self) -> &str {
        &self.target_node
    }

    /// Checkpoint being served
    pub fn checkpoint(&self) -> &Checkpoint {
        self.copy_state.checkpoint()
    }

    /// Pinned file set
    pub fn copy_state(&self) -> &CopyState {
        &self.copy_state
    }

    /// Whether the session was cancelled or closed
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether the session saw no activity for longer than its lease
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(*self.last_activity.lock()) > self.lease
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn cancelled_error(&self) -> Error {
        let reason = self
            .cancel_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "replication session closed".to_string());
        Error::cancelled(reason)
    }

    /// Cancel the session and release its pinned files
    pub fn cancel(&self, reason: &str) {
        {
            let mut current = self.cancel_reason.lock();
            if current.is_none() {
                *current = Some(reason.to_string());
            }
        }
        if !self.token.is_cancelled() {
            tracing::debug!(
                "Cancelling replication of {} to {} [{}]: {}",
                self.shard_id(),
                self.replica,
                self.target_node,
                reason
            );
        }
        self.close();
    }

    /// End the session without a reason; used once the transfer is over
    pub(crate) fn close(&self) {
        self.token.cancel();
        self.copy_state.release();
    }

    /// Push the requested files to the replica, in copy-state order.
    ///
    /// Returns the transferred files once every chunk was acknowledged.
    pub async fn send_files(&self, requested: &[FileMeta]) -> Result<Vec<FileMeta>> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::protocol(format!(
                "session {} for {} already started a transfer",
                self.id,
                self.shard_id()
            )));
        }
        if self.token.is_cancelled() {
            return Err(self.cancelled_error());
        }
        self.touch();

        let files = self.copy_state.files();
        let mut names = HashSet::with_capacity(requested.len());
        for file in requested {
            if !files.contains_key(&file.name) {
                self.cancel("replica requested an unknown file");
                return Err(Error::UnknownFile(file.name.clone()));
            }
            names.insert(file.name.as_str());
        }

        let transfer: Vec<FileMeta> = files
            .values()
            .filter(|meta| names.contains(meta.name.as_str()))
            .cloned()
            .collect();
        if transfer.is_empty() {
            return Ok(transfer);
        }

        let _permit = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(self.cancelled_error()),
            permit = self.resources.transfers.acquire() => {
                permit.map_err(|_| Error::internal("transfer limiter closed"))?
            }
        };

        tracing::debug!(
            "Sending {} files of {} to {} [{}]",
            transfer.len(),
            self.checkpoint(),
            self.replica,
            self.target_node
        );
        for file in &transfer {
            if let Err(e) = self.send_file(file).await {
                return Err(if e.is_cancelled() { self.cancelled_error() } else { e });
            }
        }
        Ok(transfer)
    }

    async fn send_file(&self, file: &FileMeta) -> Result<()> {
        let sender = FileSender {
            resources: &self.resources,
            client: &self.client,
            token: &self.token,
            replication_id: self.replication_id,
            shard: self.shard_id(),
            wrap: ReplicationRequest::FileChunk,
        };
        sender.send_file(file, || self.touch()).await?;
        Ok(())
    }
}

impl std::fmt::Debug for SourceReplicationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceReplicationSession")
            .field("id", &self.id)
            .field("replication_id", &self.replication_id)
            .field("checkpoint", self.checkpoint())
            .field("replica", &self.replica)
            .field("target_node", &self.target_node)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
