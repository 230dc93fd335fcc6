//! Replica-side driver: one worker task per replica shard
//!
//! Published checkpoints land in a single-slot `watch` channel, so only the
//! newest pending checkpoint survives. The worker pulls it, swaps the files
//! in and reports the new visible checkpoint. A newer checkpoint arriving
//! mid-pull cancels the running pull.

use super::merged::MergedSegmentTarget;
use super::state::{
    FailureKind, InProgressPull, PullStats, ReplicaReplicationState, ReplicationFailure, ReplicationStage,
};
use super::target::{ChunkReceivers, ReplicationTarget};
use crate::checkpoint::{AllocationId, Checkpoint, MergedSegmentCheckpoint, NodeId, ShardId};
use crate::config::ReplicationSettings;
use crate::protocol::{Ack, FileChunkRequest};
use crate::retry::RetryConfig;
use crate::storage::{ReplicationMode, SegmentStore};
use crate::transport::Transport;
use crate::{Error, Result};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Notified when a replica shard can no longer be trusted
pub trait ShardFailureListener: Send + Sync {
    /// `shard` failed with `error`
    fn on_shard_failed(&self, shard: &ShardId, error: &Error);
}

#[derive(Debug, Clone)]
struct PendingPull {
    checkpoint: Checkpoint,
    primary: NodeId,
}

struct ActivePull {
    checkpoint: Checkpoint,
    token: CancellationToken,
}

/// Shared by every shard worker of a node
struct PullContext {
    store: Arc<dyn SegmentStore>,
    transport: Arc<dyn Transport>,
    retry: RetryConfig,
    merged_segment_timeout: Duration,
    receivers: Arc<ChunkReceivers>,
    pulls: Arc<Semaphore>,
    next_replication_id: AtomicU64,
    failure_listener: RwLock<Option<Arc<dyn ShardFailureListener>>>,
}

impl PullContext {
    fn next_replication_id(&self) -> u64 {
        self.next_replication_id.fetch_add(1, Ordering::Relaxed)
    }
}

struct ShardReplicator {
    shard_id: ShardId,
    allocation: AllocationId,
    state: RwLock<ReplicaReplicationState>,
    pending: watch::Sender<Option<PendingPull>>,
    active: Mutex<Option<ActivePull>>,
    token: CancellationToken,
}

impl ShardReplicator {
    fn set_stage(&self, stage: ReplicationStage) {
        self.state.write().stage = stage;
    }

    /// Queue `checkpoint`, superseding older pending or running pulls.
    fn offer(&self, checkpoint: Checkpoint, primary: NodeId) -> bool {
        if !self.state.read().is_behind(&checkpoint) {
            tracing::trace!("Ignoring {}: already applied", checkpoint);
            return false;
        }

        {
            let active = self.active.lock();
            if let Some(running) = active.as_ref() {
                if !checkpoint.is_ahead_of(&running.checkpoint) {
                    return false;
                }
                let mut state = self.state.write();
                if state.stage != ReplicationStage::Applying {
                    tracing::debug!(
                        "Cancelling pull of {} for newer {}",
                        running.checkpoint,
                        checkpoint
                    );
                    running.token.cancel();
                    state.stage = ReplicationStage::AwaitingCheckpoint;
                }
            }
        }

        let queued = self.pending.send_if_modified(|pending| {
            if let Some(queued) = pending.as_ref() {
                if !checkpoint.is_ahead_of(&queued.checkpoint) {
                    return false;
                }
            }
            *pending = Some(PendingPull {
                checkpoint: checkpoint.clone(),
                primary: primary.clone(),
            });
            true
        });
        if queued {
            let mut state = self.state.write();
            if matches!(
                state.stage,
                ReplicationStage::Idle | ReplicationStage::Cancelled | ReplicationStage::Failed
            ) {
                state.stage = ReplicationStage::AwaitingCheckpoint;
            }
        }
        queued
    }

    /// Remove the queued checkpoint without waking the worker
    fn take_pending(&self) -> Option<PendingPull> {
        let mut next = None;
        self.pending.send_if_modified(|pending| {
            next = pending.take();
            false
        });
        next
    }

    fn cancel_pull(&self, reason: &str) -> bool {
        self.take_pending();
        let active = self.active.lock();
        match active.as_ref() {
            Some(running) => {
                tracing::debug!("Cancelling pull of {}: {}", running.checkpoint, reason);
                running.token.cancel();
                let mut state = self.state.write();
                if state.stage != ReplicationStage::Applying {
                    state.stage = ReplicationStage::Cancelled;
                }
                true
            }
            None => {
                self.set_stage(ReplicationStage::Idle);
                false
            }
        }
    }

    async fn run(self: Arc<Self>, ctx: Arc<PullContext>, mut updates: watch::Receiver<Option<PendingPull>>) {
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let Some(next) = self.take_pending() else {
                continue;
            };
            let pull_token = self.token.child_token();
            *self.active.lock() = Some(ActivePull {
                checkpoint: next.checkpoint.clone(),
                token: pull_token.clone(),
            });

            let permit = tokio::select! {
                biased;
                _ = pull_token.cancelled() => None,
                permit = Arc::clone(&ctx.pulls).acquire_owned() => permit.ok(),
            };
            if let Some(_permit) = permit {
                self.pull_and_apply(next, &pull_token, &ctx).await;
            }
            *self.active.lock() = None;
        }
        tracing::debug!("Replication worker for {} stopped", self.shard_id);
    }

    async fn pull_and_apply(&self, next: PendingPull, token: &CancellationToken, ctx: &PullContext) {
        let started = Instant::now();
        let replication_id = ctx.next_replication_id();
        let mode = ctx.store.replication_mode(&self.shard_id);
        {
            let mut state = self.state.write();
            state.stage = ReplicationStage::Pulling;
            state.mode = mode;
            state.in_progress = Some(InProgressPull {
                checkpoint: next.checkpoint.clone(),
                replication_id,
                primary: next.primary.clone(),
            });
        }

        let target = ReplicationTarget::new(
            replication_id,
            next.checkpoint.clone(),
            next.primary.clone(),
            self.allocation.clone(),
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.transport),
            ctx.retry.clone(),
            Arc::clone(&ctx.receivers),
            token,
        );

        let files = match target.pull().await {
            Ok(files) => files,
            Err(e) => {
                self.on_pull_failed(&target, token, &next.checkpoint, e).await;
                return;
            }
        };

        // Holding `active` keeps a newer offer from cancelling between the
        // token check and the switch to Applying.
        let superseded = {
            let _active = self.active.lock();
            let mut state = self.state.write();
            state.in_progress = None;
            if token.is_cancelled() {
                true
            } else if !state.is_behind(&files.checkpoint) {
                tracing::debug!("Discarding pull of {}: already applied", files.checkpoint);
                state.stage = ReplicationStage::Idle;
                return;
            } else {
                state.stage = ReplicationStage::Applying;
                false
            }
        };
        if superseded {
            tracing::debug!("Discarding superseded pull of {}", files.checkpoint);
            target.notify_cancelled("superseded by a newer checkpoint").await;
            return;
        }

        let checkpoint = files.checkpoint.clone();
        let received_files = files.received.len();
        let received_bytes: u64 = files.received.values().map(|data| data.len() as u64).sum();
        if let Err(e) = ctx.store.apply_file_set(files) {
            tracing::error!("Failed to apply {} on {}: {}", checkpoint, self.shard_id, e);
            {
                let mut state = self.state.write();
                state.stage = ReplicationStage::Failed;
                state.last_failure = Some(ReplicationFailure {
                    kind: FailureKind::Fatal,
                    ..ReplicationFailure::from_error(&e)
                });
            }
            let listener = ctx.failure_listener.read().clone();
            if let Some(listener) = listener {
                listener.on_shard_failed(&self.shard_id, &e);
            }
            self.settle_stage();
            return;
        }

        if mode == ReplicationMode::Logical {
            if let Err(e) = ctx.store.trim_translog(&checkpoint) {
                tracing::warn!("Failed to trim translog of {} to {}: {}", self.shard_id, checkpoint, e);
            }
        }

        {
            let mut state = self.state.write();
            state.last_applied = Some(checkpoint.clone());
            state.applied_at = Some(Utc::now());
            state.last_failure = None;
            state.completed_pulls += 1;
            state.last_pull = Some(PullStats {
                files: received_files,
                bytes: received_bytes,
                duration: started.elapsed(),
            });
        }
        self.settle_stage();
        tracing::info!(
            "Replica {} now at {} ({} files, {} bytes in {:?})",
            self.shard_id,
            checkpoint,
            received_files,
            received_bytes,
            started.elapsed()
        );

        target.notify_visible(&checkpoint).await;
    }

    async fn on_pull_failed(
        &self,
        target: &ReplicationTarget,
        token: &CancellationToken,
        checkpoint: &Checkpoint,
        error: Error,
    ) {
        let cancelled = error.is_cancelled() || token.is_cancelled();
        {
            let mut state = self.state.write();
            state.in_progress = None;
            if cancelled {
                if state.stage == ReplicationStage::Pulling {
                    state.stage = ReplicationStage::Cancelled;
                }
            } else {
                state.last_failure = Some(ReplicationFailure::from_error(&error));
            }
        }
        if cancelled {
            tracing::debug!("Pull of {} cancelled: {}", checkpoint, error);
            target.notify_cancelled("replication cancelled").await;
        } else {
            tracing::warn!("Pull of {} for {} failed: {}", checkpoint, self.shard_id, error);
            target.notify_cancelled(&format!("replica failed: {}", error)).await;
            self.settle_stage();
        }
    }

    /// Idle, or waiting when a newer checkpoint is queued
    fn settle_stage(&self) {
        let waiting = self.pending.borrow().is_some();
        self.set_stage(if waiting {
            ReplicationStage::AwaitingCheckpoint
        } else {
            ReplicationStage::Idle
        });
    }
}

/// Drives replication for every replica shard hosted on a node
pub struct ReplicaCoordinator {
    ctx: Arc<PullContext>,
    shards: DashMap<ShardId, (Arc<ShardReplicator>, JoinHandle<()>)>,
    shutdown: CancellationToken,
}

impl ReplicaCoordinator {
    /// Create a coordinator pulling from primaries over `transport`
    pub fn new(
        store: Arc<dyn SegmentStore>,
        transport: Arc<dyn Transport>,
        settings: &ReplicationSettings,
    ) -> Self {
        Self {
            ctx: Arc::new(PullContext {
                store,
                transport,
                retry: RetryConfig::from(settings),
                merged_segment_timeout: settings.merged_segment_timeout,
                receivers: Arc::new(DashMap::new()),
                pulls: Arc::new(Semaphore::new(settings.max_concurrent_replications)),
                next_replication_id: AtomicU64::new(u64::from(rand::random::<u32>()) << 16),
                failure_listener: RwLock::new(None),
            }),
            shards: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Install the listener told about fatal apply failures
    pub fn set_failure_listener(&self, listener: Arc<dyn ShardFailureListener>) {
        *self.ctx.failure_listener.write() = Some(listener);
    }

    /// Start replicating `shard` as replica `allocation`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register_shard(&self, shard: ShardId, allocation: impl Into<AllocationId>) {
        let applied = self.ctx.store.current_checkpoint(&shard).ok();
        let (pending, updates) = watch::channel(None);
        let replicator = Arc::new(ShardReplicator {
            shard_id: shard.clone(),
            allocation: allocation.into(),
            state: RwLock::new(ReplicaReplicationState::new(shard.clone(), applied)),
            pending,
            active: Mutex::new(None),
            token: self.shutdown.child_token(),
        });
        let worker = tokio::spawn(Arc::clone(&replicator).run(Arc::clone(&self.ctx), updates));
        if let Some((_, (previous, handle))) = self.shards.remove(&shard) {
            previous.token.cancel();
            handle.abort();
        }
        self.shards.insert(shard, (replicator, worker));
    }

    fn replicator(&self, shard: &ShardId) -> Option<Arc<ShardReplicator>> {
        self.shards.get(shard).map(|entry| Arc::clone(&entry.0))
    }

    /// A primary published `checkpoint`. Returns whether a pull was queued.
    pub fn on_new_checkpoint(&self, checkpoint: Checkpoint, primary: impl Into<NodeId>) -> bool {
        match self.replicator(&checkpoint.shard_id) {
            Some(replicator) => replicator.offer(checkpoint, primary.into()),
            None => {
                tracing::debug!("No replica of {} on this node", checkpoint.shard_id);
                false
            }
        }
    }

    /// A primary asked for `merged` to be copied ahead of the checkpoint
    /// that will reference it. Completes once the files are held locally.
    ///
    /// Returns the number of files copied.
    pub async fn on_merged_segment(
        &self,
        merged: MergedSegmentCheckpoint,
        primary: impl Into<NodeId>,
    ) -> Result<usize> {
        let Some(replicator) = self.replicator(&merged.shard_id) else {
            tracing::debug!("No replica of {} on this node", merged.shard_id);
            return Ok(0);
        };
        let older_term = replicator
            .state
            .read()
            .last_applied
            .as_ref()
            .is_some_and(|applied| applied.primary_term > merged.primary_term);
        if older_term || replicator.token.is_cancelled() {
            tracing::debug!("Ignoring {}", merged);
            return Ok(0);
        }

        let token = replicator.token.child_token();
        let target = MergedSegmentTarget::new(
            self.ctx.next_replication_id(),
            merged.clone(),
            primary.into(),
            replicator.allocation.clone(),
            Arc::clone(&self.ctx.store),
            Arc::clone(&self.ctx.transport),
            self.ctx.retry.clone(),
            self.ctx.merged_segment_timeout,
            Arc::clone(&self.ctx.receivers),
            &token,
        );
        let started = Instant::now();
        let copied = target.copy().await.inspect_err(|e| {
            tracing::warn!("Pre-copy of {} failed: {}", merged, e);
        })?;
        if copied > 0 {
            tracing::debug!("Pre-copied {} files of {} in {:?}", copied, merged, started.elapsed());
        }
        Ok(copied)
    }

    /// Tear down the running pull of `shard`
    pub fn cancel_replication(&self, shard: &ShardId, reason: &str) -> bool {
        self.replicator(shard)
            .is_some_and(|replicator| replicator.cancel_pull(reason))
    }

    /// Stop replicating `shard`
    pub fn close_shard(&self, shard: &ShardId) {
        if let Some((_, (replicator, _worker))) = self.shards.remove(shard) {
            replicator.cancel_pull("shard is closed");
            replicator.token.cancel();
        }
    }

    /// Snapshot of the replication state of `shard`
    pub fn replication_state(&self, shard: &ShardId) -> Option<ReplicaReplicationState> {
        self.replicator(shard)
            .map(|replicator| replicator.state.read().clone())
    }

    /// Route a pushed chunk to the pull or pre-copy it belongs to
    pub fn handle_file_chunk(&self, chunk: &FileChunkRequest) -> Result<Ack> {
        let writer = self
            .ctx
            .receivers
            .get(&chunk.replication_id)
            .map(|writer| Arc::clone(writer.value()))
            .ok_or_else(|| Error::cancelled(format!("no running pull {}", chunk.replication_id)))?;
        writer.write_chunk(chunk)?;
        Ok(Ack)
    }

    /// Stop every shard worker
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.shards.clear();
    }
}

impl Drop for ReplicaCoordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
