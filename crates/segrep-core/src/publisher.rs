//! Checkpoint publication from a primary to its replicas

use crate::checkpoint::{Checkpoint, CheckpointKey, MergedSegmentCheckpoint, NodeId, ShardId};
use crate::config::ReplicationSettings;
use crate::protocol::{
    Ack, PublishCheckpointRequest, PublishMergedSegmentRequest, ReplicationRequest, actions,
};
use crate::retry::{RetryConfig, RetryableClient};
use crate::storage::SegmentStore;
use crate::transport::Transport;
use crate::Result;
use dashmap::DashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Result of publishing one checkpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Replica nodes that acknowledged
    pub acknowledged: Vec<NodeId>,
    /// Replica nodes that could not be reached, with the last error
    pub failed: Vec<(NodeId, String)>,
    /// Every replica already acknowledged this checkpoint or a newer one
    pub skipped: bool,
}

/// Tells in-sync replicas about new checkpoints
pub struct CheckpointPublisher {
    node: NodeId,
    store: Arc<dyn SegmentStore>,
    transport: Arc<dyn Transport>,
    retry: RetryConfig,
    publish_timeout: Duration,
    merged_segment_timeout: Duration,
    /// Newest checkpoint each replica node acknowledged
    last_published: DashMap<(ShardId, NodeId), CheckpointKey>,
    shutdown: CancellationToken,
}

impl CheckpointPublisher {
    /// Create a publisher for the primaries on `node`
    pub fn new(
        node: impl Into<NodeId>,
        store: Arc<dyn SegmentStore>,
        transport: Arc<dyn Transport>,
        settings: &ReplicationSettings,
    ) -> Self {
        Self {
            node: node.into(),
            store,
            transport,
            retry: RetryConfig::from(settings),
            publish_timeout: settings.publish_timeout,
            merged_segment_timeout: settings.merged_segment_timeout,
            last_published: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Publish the store's current checkpoint of `shard` after a commit
    pub async fn on_checkpoint_committed(&self, shard: &ShardId, replicas: &[NodeId]) -> Result<PublishOutcome> {
        let checkpoint = self.store.current_checkpoint(shard)?;
        Ok(self.publish(checkpoint, replicas).await)
    }

    /// Send `checkpoint` to every replica node that has not acknowledged it
    /// yet, concurrently
    pub async fn publish(&self, checkpoint: Checkpoint, replicas: &[NodeId]) -> PublishOutcome {
        let key = checkpoint.key();
        let behind: Vec<NodeId> = replicas
            .iter()
            .filter(|node| **node != self.node)
            .filter(|node| {
                self.last_published(&checkpoint.shard_id, node)
                    .is_none_or(|acked| acked < key)
            })
            .cloned()
            .collect();
        if behind.is_empty() {
            tracing::debug!("Skipping publish of {}, every replica has it", checkpoint);
            return PublishOutcome {
                skipped: true,
                ..PublishOutcome::default()
            };
        }

        let request = ReplicationRequest::PublishCheckpoint(PublishCheckpointRequest {
            checkpoint: checkpoint.clone(),
            primary_node: self.node.clone(),
        });
        let outcome = self
            .fan_out(&checkpoint, request, &behind, self.retry.request_timeout, self.publish_timeout)
            .await;
        for replica in &outcome.acknowledged {
            self.last_published
                .entry((checkpoint.shard_id.clone(), replica.clone()))
                .and_modify(|acked| *acked = (*acked).max(key))
                .or_insert(key);
        }
        outcome
    }

    /// Ask replica nodes to copy a merged segment before the merge is
    /// committed. Completes once each replica holds the files or failed.
    pub async fn publish_merged_segment(
        &self,
        merged: MergedSegmentCheckpoint,
        replicas: &[NodeId],
    ) -> PublishOutcome {
        let targets: Vec<NodeId> = replicas
            .iter()
            .filter(|node| **node != self.node)
            .cloned()
            .collect();
        let request = ReplicationRequest::PublishMergedSegment(PublishMergedSegmentRequest {
            checkpoint: merged.clone(),
            primary_node: self.node.clone(),
        });
        let timeout = self.merged_segment_timeout;
        self.fan_out(&merged, request, &targets, timeout, timeout).await
    }

    async fn fan_out(
        &self,
        what: &(impl Display + ?Sized),
        request: ReplicationRequest,
        replicas: &[NodeId],
        attempt_timeout: Duration,
        retry_timeout: Duration,
    ) -> PublishOutcome {
        let action = request.action();
        let mut tasks = JoinSet::new();
        for replica in replicas {
            let client = RetryableClient::new(Arc::clone(&self.transport), replica.clone(), self.retry.clone())
                .with_parent(&self.shutdown)
                .with_retry_timeout(retry_timeout);
            let request = request.clone();
            let replica = replica.clone();
            tasks.spawn(async move {
                let result = client
                    .execute_with_timeout::<Ack>(action, request, attempt_timeout)
                    .await;
                (replica, result)
            });
        }

        let mut outcome = PublishOutcome::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((replica, Ok(_))) => outcome.acknowledged.push(replica),
                Ok((replica, Err(e))) => {
                    if e.is_cancelled() {
                        tracing::debug!("Publish of {} to {} cancelled", what, replica);
                    } else {
                        tracing::warn!("Failed to publish {} to {}: {}", what, replica, e);
                    }
                    outcome.failed.push((replica, e.to_string()));
                }
                Err(e) => tracing::error!("Publish task for {} failed: {}", what, e),
            }
        }
        outcome.acknowledged.sort();
        outcome.failed.sort();
        tracing::debug!(
            "Published {} to {} replicas ({} failed)",
            what,
            outcome.acknowledged.len(),
            outcome.failed.len()
        );
        outcome
    }

    /// Newest checkpoint of `shard` that `replica` acknowledged
    pub fn last_published(&self, shard: &ShardId, replica: &str) -> Option<CheckpointKey> {
        self.last_published
            .get(&(shard.clone(), replica.to_string()))
            .map(|key| *key)
    }

    /// Forget a shard, e.g. once its primary closed
    pub fn remove_shard(&self, shard: &ShardId) {
        self.last_published.retain(|key, _| &key.0 != shard);
    }

    /// Abort every publish in flight; later publishes fail immediately
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}
