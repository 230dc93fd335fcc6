//! Replication state of one replica shard

use crate::Error;
use crate::checkpoint::{Checkpoint, NodeId, ShardId};
use crate::error::TransportError;
use crate::storage::ReplicationMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where a replica shard is in its replication cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationStage {
    /// Nothing to do
    #[default]
    Idle,
    /// A newer checkpoint is queued
    AwaitingCheckpoint,
    /// Files are being pulled from the primary
    Pulling,
    /// Received files are being swapped in
    Applying,
    /// The last pull was cancelled
    Cancelled,
    /// Applying failed; the shard is failed
    Failed,
}

/// Class of the last replication failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Connectivity trouble; the next checkpoint will try again
    Transient,
    /// The session broke down (protocol, checksum, unknown file)
    Session,
    /// Applying failed; the shard cannot serve reads from it
    Fatal,
}

/// Last replication failure of a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationFailure {
    /// Failure class
    pub kind: FailureKind,
    /// Error message
    pub message: String,
    /// When it happened
    pub at: DateTime<Utc>,
}

impl ReplicationFailure {
    /// Classify `error`
    pub fn from_error(error: &Error) -> Self {
        let kind = match error {
            Error::Apply(_) => FailureKind::Fatal,
            Error::Transport(TransportError::Remote(_)) => FailureKind::Session,
            Error::Transport(_) | Error::RetriesExhausted { .. } => FailureKind::Transient,
            _ => FailureKind::Session,
        };
        Self {
            kind,
            message: error.to_string(),
            at: Utc::now(),
        }
    }
}

/// Pull currently running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InProgressPull {
    /// Checkpoint the pull was started for
    pub checkpoint: Checkpoint,
    /// Replica-chosen id of the pull
    pub replication_id: u64,
    /// Node hosting the primary
    pub primary: NodeId,
}

/// Timing of the last successful pull
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullStats {
    /// Files transferred
    pub files: usize,
    /// Bytes transferred
    pub bytes: u64,
    /// From the checkpoint info request until the files were applied
    #[serde(with = "serde_millis")]
    pub duration: Duration,
}

/// Snapshot of a replica shard's replication state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaReplicationState {
    /// Replica shard
    pub shard_id: ShardId,
    /// Last checkpoint made visible
    pub last_applied: Option<Checkpoint>,
    /// When `last_applied` was applied
    pub applied_at: Option<DateTime<Utc>>,
    /// Running pull
    pub in_progress: Option<InProgressPull>,
    /// Current stage
    pub stage: ReplicationStage,
    /// Mode read at the start of the last pull
    pub mode: ReplicationMode,
    /// Last failure, cleared by the next successful apply
    pub last_failure: Option<ReplicationFailure>,
    /// Successful pulls since the shard was registered
    pub completed_pulls: u64,
    /// Timing of the last successful pull
    pub last_pull: Option<PullStats>,
}

impl ReplicaReplicationState {
    /// State of a freshly registered shard
    pub fn new(shard_id: ShardId, last_applied: Option<Checkpoint>) -> Self {
        Self {
            shard_id,
            last_applied,
            applied_at: None,
            in_progress: None,
            stage: ReplicationStage::Idle,
            mode: ReplicationMode::default(),
            last_failure: None,
            completed_pulls: 0,
            last_pull: None,
        }
    }

    /// Whether `checkpoint` is newer than what was applied
    pub fn is_behind(&self, checkpoint: &Checkpoint) -> bool {
        self.last_applied
            .as_ref()
            .is_none_or(|applied| checkpoint.is_ahead_of(applied))
    }
}
