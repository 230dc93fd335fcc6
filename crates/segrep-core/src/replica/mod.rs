//! Replica side of segment replication

pub mod coordinator;
pub mod merged;
pub mod state;
pub mod target;
pub mod writer;

pub use coordinator::{ReplicaCoordinator, ShardFailureListener};
pub use merged::MergedSegmentTarget;
pub use state::{
    FailureKind, InProgressPull, PullStats, ReplicaReplicationState, ReplicationFailure, ReplicationStage,
};
pub use target::ReplicationTarget;
pub use writer::MultiFileWriter;
