//! Segrep Core - Segment Replication Coordination
//!
//! This crate moves the immutable segment files of an index shard from its
//! primary copy to its replicas:
//! - Checkpoints naming point-in-time segment sets, totally ordered per shard
//! - Pinned copy states so files being served are never deleted underneath
//! - Primary-side sessions streaming checksummed, rate-limited chunks to one
//!   replica each
//! - Merged segments copied to replicas before the merge is committed
//! - Retrying, cancellable node-to-node requests
//! - Replica-side coordination that only ever moves forward and swaps file
//!   sets in atomically
//!
//! # Architecture
//!
//! ```text
//!        primary node                              replica node
//! ┌───────────────────────┐   publish checkpoint  ┌───────────────────────┐
//! │  CheckpointPublisher  │ ────────────────────> │  ReplicaCoordinator   │
//! ├───────────────────────┤   checkpoint info     │   (worker per shard)  │
//! │  SourceService        │ <──────────────────── │  ReplicationTarget    │
//! │   OngoingReplications │   get segment files   │                       │
//! │   ReplicationSession  │ <──────────────────── │                       │
//! │   CopyStateRegistry   │   file chunks         │  MultiFileWriter      │
//! │                       │ ────────────────────> │                       │
//! └──────────┬────────────┘                       └──────────┬────────────┘
//!            │ pin / read                                    │ apply
//! ┌──────────┴────────────┐                       ┌──────────┴────────────┐
//! │     SegmentStore      │                       │     SegmentStore      │
//! └───────────────────────┘                       └───────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checkpoint;
pub mod config;
pub mod copy_state;
pub mod error;
pub mod node;
pub mod protocol;
pub mod publisher;
pub mod replica;
pub mod retry;
pub mod source;
pub mod storage;
pub mod testing;
pub mod transport;

pub use checkpoint::{Checkpoint, FileMeta, ShardId};
pub use config::ReplicationSettings;
pub use error::{Error, Result};
pub use node::ReplicationNode;
pub use storage::{ReplicationMode, SegmentStore};
