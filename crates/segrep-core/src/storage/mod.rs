//! Storage engine collaborator
//!
//! Replication never looks inside segment files. It needs the engine to name
//! the current checkpoint, hold files against deletion, hand out byte ranges
//! and atomically swap in a received file set.

pub mod memory;

pub use memory::InMemorySegmentStore;

use crate::Result;
use crate::checkpoint::{Checkpoint, FileMetadataMap, ShardId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a replica shard keeps up with its primary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMode {
    /// Segment files are the only source of truth
    #[default]
    Full,
    /// Segment files plus a local translog of operations
    Logical,
}

/// Everything needed to swap a replica to a new checkpoint
#[derive(Debug, Clone)]
pub struct SegmentFileSet {
    /// Checkpoint the files belong to
    pub checkpoint: Checkpoint,
    /// Full file set of the checkpoint
    pub files: FileMetadataMap,
    /// Contents of the files that were transferred; the rest must already be
    /// present locally
    pub received: HashMap<String, Bytes>,
}

/// Storage engine operations used by replication
pub trait SegmentStore: Send + Sync {
    /// Latest durable checkpoint of `shard`
    fn current_checkpoint(&self, shard: &ShardId) -> Result<Checkpoint>;

    /// Hold the files of `checkpoint` against deletion and return them.
    ///
    /// Fails with `StaleCheckpoint` when the checkpoint was superseded and its
    /// files can no longer be guaranteed.
    fn pin_files(&self, checkpoint: &Checkpoint) -> Result<FileMetadataMap>;

    /// Release one hold taken by [`SegmentStore::pin_files`]
    fn unpin_files(&self, checkpoint: &Checkpoint);

    /// Read up to `len` bytes of `file` starting at `position`
    fn read_chunk(&self, shard: &ShardId, file: &str, position: u64, len: usize) -> Result<Bytes>;

    /// Files of the segment set currently visible on this node
    fn local_files(&self, shard: &ShardId) -> Result<FileMetadataMap>;

    /// Atomically make `files` the visible segment set.
    ///
    /// Either every file becomes visible or none does.
    fn apply_file_set(&self, files: SegmentFileSet) -> Result<()>;

    /// Replication mode from the shard's durability settings
    fn replication_mode(&self, shard: &ShardId) -> ReplicationMode;

    /// Drop translog operations already covered by `checkpoint`
    fn trim_translog(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Keep files copied ahead of the checkpoint that will reference them.
    ///
    /// They stay invisible until an [`SegmentStore::apply_file_set`] lists
    /// them.
    fn store_precopied_files(
        &self,
        shard: &ShardId,
        files: &FileMetadataMap,
        received: HashMap<String, Bytes>,
    ) -> Result<()>;

    /// Files copied ahead and not yet visible
    fn precopied_files(&self, shard: &ShardId) -> FileMetadataMap;
}
