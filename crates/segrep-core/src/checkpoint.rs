//! Replication checkpoints and segment file identity
//!
//! A [`Checkpoint`] names one point-in-time segment set of a shard. Within a
//! shard, checkpoints are totally ordered by `(primary_term,
//! segment_generation)`; every other attribute is descriptive.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Shard identifier: index name plus shard number
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    /// Index name
    pub index: String,
    /// Shard number within the index
    pub shard: u32,
}

impl ShardId {
    /// Create a shard id
    pub fn new(index: impl Into<String>, shard: u32) -> Self {
        Self {
            index: index.into(),
            shard,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index, self.shard)
    }
}

/// Node identity on the transport
pub type NodeId = String;

/// Allocation id of one shard copy
pub type AllocationId = String;

/// Identity of a segment file: everything replication needs to know about it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileMeta {
    /// File name, unique within the shard
    pub name: String,
    /// Length in bytes
    pub length: u64,
    /// CRC32 of the whole file
    pub checksum: u32,
}

impl FileMeta {
    /// Create file metadata
    pub fn new(name: impl Into<String>, length: u64, checksum: u32) -> Self {
        Self {
            name: name.into(),
            length,
            checksum,
        }
    }

    /// Build metadata from file contents
    pub fn from_contents(name: impl Into<String>, contents: &[u8]) -> Self {
        Self::new(name, contents.len() as u64, crc32fast::hash(contents))
    }

    /// Same length and checksum
    pub fn is_same(&self, other: &FileMeta) -> bool {
        self.length == other.length && self.checksum == other.checksum
    }
}

/// Ordered file name -> metadata map of one segment set
pub type FileMetadataMap = BTreeMap<String, FileMeta>;

/// Ordering key of a checkpoint within its shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointKey {
    /// Primary term
    pub primary_term: u64,
    /// Segment generation
    pub segment_generation: u64,
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.primary_term, self.segment_generation)
    }
}

/// Immutable identifier of a replication point-in-time for one shard
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Shard this checkpoint belongs to
    pub shard_id: ShardId,
    /// Generation of primary ownership
    pub primary_term: u64,
    /// Segment generation, monotonic within a primary term
    pub segment_generation: u64,
    /// Segment infos version
    pub segment_infos_version: u64,
    /// Codec that wrote the segments
    pub codec: String,
}

impl Checkpoint {
    /// Create a checkpoint
    pub fn new(
        shard_id: ShardId,
        primary_term: u64,
        segment_generation: u64,
        segment_infos_version: u64,
        codec: impl Into<String>,
    ) -> Self {
        Self {
            shard_id,
            primary_term,
            segment_generation,
            segment_infos_version,
            codec: codec.into(),
        }
    }

    /// Empty checkpoint a fresh shard starts from
    pub fn empty(shard_id: ShardId, primary_term: u64, codec: impl Into<String>) -> Self {
        Self::new(shard_id, primary_term, 0, 0, codec)
    }

    /// Ordering key
    pub fn key(&self) -> CheckpointKey {
        CheckpointKey {
            primary_term: self.primary_term,
            segment_generation: self.segment_generation,
        }
    }

    /// True if `self` is strictly newer than `other` on the same shard.
    ///
    /// Checkpoints of different shards are never ahead of each other.
    pub fn is_ahead_of(&self, other: &Checkpoint) -> bool {
        self.shard_id == other.shard_id && self.key() > other.key()
    }

    /// The checkpoint that follows this one after a commit in the same term
    pub fn next_generation(&self) -> Self {
        Self {
            segment_generation: self.segment_generation + 1,
            segment_infos_version: self.segment_infos_version + 1,
            ..self.clone()
        }
    }
}

impl PartialOrd for Checkpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.shard_id != other.shard_id {
            return None;
        }
        match self.key().cmp(&other.key()) {
            Ordering::Equal if self != other => None,
            ordering => Some(ordering),
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} term={} gen={} version={} codec={}",
            self.shard_id,
            self.primary_term,
            self.segment_generation,
            self.segment_infos_version,
            self.codec
        )
    }
}

/// Files of a merged segment, published before the merge is committed so
/// replicas can copy them ahead of the checkpoint that references them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedSegmentCheckpoint {
    /// Shard the merge ran on
    pub shard_id: ShardId,
    /// Primary term of the merging primary
    pub primary_term: u64,
    /// Name of the merged segment
    pub segment_name: String,
    /// Files of the merged segment
    pub files: FileMetadataMap,
}

impl fmt::Display for MergedSegmentCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} term={} merged={}",
            self.shard_id, self.primary_term, self.segment_name
        )
    }
}

/// Result of comparing a replica's local files with a primary's file set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileDiff {
    /// Present on both sides with identical identity
    pub identical: Vec<FileMeta>,
    /// Present on both sides with a different length or checksum
    pub different: Vec<FileMeta>,
    /// Only on the source side
    pub missing: Vec<FileMeta>,
}

/// Diff `source` (primary) against `local` (replica)
pub fn diff_files(source: &FileMetadataMap, local: &FileMetadataMap) -> FileDiff {
    let mut diff = FileDiff::default();
    for (name, meta) in source {
        match local.get(name) {
            Some(existing) if existing.is_same(meta) => diff.identical.push(meta.clone()),
            Some(_) => diff.different.push(meta.clone()),
            None => diff.missing.push(meta.clone()),
        }
    }
    diff
}
