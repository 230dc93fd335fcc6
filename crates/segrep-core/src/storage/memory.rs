//! In-memory segment store
//!
//! A small storage engine with write-once segment files, commits that produce
//! new checkpoints, merges, and a compaction pass that only deletes files
//! neither referenced by the live segment set nor pinned.

use super::{ReplicationMode, SegmentFileSet, SegmentStore};
use crate::checkpoint::{
    Checkpoint, CheckpointKey, FileMeta, FileMetadataMap, MergedSegmentCheckpoint, ShardId,
};
use crate::{Error, Result};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Default codec name written into checkpoints
pub const DEFAULT_CODEC: &str = "Lucene99";

/// Superseded segment sets remembered for late pins
const HISTORY_LIMIT: usize = 16;

/// Immutable segment set; swapped, never mutated
#[derive(Debug)]
struct SegmentSnapshot {
    checkpoint: Checkpoint,
    files: FileMetadataMap,
}

struct ShardData {
    current: RwLock<Arc<SegmentSnapshot>>,
    history: Mutex<VecDeque<Arc<SegmentSnapshot>>>,
    blobs: RwLock<HashMap<String, Bytes>>,
    /// Merge outputs written but not committed yet
    staged: Mutex<HashSet<String>>,
    /// Files received ahead of their checkpoint
    precopied: RwLock<HashMap<String, (FileMeta, Bytes)>>,
    mode: ReplicationMode,
    translog_trimmed_to: Mutex<Option<CheckpointKey>>,
}

impl ShardData {
    fn new(checkpoint: Checkpoint, mode: ReplicationMode) -> Self {
        Self {
            current: RwLock::new(Arc::new(SegmentSnapshot {
                checkpoint,
                files: FileMetadataMap::new(),
            })),
            history: Mutex::new(VecDeque::new()),
            blobs: RwLock::new(HashMap::new()),
            staged: Mutex::new(HashSet::new()),
            precopied: RwLock::new(HashMap::new()),
            mode,
            translog_trimmed_to: Mutex::new(None),
        }
    }

    fn snapshot(&self) -> Arc<SegmentSnapshot> {
        Arc::clone(&self.current.read())
    }

    fn swap(&self, next: SegmentSnapshot) {
        let previous = std::mem::replace(&mut *self.current.write(), Arc::new(next));
        let mut history = self.history.lock();
        history.push_back(previous);
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
    }
}

#[derive(Debug)]
struct PinEntry {
    count: usize,
    files: FileMetadataMap,
}

/// Segment store keeping every file in memory
pub struct InMemorySegmentStore {
    shards: DashMap<ShardId, Arc<ShardData>>,
    /// Pin registry, consulted by compaction
    pins: Mutex<HashMap<(ShardId, CheckpointKey), PinEntry>>,
    failing_applies: Mutex<usize>,
    codec: String,
}

impl Default for InMemorySegmentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySegmentStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            shards: DashMap::new(),
            pins: Mutex::new(HashMap::new()),
            failing_applies: Mutex::new(0),
            codec: DEFAULT_CODEC.to_string(),
        }
    }

    /// Create an empty shard at generation 0 of `primary_term`
    pub fn create_shard(&self, shard: &ShardId, primary_term: u64, mode: ReplicationMode) {
        let checkpoint = Checkpoint::empty(shard.clone(), primary_term, self.codec.clone());
        self.shards
            .insert(shard.clone(), Arc::new(ShardData::new(checkpoint, mode)));
    }

    fn shard(&self, shard: &ShardId) -> Result<Arc<ShardData>> {
        self.shards
            .get(shard)
            .map(|data| Arc::clone(data.value()))
            .ok_or_else(|| Error::storage(format!("shard {} not found", shard)))
    }

    /// Shard of a replica that may not have received anything yet
    fn shard_or_create(&self, shard: &ShardId, primary_term: u64) -> Arc<ShardData> {
        self.shards
            .entry(shard.clone())
            .or_insert_with(|| {
                Arc::new(ShardData::new(
                    Checkpoint::empty(shard.clone(), primary_term, self.codec.clone()),
                    ReplicationMode::Full,
                ))
            })
            .clone()
    }

    /// Commit new files and drop `removed` from the live set, producing the
    /// next checkpoint. Models a flush (`removed` empty) or a merge.
    pub fn commit(
        &self,
        shard: &ShardId,
        added: Vec<(String, Bytes)>,
        removed: &[&str],
    ) -> Result<Checkpoint> {
        let data = self.shard(shard)?;
        let current = data.snapshot();

        let mut files = current.files.clone();
        for name in removed {
            if files.remove(*name).is_none() {
                return Err(Error::storage(format!("{} is not in the live segment set", name)));
            }
        }

        let mut blobs = data.blobs.write();
        for (name, contents) in &added {
            let meta = FileMeta::from_contents(name.clone(), contents);
            if let Some(existing) = blobs.get(name) {
                if existing != contents {
                    return Err(Error::storage(format!("segment file {} is write-once", name)));
                }
            }
            files.insert(name.clone(), meta);
        }
        let mut staged = data.staged.lock();
        for (name, contents) in added {
            staged.remove(&name);
            blobs.insert(name, contents);
        }
        drop(staged);
        drop(blobs);

        let checkpoint = current.checkpoint.next_generation();
        data.swap(SegmentSnapshot {
            checkpoint: checkpoint.clone(),
            files,
        });
        tracing::debug!("Committed {}", checkpoint);
        Ok(checkpoint)
    }

    /// Merge `sources` into one new file
    pub fn merge(&self, shard: &ShardId, sources: &[&str], merged: (String, Bytes)) -> Result<Checkpoint> {
        self.commit(shard, vec![merged], sources)
    }

    /// Write the output of a merge that is not committed yet.
    ///
    /// The file survives compaction until a commit makes it live, so it can be
    /// copied to replicas ahead of the checkpoint that references it.
    pub fn stage_merged_segment(
        &self,
        shard: &ShardId,
        name: &str,
        contents: Bytes,
    ) -> Result<MergedSegmentCheckpoint> {
        let data = self.shard(shard)?;
        let meta = FileMeta::from_contents(name.to_string(), &contents);
        {
            let mut blobs = data.blobs.write();
            if let Some(existing) = blobs.get(name) {
                if existing != &contents {
                    return Err(Error::storage(format!("segment file {} is write-once", name)));
                }
            }
            blobs.insert(name.to_string(), contents);
            data.staged.lock().insert(name.to_string());
        }

        let mut files = FileMetadataMap::new();
        files.insert(name.to_string(), meta);
        let merged = MergedSegmentCheckpoint {
            shard_id: shard.clone(),
            primary_term: data.snapshot().checkpoint.primary_term,
            segment_name: name.to_string(),
            files,
        };
        tracing::debug!("Staged {}", merged);
        Ok(merged)
    }

    /// Start a new primary term, e.g. after a failover
    pub fn bump_primary_term(&self, shard: &ShardId) -> Result<Checkpoint> {
        let data = self.shard(shard)?;
        let current = data.snapshot();
        let checkpoint = Checkpoint {
            primary_term: current.checkpoint.primary_term + 1,
            ..current.checkpoint.next_generation()
        };
        data.swap(SegmentSnapshot {
            checkpoint: checkpoint.clone(),
            files: current.files.clone(),
        });
        Ok(checkpoint)
    }

    /// Physically delete files that are neither live nor pinned.
    ///
    /// Returns the deleted file names.
    pub fn compact(&self, shard: &ShardId) -> Result<Vec<String>> {
        let data = self.shard(shard)?;
        let pins = self.pins.lock();
        let live = data.snapshot();

        let mut blobs = data.blobs.write();
        let staged = data.staged.lock();
        let mut deleted: Vec<String> = blobs
            .keys()
            .filter(|name| !live.files.contains_key(*name))
            .filter(|name| !staged.contains(*name))
            .filter(|name| {
                !pins
                    .iter()
                    .any(|(key, entry)| &key.0 == shard && entry.files.contains_key(*name))
            })
            .cloned()
            .collect();
        deleted.sort();
        for name in &deleted {
            blobs.remove(name);
        }
        if !deleted.is_empty() {
            tracing::debug!("Compaction of {} deleted {:?}", shard, deleted);
        }
        Ok(deleted)
    }

    /// Total holds on `shard` across checkpoints
    pub fn pin_count(&self, shard: &ShardId) -> usize {
        self.pins
            .lock()
            .iter()
            .filter(|(key, _)| &key.0 == shard)
            .map(|(_, entry)| entry.count)
            .sum()
    }

    /// Whether a file is physically present
    pub fn contains_file(&self, shard: &ShardId, name: &str) -> bool {
        self.shard(shard)
            .map(|data| data.blobs.read().contains_key(name))
            .unwrap_or(false)
    }

    /// Contents of a physically present file
    pub fn file_contents(&self, shard: &ShardId, name: &str) -> Option<Bytes> {
        self.shard(shard).ok()?.blobs.read().get(name).cloned()
    }

    /// Whether a file copied ahead is waiting for its checkpoint
    pub fn is_precopied(&self, shard: &ShardId, name: &str) -> bool {
        self.shard(shard)
            .map(|data| data.precopied.read().contains_key(name))
            .unwrap_or(false)
    }

    /// Make the next `count` calls to `apply_file_set` fail
    pub fn fail_next_apply(&self, count: usize) {
        *self.failing_applies.lock() = count;
    }

    /// Checkpoint the translog was last trimmed to
    pub fn translog_trimmed_to(&self, shard: &ShardId) -> Option<CheckpointKey> {
        self.shard(shard).ok().and_then(|data| *data.translog_trimmed_to.lock())
    }
}

impl SegmentStore for InMemorySegmentStore {
    fn current_checkpoint(&self, shard: &ShardId) -> Result<Checkpoint> {
        Ok(self.shard(shard)?.snapshot().checkpoint.clone())
    }

    fn pin_files(&self, checkpoint: &Checkpoint) -> Result<FileMetadataMap> {
        let data = self.shard(&checkpoint.shard_id)?;
        let key = (checkpoint.shard_id.clone(), checkpoint.key());

        let mut pins = self.pins.lock();
        if let Some(entry) = pins.get_mut(&key) {
            entry.count += 1;
            return Ok(entry.files.clone());
        }

        let current = data.snapshot();
        let snapshot = if current.checkpoint.key() == checkpoint.key() {
            current
        } else {
            data.history
                .lock()
                .iter()
                .find(|s| s.checkpoint.key() == checkpoint.key())
                .cloned()
                .ok_or_else(|| Error::stale_checkpoint(format!("{} is no longer known", checkpoint)))?
        };

        let blobs = data.blobs.read();
        if let Some(missing) = snapshot.files.keys().find(|name| !blobs.contains_key(*name)) {
            return Err(Error::stale_checkpoint(format!(
                "{} lost file {} to compaction",
                checkpoint, missing
            )));
        }

        pins.insert(
            key,
            PinEntry {
                count: 1,
                files: snapshot.files.clone(),
            },
        );
        Ok(snapshot.files.clone())
    }

    fn unpin_files(&self, checkpoint: &Checkpoint) {
        let key = (checkpoint.shard_id.clone(), checkpoint.key());
        let mut pins = self.pins.lock();
        match pins.get_mut(&key) {
            Some(entry) if entry.count > 1 => entry.count -= 1,
            Some(_) => {
                pins.remove(&key);
            }
            None => tracing::warn!("Unpin of {} without a matching pin", checkpoint),
        }
    }

    fn read_chunk(&self, shard: &ShardId, file: &str, position: u64, len: usize) -> Result<Bytes> {
        let data = self.shard(shard)?;
        let blobs = data.blobs.read();
        let contents = blobs
            .get(file)
            .ok_or_else(|| Error::storage(format!("{} has no file {}", shard, file)))?;
        let start = usize::try_from(position)
            .ok()
            .filter(|start| *start <= contents.len())
            .ok_or_else(|| Error::storage(format!("position {} beyond end of {}", position, file)))?;
        let end = start.saturating_add(len).min(contents.len());
        Ok(contents.slice(start..end))
    }

    fn local_files(&self, shard: &ShardId) -> Result<FileMetadataMap> {
        match self.shard(shard) {
            Ok(data) => Ok(data.snapshot().files.clone()),
            Err(_) => Ok(FileMetadataMap::new()),
        }
    }

    fn apply_file_set(&self, set: SegmentFileSet) -> Result<()> {
        {
            let mut failing = self.failing_applies.lock();
            if *failing > 0 {
                *failing -= 1;
                return Err(Error::apply(format!(
                    "injected write failure applying {}",
                    set.checkpoint
                )));
            }
        }

        let data = self.shard_or_create(&set.checkpoint.shard_id, set.checkpoint.primary_term);

        // Validate everything before touching visible state.
        let mut blobs = data.blobs.write();
        let mut precopied = data.precopied.write();
        let mut next_blobs = HashMap::with_capacity(set.files.len());
        for (name, meta) in &set.files {
            let ahead = precopied
                .get(name)
                .filter(|(precopied_meta, _)| precopied_meta.is_same(meta))
                .map(|(_, contents)| contents);
            let contents = set
                .received
                .get(name)
                .or(ahead)
                .or_else(|| blobs.get(name))
                .cloned()
                .ok_or_else(|| Error::apply(format!("{} is neither received nor local", name)))?;
            let actual = FileMeta::from_contents(name.clone(), &contents);
            if !actual.is_same(meta) {
                return Err(Error::apply(format!("{} does not match its metadata", name)));
            }
            next_blobs.insert(name.clone(), contents);
        }

        precopied.retain(|name, _| !set.files.contains_key(name));
        *blobs = next_blobs;
        data.swap(SegmentSnapshot {
            checkpoint: set.checkpoint,
            files: set.files,
        });
        Ok(())
    }

    fn replication_mode(&self, shard: &ShardId) -> ReplicationMode {
        self.shard(shard).map(|data| data.mode).unwrap_or_default()
    }

    fn trim_translog(&self, checkpoint: &Checkpoint) -> Result<()> {
        let data = self.shard(&checkpoint.shard_id)?;
        *data.translog_trimmed_to.lock() = Some(checkpoint.key());
        Ok(())
    }

    fn store_precopied_files(
        &self,
        shard: &ShardId,
        files: &FileMetadataMap,
        mut received: HashMap<String, Bytes>,
    ) -> Result<()> {
        let mut verified = Vec::with_capacity(files.len());
        for (name, meta) in files {
            let contents = received
                .remove(name)
                .ok_or_else(|| Error::apply(format!("{} was not received", name)))?;
            if !FileMeta::from_contents(name.clone(), &contents).is_same(meta) {
                return Err(Error::apply(format!("{} does not match its metadata", name)));
            }
            verified.push((name.clone(), (meta.clone(), contents)));
        }

        let data = self.shard_or_create(shard, 0);
        data.precopied.write().extend(verified);
        Ok(())
    }

    fn precopied_files(&self, shard: &ShardId) -> FileMetadataMap {
        self.shard(shard)
            .map(|data| {
                data.precopied
                    .read()
                    .iter()
                    .map(|(name, (meta, _))| (name.clone(), meta.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard() -> ShardId {
        ShardId::new("logs", 0)
    }

    fn store() -> InMemorySegmentStore {
        let store = InMemorySegmentStore::new();
        store.create_shard(&shard(), 1, ReplicationMode::Full);
        store
    }

    fn file(name: &str, contents: &'static [u8]) -> (String, Bytes) {
        (name.to_string(), Bytes::from_static(contents))
    }

    #[test]
    fn test_commit_advances_checkpoint() {
        let store = store();
        let c0 = store.current_checkpoint(&shard()).unwrap();
        let c1 = store
            .commit(&shard(), vec![file("_0.cfs", b"zero")], &[])
            .unwrap();
        assert!(c1.is_ahead_of(&c0));
        assert_eq!(store.local_files(&shard()).unwrap().len(), 1);
    }

    #[test]
    fn test_compaction_respects_pins() {
        let store = store();
        store
            .commit(&shard(), vec![file("_0.cfs", b"zero"), file("_1.cfs", b"one")], &[])
            .unwrap();
        let pinned = store.current_checkpoint(&shard()).unwrap();
        store.pin_files(&pinned).unwrap();

        store
            .merge(&shard(), &["_0.cfs", "_1.cfs"], file("_2.cfs", b"zeroone"))
            .unwrap();
        assert!(store.compact(&shard()).unwrap().is_empty());
        assert!(store.contains_file(&shard(), "_0.cfs"));

        store.unpin_files(&pinned);
        assert_eq!(store.pin_count(&shard()), 0);
        assert_eq!(store.compact(&shard()).unwrap(), vec!["_0.cfs", "_1.cfs"]);
    }

    #[test]
    fn test_pin_superseded_checkpoint() {
        let store = store();
        let c1 = store
            .commit(&shard(), vec![file("_0.cfs", b"zero")], &[])
            .unwrap();
        store
            .merge(&shard(), &["_0.cfs"], file("_1.cfs", b"zero!"))
            .unwrap();

        // files still on disk: pinning the old checkpoint works
        store.pin_files(&c1).unwrap();
        store.unpin_files(&c1);

        store.compact(&shard()).unwrap();
        assert!(matches!(store.pin_files(&c1), Err(Error::StaleCheckpoint(_))));
    }

    #[test]
    fn test_read_chunk_bounds() {
        let store = store();
        store
            .commit(&shard(), vec![file("_0.cfs", b"abcdef")], &[])
            .unwrap();
        assert_eq!(&store.read_chunk(&shard(), "_0.cfs", 2, 3).unwrap()[..], b"cde");
        assert_eq!(&store.read_chunk(&shard(), "_0.cfs", 4, 10).unwrap()[..], b"ef");
        assert!(store.read_chunk(&shard(), "_0.cfs", 7, 1).is_err());
    }

    #[test]
    fn test_apply_is_all_or_nothing() {
        let primary = store();
        let checkpoint = primary
            .commit(&shard(), vec![file("_0.cfs", b"zero"), file("_1.cfs", b"one")], &[])
            .unwrap();
        let files = primary.local_files(&shard()).unwrap();

        let replica = InMemorySegmentStore::new();
        let mut received = HashMap::new();
        received.insert("_0.cfs".to_string(), Bytes::from_static(b"zero"));
        let partial = SegmentFileSet {
            checkpoint: checkpoint.clone(),
            files: files.clone(),
            received: received.clone(),
        };
        assert!(matches!(replica.apply_file_set(partial), Err(Error::Apply(_))));
        assert!(replica.local_files(&shard()).unwrap().is_empty());

        received.insert("_1.cfs".to_string(), Bytes::from_static(b"one"));
        replica
            .apply_file_set(SegmentFileSet {
                checkpoint: checkpoint.clone(),
                files,
                received,
            })
            .unwrap();
        assert_eq!(replica.current_checkpoint(&shard()).unwrap(), checkpoint);
    }

    #[test]
    fn test_staged_merge_survives_compaction_until_committed() {
        let store = store();
        store
            .commit(&shard(), vec![file("_0.cfs", b"zero"), file("_1.cfs", b"one")], &[])
            .unwrap();
        let merged = store
            .stage_merged_segment(&shard(), "_2.cfs", Bytes::from_static(b"zeroone"))
            .unwrap();
        assert_eq!(merged.segment_name, "_2.cfs");
        assert_eq!(merged.primary_term, 1);
        assert!(!store.local_files(&shard()).unwrap().contains_key("_2.cfs"));
        assert!(store.compact(&shard()).unwrap().is_empty());

        store
            .merge(&shard(), &["_0.cfs", "_1.cfs"], file("_2.cfs", b"zeroone"))
            .unwrap();
        assert_eq!(store.compact(&shard()).unwrap(), vec!["_0.cfs", "_1.cfs"]);
        assert!(store.contains_file(&shard(), "_2.cfs"));
    }

    #[test]
    fn test_precopied_files_complete_a_later_apply() {
        let primary = store();
        primary
            .commit(&shard(), vec![file("_0.cfs", b"zero"), file("_1.cfs", b"one")], &[])
            .unwrap();
        let merged = primary
            .stage_merged_segment(&shard(), "_2.cfs", Bytes::from_static(b"zeroone"))
            .unwrap();

        let replica = InMemorySegmentStore::new();
        let mut ahead = HashMap::new();
        ahead.insert("_2.cfs".to_string(), Bytes::from_static(b"zeroone"));
        replica
            .store_precopied_files(&shard(), &merged.files, ahead)
            .unwrap();
        assert!(replica.precopied_files(&shard()).contains_key("_2.cfs"));
        assert!(replica.local_files(&shard()).unwrap().is_empty());

        let checkpoint = primary
            .merge(&shard(), &["_0.cfs", "_1.cfs"], file("_2.cfs", b"zeroone"))
            .unwrap();
        replica
            .apply_file_set(SegmentFileSet {
                checkpoint,
                files: primary.local_files(&shard()).unwrap(),
                received: HashMap::new(),
            })
            .unwrap();
        assert!(replica.local_files(&shard()).unwrap().contains_key("_2.cfs"));
        assert!(replica.precopied_files(&shard()).is_empty());
    }

    #[test]
    fn test_precopied_file_must_match_metadata() {
        let replica = InMemorySegmentStore::new();
        let mut files = FileMetadataMap::new();
        files.insert(
            "_2.cfs".to_string(),
            FileMeta::from_contents("_2.cfs".to_string(), b"zeroone"),
        );
        let mut received = HashMap::new();
        received.insert("_2.cfs".to_string(), Bytes::from_static(b"garbage"));
        assert!(matches!(
            replica.store_precopied_files(&shard(), &files, received),
            Err(Error::Apply(_))
        ));
        assert!(replica.precopied_files(&shard()).is_empty());
    }

    #[test]
    fn test_injected_apply_failure() {
        let store = store();
        store.fail_next_apply(1);
        let checkpoint = store.current_checkpoint(&shard()).unwrap().next_generation();
        let set = SegmentFileSet {
            checkpoint,
            files: FileMetadataMap::new(),
            received: HashMap::new(),
        };
        assert!(store.apply_file_set(set.clone()).is_err());
        assert!(store.apply_file_set(set).is_ok());
    }
}
