//! Pinned file sets served to replicas
//!
//! A [`CopyState`] is a handle on the file set of one checkpoint. The registry
//! materializes at most one pin per checkpoint and counts the handles sharing
//! it; the storage engine pin is taken with the first handle and dropped with
//! the last.

use crate::checkpoint::{Checkpoint, CheckpointKey, FileMetadataMap, ShardId};
use crate::storage::SegmentStore;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
struct PinnedFiles {
    checkpoint: Checkpoint,
    files: FileMetadataMap,
}

struct RegistryEntry {
    pinned: Arc<PinnedFiles>,
    refs: usize,
}

/// Reference-counted registry of pinned checkpoints
pub struct CopyStateRegistry {
    store: Arc<dyn SegmentStore>,
    entries: Mutex<HashMap<(ShardId, CheckpointKey), RegistryEntry>>,
}

impl CopyStateRegistry {
    /// Create a registry pinning files in `store`
    pub fn new(store: Arc<dyn SegmentStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Current committed checkpoint of `shard`
    pub fn create_checkpoint(&self, shard: &ShardId) -> Result<Checkpoint> {
        self.store.current_checkpoint(shard)
    }

    /// Take a handle on the files of `checkpoint`
    pub fn pin(self: &Arc<Self>, checkpoint: &Checkpoint) -> Result<CopyState> {
        let key = (checkpoint.shard_id.clone(), checkpoint.key());
        let mut entries = self.entries.lock();

        let pinned = match entries.get_mut(&key) {
            Some(entry) => {
                entry.refs += 1;
                Arc::clone(&entry.pinned)
            }
            None => {
                let files = self.store.pin_files(checkpoint)?;
                let pinned = Arc::new(PinnedFiles {
                    checkpoint: checkpoint.clone(),
                    files,
                });
                entries.insert(
                    key,
                    RegistryEntry {
                        pinned: Arc::clone(&pinned),
                        refs: 1,
                    },
                );
                tracing::trace!("Pinned {}", checkpoint);
                pinned
            }
        };

        Ok(CopyState {
            pinned,
            registry: Arc::clone(self),
            released: AtomicBool::new(false),
        })
    }

    /// Pin the current checkpoint of `shard`, retrying when it is superseded
    /// between reading and pinning.
    pub fn acquire_current(self: &Arc<Self>, shard: &ShardId, attempts: u32) -> Result<CopyState> {
        let attempts = attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let checkpoint = self.create_checkpoint(shard)?;
            match self.pin(&checkpoint) {
                Err(Error::StaleCheckpoint(msg)) if attempt < attempts => {
                    tracing::debug!("Checkpoint moved while pinning {}: {}", shard, msg);
                }
                other => return other,
            }
        }
    }

    /// Handles currently sharing the pin of `checkpoint`
    pub fn ref_count(&self, checkpoint: &Checkpoint) -> usize {
        self.entries
            .lock()
            .get(&(checkpoint.shard_id.clone(), checkpoint.key()))
            .map_or(0, |entry| entry.refs)
    }

    /// Checkpoints currently pinned
    pub fn pinned_count(&self) -> usize {
        self.entries.lock().len()
    }

    fn release(&self, checkpoint: &Checkpoint) {
        let key = (checkpoint.shard_id.clone(), checkpoint.key());
        let mut entries = self.entries.lock();
        match entries.get_mut(&key) {
            Some(entry) if entry.refs > 1 => entry.refs -= 1,
            Some(_) => {
                entries.remove(&key);
                self.store.unpin_files(checkpoint);
                tracing::trace!("Unpinned {}", checkpoint);
            }
            None => {
                debug_assert!(false, "released {} more often than pinned", checkpoint);
                tracing::error!("Released {} more often than pinned", checkpoint);
            }
        }
    }
}

/// Handle on the pinned file set of one checkpoint.
///
/// Released once, either explicitly or on drop.
pub struct CopyState {
    pinned: Arc<PinnedFiles>,
    registry: Arc<CopyStateRegistry>,
    released: AtomicBool,
}

impl CopyState {
    /// Checkpoint whose files are pinned
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.pinned.checkpoint
    }

    /// Pinned files in name order
    pub fn files(&self) -> &FileMetadataMap {
        &self.pinned.files
    }

    /// Release the pin; later calls do nothing
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.registry.release(&self.pinned.checkpoint);
        }
    }

    /// Whether [`CopyState::release`] already ran
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for CopyState {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for CopyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyState")
            .field("checkpoint", &self.pinned.checkpoint)
            .field("files", &self.pinned.files.len())
            .field("released", &self.is_released())
            .finish()
    }
}
