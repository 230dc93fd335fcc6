//! Reassembly of pushed file chunks on the replica

use crate::checkpoint::{FileMeta, ShardId};
use crate::protocol::FileChunkRequest;
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

struct FileProgress {
    meta: FileMeta,
    buffer: BytesMut,
    complete: bool,
}

/// Collects the files of one pull, chunk by chunk
pub struct MultiFileWriter {
    replication_id: u64,
    shard_id: ShardId,
    files: Mutex<BTreeMap<String, FileProgress>>,
}

impl MultiFileWriter {
    /// Expect `expected` files for pull `replication_id`
    pub fn new(replication_id: u64, shard_id: ShardId, expected: &[FileMeta]) -> Self {
        let files = expected
            .iter()
            .map(|meta| {
                let progress = FileProgress {
                    meta: meta.clone(),
                    buffer: BytesMut::with_capacity(meta.length.min(1 << 20) as usize),
                    complete: false,
                };
                (meta.name.clone(), progress)
            })
            .collect();
        Self {
            replication_id,
            shard_id,
            files: Mutex::new(files),
        }
    }

    /// Pull this writer belongs to
    pub fn replication_id(&self) -> u64 {
        self.replication_id
    }

    /// Verify and append one chunk.
    ///
    /// A resent chunk whose bytes were already received is accepted as is.
    pub fn write_chunk(&self, chunk: &FileChunkRequest) -> Result<()> {
        if chunk.replication_id != self.replication_id || chunk.shard_id != self.shard_id {
            return Err(Error::protocol(format!(
                "chunk of {} for pull {} sent to pull {} of {}",
                chunk.shard_id, chunk.replication_id, self.replication_id, self.shard_id
            )));
        }

        let actual = crc32fast::hash(&chunk.data);
        if actual != chunk.checksum {
            return Err(Error::ChecksumMismatch {
                file: chunk.file.name.clone(),
                expected: chunk.checksum,
                actual,
            });
        }

        let mut files = self.files.lock();
        let progress = files
            .get_mut(&chunk.file.name)
            .ok_or_else(|| Error::UnknownFile(chunk.file.name.clone()))?;
        if !progress.meta.is_same(&chunk.file) {
            return Err(Error::protocol(format!(
                "metadata of {} changed during the pull",
                chunk.file.name
            )));
        }

        let received = progress.buffer.len() as u64;
        let end = chunk.position + chunk.data.len() as u64;
        if chunk.position > received {
            return Err(Error::protocol(format!(
                "gap in {}: chunk at {} but only {} bytes received",
                chunk.file.name, chunk.position, received
            )));
        }
        if chunk.last_chunk && end < received {
            return Err(Error::protocol(format!(
                "last chunk of {} ends at {} but {} bytes were received",
                chunk.file.name, end, received
            )));
        }
        if end <= received && (progress.complete || !chunk.last_chunk) {
            tracing::trace!("Duplicate chunk of {} at {}", chunk.file.name, chunk.position);
            return Ok(());
        }

        if end > received {
            if progress.complete {
                return Err(Error::protocol(format!("{} already complete", chunk.file.name)));
            }
            let skip = (received - chunk.position) as usize;
            progress.buffer.extend_from_slice(&chunk.data[skip..]);
            if progress.buffer.len() as u64 > progress.meta.length {
                return Err(Error::protocol(format!(
                    "{} is longer than its {} bytes",
                    chunk.file.name, progress.meta.length
                )));
            }
        }

        if chunk.last_chunk {
            let checksum = crc32fast::hash(&progress.buffer);
            if progress.buffer.len() as u64 != progress.meta.length || checksum != progress.meta.checksum {
                return Err(Error::ChecksumMismatch {
                    file: chunk.file.name.clone(),
                    expected: progress.meta.checksum,
                    actual: checksum,
                });
            }
            progress.complete = true;
        }
        Ok(())
    }

    /// Bytes received so far across all files
    pub fn bytes_received(&self) -> u64 {
        self.files
            .lock()
            .values()
            .map(|progress| progress.buffer.len() as u64)
            .sum()
    }

    /// Files still incomplete
    pub fn incomplete(&self) -> Vec<String> {
        self.files
            .lock()
            .iter()
            .filter(|(_, progress)| !progress.complete)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Hand out the received files once every expected file is complete
    pub fn finish(&self) -> Result<HashMap<String, Bytes>> {
        let mut files = self.files.lock();
        if let Some((name, _)) = files.iter().find(|(_, progress)| !progress.complete) {
            return Err(Error::protocol(format!(
                "transfer ended before {} was complete",
                name
            )));
        }
        Ok(std::mem::take(&mut *files)
            .into_iter()
            .map(|(name, progress)| (name, progress.buffer.freeze()))
            .collect())
    }
}
