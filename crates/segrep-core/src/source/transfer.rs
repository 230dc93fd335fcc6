//! Chunked push of segment files to a replica node

use super::session::SessionResources;
use crate::checkpoint::{FileMeta, ShardId};
use crate::protocol::{Ack, FileChunkRequest, ReplicationRequest};
use crate::retry::RetryableClient;
use crate::{Error, Result};
use tokio_util::sync::CancellationToken;

/// Sends whole files one chunk at a time, throttled and cancellable
pub(crate) struct FileSender<'a> {
    pub(crate) resources: &'a SessionResources,
    pub(crate) client: &'a RetryableClient,
    pub(crate) token: &'a CancellationToken,
    pub(crate) replication_id: u64,
    pub(crate) shard: &'a ShardId,
    /// Wraps each chunk into the request variant of the transfer
    pub(crate) wrap: fn(FileChunkRequest) -> ReplicationRequest,
}

impl FileSender<'_> {
    /// Send `file`, calling `on_chunk` after every acknowledged chunk.
    ///
    /// Returns the bytes sent.
    pub(crate) async fn send_file<F>(&self, file: &FileMeta, on_chunk: F) -> Result<u64>
    where
        F: Fn(),
    {
        let mut position = 0u64;
        loop {
            if self.token.is_cancelled() {
                return Err(Error::cancelled("transfer cancelled"));
            }

            let data = self.resources.store.read_chunk(
                self.shard,
                &file.name,
                position,
                self.resources.chunk_size,
            )?;
            let len = data.len() as u64;
            let last_chunk = position + len >= file.length;
            if len == 0 && !last_chunk {
                return Err(Error::storage(format!(
                    "{} ended at {} of {} bytes",
                    file.name, position, file.length
                )));
            }

            if let Some(throttle) = &self.resources.throttle {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => return Err(Error::cancelled("transfer cancelled")),
                    _ = throttle.acquire(data.len()) => {}
                }
            }

            let chunk = FileChunkRequest::new(
                self.replication_id,
                self.shard.clone(),
                file.clone(),
                position,
                data,
                last_chunk,
            );
            let request = (self.wrap)(chunk);
            self.client.execute::<Ack>(request.action(), request).await?;
            on_chunk();

            position += len;
            if last_chunk {
                return Ok(position);
            }
        }
    }
}
