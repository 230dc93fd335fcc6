//! Replication wire protocol
//!
//! Requests and responses exchanged between primary and replica nodes, the
//! action names they travel under, and a CRC-validated envelope.
//!
//! Envelope format: `[message_type:1][length:4][payload:N][crc32:4]`, with
//! the payload serialized by bincode and the CRC computed over type, length
//! and payload.

use crate::checkpoint::{
    AllocationId, Checkpoint, FileMeta, FileMetadataMap, MergedSegmentCheckpoint, NodeId, ShardId,
};
use crate::error::RemoteError;
use crate::{Error, Result};
use bytes::Bytes;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

/// Action names
pub mod actions {
    /// Replica -> primary: open a session, learn the served checkpoint
    pub const GET_CHECKPOINT_INFO: &str = "internal:index/shard/replication/get_checkpoint_info";
    /// Replica -> primary: transfer the listed files
    pub const GET_SEGMENT_FILES: &str = "internal:index/shard/replication/get_segment_files";
    /// Replica -> primary: checkpoint now visible on the replica
    pub const UPDATE_VISIBLE_CHECKPOINT: &str =
        "internal:index/shard/replication/update_visible_checkpoint";
    /// Replica -> primary: abandon a session early
    pub const CANCEL_REPLICATION: &str = "internal:index/shard/replication/cancel";
    /// Primary -> replica: one chunk of one file
    pub const FILE_CHUNK: &str = "internal:index/shard/replication/file_chunk";
    /// Primary -> replica: a new checkpoint exists
    pub const PUBLISH_CHECKPOINT: &str = "indices:admin/publish_checkpoint";
    /// Primary -> replica: a merged segment can be copied ahead of its commit
    pub const PUBLISH_MERGED_SEGMENT: &str = "indices:admin/publish_merged_segment";
    /// Replica -> primary: transfer the files of a merged segment
    pub const GET_MERGED_SEGMENT_FILES: &str =
        "internal:index/shard/replication/get_merged_segment_files";
    /// Primary -> replica: one chunk of one merged segment file
    pub const MERGED_SEGMENT_FILE_CHUNK: &str =
        "internal:index/shard/replication/merged_segment_file_chunk";
}

/// Replica asks the primary to open a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfoRequest {
    /// Replica-chosen id of this pull
    pub replication_id: u64,
    /// Checkpoint the replica was told about
    pub checkpoint: Checkpoint,
    /// Allocation id of the replica shard copy
    pub replica: AllocationId,
    /// Node hosting the replica; chunks are pushed here
    pub target_node: NodeId,
}

/// Checkpoint the primary will serve and its files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfoResponse {
    /// Served checkpoint, may be newer than the requested one
    pub checkpoint: Checkpoint,
    /// Files of the served checkpoint
    pub files: FileMetadataMap,
}

/// Replica asks the primary to push the listed files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSegmentFilesRequest {
    /// Must match the id sent with the checkpoint info request
    pub replication_id: u64,
    /// Checkpoint being served
    pub checkpoint: Checkpoint,
    /// Allocation id of the replica shard copy
    pub replica: AllocationId,
    /// Node hosting the replica
    pub target_node: NodeId,
    /// Files the replica is missing
    pub requested_files: Vec<FileMeta>,
}

/// Files that were transferred
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSegmentFilesResponse {
    /// Transferred files, in transfer order
    pub transferred_files: Vec<FileMeta>,
}

/// One chunk of one file pushed by the primary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunkRequest {
    /// Pull this chunk belongs to
    pub replication_id: u64,
    /// Shard being replicated
    pub shard_id: ShardId,
    /// Metadata of the whole file
    pub file: FileMeta,
    /// Byte offset of `data` within the file
    pub position: u64,
    /// Chunk contents
    pub data: Bytes,
    /// CRC32 of `data`
    pub checksum: u32,
    /// Last chunk of the file
    pub last_chunk: bool,
}

impl FileChunkRequest {
    /// Build a chunk, computing its checksum
    pub fn new(
        replication_id: u64,
        shard_id: ShardId,
        file: FileMeta,
        position: u64,
        data: Bytes,
        last_chunk: bool,
    ) -> Self {
        let checksum = crc32fast::hash(&data);
        Self {
            replication_id,
            shard_id,
            file,
            position,
            data,
            checksum,
            last_chunk,
        }
    }
}

/// Primary tells a replica about a new checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishCheckpointRequest {
    /// The new checkpoint
    pub checkpoint: Checkpoint,
    /// Node hosting the primary
    pub primary_node: NodeId,
}

/// Replica reports the checkpoint it now serves reads from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateVisibleCheckpointRequest {
    /// Primary shard
    pub shard_id: ShardId,
    /// Allocation id of the replica
    pub replica: AllocationId,
    /// Applied checkpoint
    pub checkpoint: Checkpoint,
}

/// Primary announces a merged segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishMergedSegmentRequest {
    /// The merged segment
    pub checkpoint: MergedSegmentCheckpoint,
    /// Node hosting the primary
    pub primary_node: NodeId,
}

/// Replica asks the primary to push files of a merged segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetMergedSegmentFilesRequest {
    /// Replica-chosen id, routes the chunks to the right writer
    pub replication_id: u64,
    /// The merged segment
    pub checkpoint: MergedSegmentCheckpoint,
    /// Allocation id of the replica shard copy
    pub replica: AllocationId,
    /// Node hosting the replica
    pub target_node: NodeId,
    /// Files of the segment the replica is missing
    pub requested_files: Vec<FileMeta>,
}

/// Replica abandons a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelReplicationRequest {
    /// Pull being abandoned; `None` matches whatever session the replica
    /// holds for the shard
    pub replication_id: Option<u64>,
    /// Primary shard
    pub shard_id: ShardId,
    /// Allocation id of the replica
    pub replica: AllocationId,
    /// Why
    pub reason: String,
}

/// Acknowledgement without payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack;

/// Any request a replication node handles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationRequest {
    /// See [`CheckpointInfoRequest`]
    CheckpointInfo(CheckpointInfoRequest),
    /// See [`GetSegmentFilesRequest`]
    GetSegmentFiles(GetSegmentFilesRequest),
    /// See [`FileChunkRequest`]
    FileChunk(FileChunkRequest),
    /// See [`PublishCheckpointRequest`]
    PublishCheckpoint(PublishCheckpointRequest),
    /// See [`UpdateVisibleCheckpointRequest`]
    UpdateVisibleCheckpoint(UpdateVisibleCheckpointRequest),
    /// See [`CancelReplicationRequest`]
    CancelReplication(CancelReplicationRequest),
    /// See [`PublishMergedSegmentRequest`]
    PublishMergedSegment(PublishMergedSegmentRequest),
    /// See [`GetMergedSegmentFilesRequest`]
    GetMergedSegmentFiles(GetMergedSegmentFilesRequest),
    /// One chunk of a merged segment file
    MergedSegmentFileChunk(FileChunkRequest),
}

impl ReplicationRequest {
    /// Action this request travels under
    pub fn action(&self) -> &'static str {
        match self {
            Self::CheckpointInfo(_) => actions::GET_CHECKPOINT_INFO,
            Self::GetSegmentFiles(_) => actions::GET_SEGMENT_FILES,
            Self::FileChunk(_) => actions::FILE_CHUNK,
            Self::PublishCheckpoint(_) => actions::PUBLISH_CHECKPOINT,
            Self::UpdateVisibleCheckpoint(_) => actions::UPDATE_VISIBLE_CHECKPOINT,
            Self::CancelReplication(_) => actions::CANCEL_REPLICATION,
            Self::PublishMergedSegment(_) => actions::PUBLISH_MERGED_SEGMENT,
            Self::GetMergedSegmentFiles(_) => actions::GET_MERGED_SEGMENT_FILES,
            Self::MergedSegmentFileChunk(_) => actions::MERGED_SEGMENT_FILE_CHUNK,
        }
    }
}

/// Any response a replication node returns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationResponse {
    /// See [`CheckpointInfoResponse`]
    CheckpointInfo(CheckpointInfoResponse),
    /// See [`GetSegmentFilesResponse`]
    SegmentFiles(GetSegmentFilesResponse),
    /// See [`Ack`]
    Ack,
}

impl From<Ack> for ReplicationResponse {
    fn from(_: Ack) -> Self {
        Self::Ack
    }
}

impl From<CheckpointInfoResponse> for ReplicationResponse {
    fn from(response: CheckpointInfoResponse) -> Self {
        Self::CheckpointInfo(response)
    }
}

impl From<GetSegmentFilesResponse> for ReplicationResponse {
    fn from(response: GetSegmentFilesResponse) -> Self {
        Self::SegmentFiles(response)
    }
}

impl TryFrom<ReplicationResponse> for Ack {
    type Error = Error;

    fn try_from(response: ReplicationResponse) -> Result<Self> {
        match response {
            ReplicationResponse::Ack => Ok(Ack),
            other => Err(unexpected("Ack", &other)),
        }
    }
}

impl TryFrom<ReplicationResponse> for CheckpointInfoResponse {
    type Error = Error;

    fn try_from(response: ReplicationResponse) -> Result<Self> {
        match response {
            ReplicationResponse::CheckpointInfo(info) => Ok(info),
            other => Err(unexpected("CheckpointInfo", &other)),
        }
    }
}

impl TryFrom<ReplicationResponse> for GetSegmentFilesResponse {
    type Error = Error;

    fn try_from(response: ReplicationResponse) -> Result<Self> {
        match response {
            ReplicationResponse::SegmentFiles(files) => Ok(files),
            other => Err(unexpected("SegmentFiles", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &ReplicationResponse) -> Error {
    Error::protocol(format!("expected {expected} response, got {got:?}"))
}

/// Envelope message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMessageType {
    /// Checkpoint info request
    CheckpointInfo = 0x01,
    /// Get segment files request
    GetSegmentFiles = 0x02,
    /// File chunk request
    FileChunk = 0x03,
    /// Publish checkpoint request
    PublishCheckpoint = 0x04,
    /// Update visible checkpoint request
    UpdateVisibleCheckpoint = 0x05,
    /// Cancel replication request
    CancelReplication = 0x06,
    /// Publish merged segment request
    PublishMergedSegment = 0x07,
    /// Get merged segment files request
    GetMergedSegmentFiles = 0x08,
    /// Merged segment file chunk request
    MergedSegmentFileChunk = 0x09,
    /// Successful response
    Response = 0x10,
    /// Error response
    Error = 0xFF,
}

impl TryFrom<u8> for ReplicationMessageType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::CheckpointInfo),
            0x02 => Ok(Self::GetSegmentFiles),
            0x03 => Ok(Self::FileChunk),
            0x04 => Ok(Self::PublishCheckpoint),
            0x05 => Ok(Self::UpdateVisibleCheckpoint),
            0x06 => Ok(Self::CancelReplication),
            0x07 => Ok(Self::PublishMergedSegment),
            0x08 => Ok(Self::GetMergedSegmentFiles),
            0x09 => Ok(Self::MergedSegmentFileChunk),
            0x10 => Ok(Self::Response),
            0xFF => Ok(Self::Error),
            _ => Err(Error::codec(format!("Unknown message type: {}", value))),
        }
    }
}

/// Envelope around requests and responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// A request from `from`
    Request {
        /// Correlation id
        request_id: u64,
        /// Sending node
        from: NodeId,
        /// Payload
        request: ReplicationRequest,
    },
    /// Successful response
    Response {
        /// Correlation id
        request_id: u64,
        /// Payload
        response: ReplicationResponse,
    },
    /// Handler failure
    Error {
        /// Correlation id
        request_id: u64,
        /// Failure
        error: RemoteError,
    },
}

impl ReplicationMessage {
    /// Get message type
    pub fn message_type(&self) -> ReplicationMessageType {
        match self {
            Self::Request { request, .. } => match request {
                ReplicationRequest::CheckpointInfo(_) => ReplicationMessageType::CheckpointInfo,
                ReplicationRequest::GetSegmentFiles(_) => ReplicationMessageType::GetSegmentFiles,
                ReplicationRequest::FileChunk(_) => ReplicationMessageType::FileChunk,
                ReplicationRequest::PublishCheckpoint(_) => {
                    ReplicationMessageType::PublishCheckpoint
                }
                ReplicationRequest::UpdateVisibleCheckpoint(_) => {
                    ReplicationMessageType::UpdateVisibleCheckpoint
                }
                ReplicationRequest::CancelReplication(_) => {
                    ReplicationMessageType::CancelReplication
                }
                ReplicationRequest::PublishMergedSegment(_) => {
                    ReplicationMessageType::PublishMergedSegment
                }
                ReplicationRequest::GetMergedSegmentFiles(_) => {
                    ReplicationMessageType::GetMergedSegmentFiles
                }
                ReplicationRequest::MergedSegmentFileChunk(_) => {
                    ReplicationMessageType::MergedSegmentFileChunk
                }
            },
            Self::Response { .. } => ReplicationMessageType::Response,
            Self::Error { .. } => ReplicationMessageType::Error,
        }
    }

    /// Encode message to bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|e| Error::codec(format!("Serialization failed: {}", e)))?;

        let mut buf = Vec::with_capacity(1 + 4 + payload.len() + 4);
        buf.push(self.message_type() as u8);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);

        let mut hasher = Hasher::new();
        hasher.update(&buf);
        let crc = hasher.finalize();
        buf.extend_from_slice(&crc.to_le_bytes());

        Ok(buf)
    }

    /// Decode message from bytes
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 9 {
            // type(1) + length(4) + crc(4)
            return Err(Error::codec("Message too short"));
        }

        let crc_offset = buf.len() - 4;
        let stored_crc = read_u32(&buf[crc_offset..])?;

        let mut hasher = Hasher::new();
        hasher.update(&buf[..crc_offset]);
        let computed_crc = hasher.finalize();

        if stored_crc != computed_crc {
            return Err(Error::codec(format!(
                "CRC mismatch: expected {:x}, got {:x}",
                stored_crc, computed_crc
            )));
        }

        let msg_type = ReplicationMessageType::try_from(buf[0])?;
        let length = read_u32(&buf[1..5])? as usize;
        if buf.len() != 5 + length + 4 {
            return Err(Error::codec("Incomplete message"));
        }

        let message: Self = bincode::deserialize(&buf[5..5 + length])
            .map_err(|e| Error::codec(format!("Deserialization failed: {}", e)))?;

        if message.message_type() != msg_type {
            return Err(Error::codec(format!(
                "Message type byte {:?} does not match payload {:?}",
                msg_type,
                message.message_type()
            )));
        }

        Ok(message)
    }
}

fn read_u32(bytes: &[u8]) -> Result<u32> {
    let array: [u8; 4] = bytes
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::codec("Truncated integer"))?;
    Ok(u32::from_le_bytes(array))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteErrorKind;

    fn chunk() -> ReplicationMessage {
        let file = FileMeta::from_contents("_0.cfs", b"hello world");
        ReplicationMessage::Request {
            request_id: 7,
            from: "primary".into(),
            request: ReplicationRequest::FileChunk(FileChunkRequest::new(
                3,
                ShardId::new("logs", 0),
                file,
                0,
                Bytes::from_static(b"hello"),
                false,
            )),
        }
    }

    #[test]
    fn test_message_encode_decode() {
        let msg = chunk();
        let encoded = msg.encode().unwrap();
        assert_eq!(encoded[0], ReplicationMessageType::FileChunk as u8);
        assert_eq!(ReplicationMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_corrupted_message_rejected() {
        let mut encoded = chunk().encode().unwrap();
        encoded[8] ^= 0xFF;
        assert!(matches!(
            ReplicationMessage::decode(&encoded),
            Err(Error::Codec(_))
        ));
    }

    #[test]
    fn test_short_message_rejected() {
        assert!(ReplicationMessage::decode(&[0x10, 0, 0]).is_err());
    }

    #[test]
    fn test_error_message() {
        let msg = ReplicationMessage::Error {
            request_id: 1,
            error: RemoteError::new(RemoteErrorKind::UnknownFile, "_9.si"),
        };
        let decoded = ReplicationMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.message_type(), ReplicationMessageType::Error);
    }

    #[test]
    fn test_response_conversion() {
        let response = ReplicationResponse::from(GetSegmentFilesResponse::default());
        assert!(Ack::try_from(response.clone()).is_err());
        assert!(GetSegmentFilesResponse::try_from(response).is_ok());
    }

    #[test]
    fn test_request_actions() {
        let publish = ReplicationRequest::PublishCheckpoint(PublishCheckpointRequest {
            checkpoint: Checkpoint::empty(ShardId::new("a", 0), 1, "c"),
            primary_node: "p".into(),
        });
        assert_eq!(publish.action(), actions::PUBLISH_CHECKPOINT);
        assert_eq!(
            ReplicationRequest::CancelReplication(CancelReplicationRequest {
                replication_id: Some(1),
                shard_id: ShardId::new("a", 0),
                replica: "r".into(),
                reason: "x".into(),
            })
            .action(),
            actions::CANCEL_REPLICATION
        );
    }

    #[test]
    fn test_merged_segment_chunk_has_its_own_type() {
        let file = FileMeta::from_contents("_4.cfs", b"merged");
        let chunk = FileChunkRequest::new(9, ShardId::new("a", 0), file, 0, Bytes::from_static(b"merged"), true);
        let request = ReplicationRequest::MergedSegmentFileChunk(chunk);
        assert_eq!(request.action(), actions::MERGED_SEGMENT_FILE_CHUNK);

        let msg = ReplicationMessage::Request {
            request_id: 2,
            from: "primary".into(),
            request,
        };
        let encoded = msg.encode().unwrap();
        assert_eq!(encoded[0], ReplicationMessageType::MergedSegmentFileChunk as u8);
        assert_eq!(ReplicationMessage::decode(&encoded).unwrap(), msg);
    }
}
