//! Error types for segment replication

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using the replication [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for segment replication
#[derive(Error, Debug)]
pub enum Error {
    /// The checkpoint was superseded and its files are gone; retry against
    /// the current checkpoint.
    #[error("Stale checkpoint: {0}")]
    StaleCheckpoint(String),

    /// An active session already exists for this primary/replica pair
    #[error("Replication already in progress for {shard} -> {replica}")]
    ReplicationAlreadyInProgress {
        /// Primary shard
        shard: String,
        /// Replica allocation id
        replica: String,
    },

    /// A replica asked for a file the copy state does not contain
    #[error("Unknown file requested: {0}")]
    UnknownFile(String),

    /// Replication protocol violation (session-fatal, not shard-fatal)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Received data did not match its checksum
    #[error("Checksum mismatch for {file}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// File name
        file: String,
        /// Expected CRC32
        expected: u32,
        /// Computed CRC32
        actual: u32,
    },

    /// Deliberate cancellation
    #[error("Execution cancelled: {reason}")]
    Cancelled {
        /// Why the work was cancelled
        reason: String,
    },

    /// Transport failure of a single request
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A retryable request kept failing until its retry timeout elapsed
    #[error("Retries exhausted for {action} after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Action name
        action: String,
        /// Attempts made
        attempts: u32,
        /// Last failure
        #[source]
        source: Box<Error>,
    },

    /// Applying a received file set failed; fatal to the shard
    #[error("Apply error: {0}")]
    Apply(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Envelope encoding/decoding errors
    #[error("Codec error: {0}")]
    Codec(String),

    /// I/O errors from the storage engine
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a stale checkpoint error
    pub fn stale_checkpoint(msg: impl Into<String>) -> Self {
        Self::StaleCheckpoint(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a cancellation error
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Create an apply error
    pub fn apply(msg: impl Into<String>) -> Self {
        Self::Apply(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for deliberate cancellation, including a cancellation reported
    /// by the remote side of a request.
    pub fn is_cancelled(&self) -> bool {
        self.remote_kind() == Some(RemoteErrorKind::Cancelled)
            || matches!(self, Self::Cancelled { .. })
    }

    /// Kind of this error as seen on the wire.
    ///
    /// Errors that came back from a remote node keep their original kind.
    pub fn remote_kind(&self) -> Option<RemoteErrorKind> {
        match self {
            Self::Transport(TransportError::Remote(remote)) => Some(remote.kind),
            Self::RetriesExhausted { source, .. } => source.remote_kind(),
            Self::StaleCheckpoint(_) => Some(RemoteErrorKind::StaleCheckpoint),
            Self::ReplicationAlreadyInProgress { .. } => {
                Some(RemoteErrorKind::ReplicationAlreadyInProgress)
            }
            Self::UnknownFile(_) => Some(RemoteErrorKind::UnknownFile),
            Self::Protocol(_) | Self::ChecksumMismatch { .. } | Self::Codec(_) => {
                Some(RemoteErrorKind::Protocol)
            }
            Self::Cancelled { .. } => Some(RemoteErrorKind::Cancelled),
            _ => None,
        }
    }

    /// Convert into the serializable form sent back to a requesting node
    pub fn to_remote(&self) -> RemoteError {
        RemoteError {
            kind: self.remote_kind().unwrap_or(RemoteErrorKind::Internal),
            message: self.to_string(),
        }
    }
}

/// Classification of an error returned by a remote handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// Remote node is overloaded or rejected the execution
    Rejected,
    /// See [`Error::StaleCheckpoint`]
    StaleCheckpoint,
    /// See [`Error::ReplicationAlreadyInProgress`]
    ReplicationAlreadyInProgress,
    /// See [`Error::UnknownFile`]
    UnknownFile,
    /// See [`Error::Protocol`]
    Protocol,
    /// Remote work was cancelled
    Cancelled,
    /// Anything else
    Internal,
}

/// Error returned by a remote request handler
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("[{kind:?}] {message}")]
pub struct RemoteError {
    /// Error classification
    pub kind: RemoteErrorKind,
    /// Human readable message
    pub message: String,
}

impl RemoteError {
    /// Create a remote error
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Remote side is overloaded
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Rejected, message)
    }
}

/// Failure of a single request/response exchange
#[derive(Error, Debug)]
pub enum TransportError {
    /// Could not establish a connection to the target node
    #[error("Failed to connect to {node}: {source}")]
    Connect {
        /// Target node
        node: String,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    /// Target node is not known to the transport
    #[error("Node {0} is not connected")]
    NodeNotConnected(String),

    /// Sending the request failed
    #[error("Failed to send {action}: {source}")]
    Send {
        /// Action name
        action: String,
        /// Cause
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// No response within the request timeout
    #[error("Request {action} timed out after {timeout:?}")]
    Timeout {
        /// Action name
        action: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// The remote handler returned an error
    #[error("Remote error: {0}")]
    Remote(#[source] RemoteError),

    /// The response could not be decoded or had the wrong shape
    #[error("Invalid response for {action}: {message}")]
    InvalidResponse {
        /// Action name
        action: String,
        /// Details
        message: String,
    },
}

/// Whether a failure is worth retrying.
///
/// Walks the whole `source()` chain because the transport wraps failures:
/// a send failure only counts when a connection failure sits underneath it.
pub fn is_retryable(error: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(err) = current {
        if let Some(transport) = err.downcast_ref::<TransportError>() {
            match transport {
                TransportError::Connect { .. } | TransportError::NodeNotConnected(_) => {
                    return true;
                }
                TransportError::Remote(remote) if remote.kind == RemoteErrorKind::Rejected => {
                    return true;
                }
                _ => {}
            }
        }
        if let Some(remote) = err.downcast_ref::<RemoteError>() {
            if remote.kind == RemoteErrorKind::Rejected {
                return true;
            }
        }
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
            ) {
                return true;
            }
        }
        current = err.source();
    }
    false
}
