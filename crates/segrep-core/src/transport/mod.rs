//! Node-to-node request/response transport
//!
//! The replication layer only needs a reliable request/response channel: each
//! request either yields one response or one [`TransportError`]. Real network
//! transports live outside this crate; [`local::LocalHub`] wires nodes
//! together in-process.

pub mod local;

pub use local::{Fault, LocalHub, LocalTransport};

use crate::Result;
use crate::error::TransportError;
use crate::protocol::{ReplicationRequest, ReplicationResponse};
use async_trait::async_trait;
use std::time::Duration;

/// Per-request options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    /// Time to wait for the response
    pub timeout: Duration,
}

impl RequestOptions {
    /// Options with the given timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

/// Outbound side of the transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request to `target` and wait for its response
    async fn send_request(
        &self,
        target: &str,
        action: &str,
        request: &ReplicationRequest,
        options: RequestOptions,
    ) -> std::result::Result<ReplicationResponse, TransportError>;

    /// Identity of the sending node
    fn local_node(&self) -> &str;
}

/// Inbound side: one handler per node
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle a request sent by `from`
    async fn handle(&self, from: &str, request: ReplicationRequest) -> Result<ReplicationResponse>;
}
