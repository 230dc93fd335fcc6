//! In-process transport
//!
//! Every request is encoded into a [`ReplicationMessage`] envelope, decoded on
//! the "remote" side and handled on its own task, so handlers keep running
//! when the caller gives up on the response, just as a remote node would.
//! Faults can be injected per action and target.

use super::{RequestHandler, RequestOptions, Transport};
use crate::checkpoint::NodeId;
use crate::error::{RemoteError, RemoteErrorKind, TransportError};
use crate::protocol::{ReplicationMessage, ReplicationRequest, ReplicationResponse};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Injected failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Connection refused
    ConnectRefused,
    /// Send failed because the connection dropped
    SendFailure,
    /// Remote node rejected the execution (overloaded)
    Rejected,
    /// Remote handler failed with the given kind
    Remote(RemoteErrorKind),
    /// No response within the request timeout
    Timeout,
}

impl Fault {
    fn into_error(self, target: &str, action: &str, options: RequestOptions) -> TransportError {
        match self {
            Fault::ConnectRefused => TransportError::Connect {
                node: target.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ),
            },
            Fault::SendFailure => TransportError::Send {
                action: action.to_string(),
                source: Box::new(TransportError::NodeNotConnected(target.to_string())),
            },
            Fault::Rejected => TransportError::Remote(RemoteError::rejected("rejected execution")),
            Fault::Remote(kind) => TransportError::Remote(RemoteError::new(kind, "injected failure")),
            Fault::Timeout => TransportError::Timeout {
                action: action.to_string(),
                timeout: options.timeout,
            },
        }
    }
}

#[derive(Debug)]
struct FaultRule {
    action: String,
    target: Option<NodeId>,
    remaining: usize,
    fault: Fault,
}

/// Registry of in-process nodes
pub struct LocalHub {
    handlers: DashMap<NodeId, Arc<dyn RequestHandler>>,
    faults: Mutex<Vec<FaultRule>>,
    attempts: DashMap<String, u64>,
    request_ids: AtomicU64,
}

impl LocalHub {
    /// Create an empty hub
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: DashMap::new(),
            faults: Mutex::new(Vec::new()),
            attempts: DashMap::new(),
            request_ids: AtomicU64::new(0),
        })
    }

    /// Transport sending on behalf of `node`
    pub fn transport(self: &Arc<Self>, node: impl Into<NodeId>) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            node: node.into(),
            hub: Arc::clone(self),
        })
    }

    /// Route requests for `node` to `handler`
    pub fn register(&self, node: impl Into<NodeId>, handler: Arc<dyn RequestHandler>) {
        self.handlers.insert(node.into(), handler);
    }

    /// Drop a node; later requests to it fail with a connection error
    pub fn disconnect(&self, node: &str) -> bool {
        self.handlers.remove(node).is_some()
    }

    /// Fail the next `count` requests for `action` to any node
    pub fn fail_next(&self, action: &str, count: usize, fault: Fault) {
        self.push_fault(action, None, count, fault);
    }

    /// Fail the next `count` requests for `action` to `target`
    pub fn fail_next_to(&self, target: &str, action: &str, count: usize, fault: Fault) {
        self.push_fault(action, Some(target.to_string()), count, fault);
    }

    fn push_fault(&self, action: &str, target: Option<NodeId>, count: usize, fault: Fault) {
        self.faults.lock().push(FaultRule {
            action: action.to_string(),
            target,
            remaining: count,
            fault,
        });
    }

    /// Requests attempted for `action`, including failed ones
    pub fn attempts(&self, action: &str) -> u64 {
        self.attempts.get(action).map(|n| *n).unwrap_or(0)
    }

    /// Requests attempted for any action
    pub fn total_attempts(&self) -> u64 {
        self.attempts.iter().map(|entry| *entry.value()).sum()
    }

    fn take_fault(&self, target: &str, action: &str) -> Option<Fault> {
        let mut faults = self.faults.lock();
        let rule = faults.iter_mut().find(|rule| {
            rule.remaining > 0
                && rule.action == action
                && rule.target.as_deref().is_none_or(|t| t == target)
        })?;
        rule.remaining -= 1;
        let fault = rule.fault;
        faults.retain(|rule| rule.remaining > 0);
        Some(fault)
    }

    async fn dispatch(
        &self,
        from: &str,
        target: &str,
        action: &str,
        request: &ReplicationRequest,
        options: RequestOptions,
    ) -> Result<ReplicationResponse, TransportError> {
        *self.attempts.entry(action.to_string()).or_insert(0) += 1;

        if request.action() != action {
            return Err(TransportError::Send {
                action: action.to_string(),
                source: format!("request is a {} request", request.action()).into(),
            });
        }

        if let Some(fault) = self.take_fault(target, action) {
            tracing::trace!("Injecting {:?} into {} -> {} [{}]", fault, from, target, action);
            return Err(fault.into_error(target, action, options));
        }

        let handler = self
            .handlers
            .get(target)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| TransportError::NodeNotConnected(target.to_string()))?;

        let request_id = self.request_ids.fetch_add(1, Ordering::Relaxed);
        let wire = ReplicationMessage::Request {
            request_id,
            from: from.to_string(),
            request: request.clone(),
        }
        .encode()
        .map_err(|e| TransportError::Send {
            action: action.to_string(),
            source: Box::new(e),
        })?;

        let task = tokio::spawn(serve(handler, wire, request_id));

        let encoded = match tokio::time::timeout(options.timeout, task).await {
            Err(_) => {
                return Err(TransportError::Timeout {
                    action: action.to_string(),
                    timeout: options.timeout,
                });
            }
            Ok(Err(join_error)) => {
                return Err(TransportError::Remote(RemoteError::new(
                    RemoteErrorKind::Internal,
                    format!("handler panicked: {join_error}"),
                )));
            }
            Ok(Ok(encoded)) => encoded.map_err(|e| TransportError::InvalidResponse {
                action: action.to_string(),
                message: e.to_string(),
            })?,
        };

        match ReplicationMessage::decode(&encoded) {
            Ok(ReplicationMessage::Response { response, .. }) => Ok(response),
            Ok(ReplicationMessage::Error { error, .. }) => Err(TransportError::Remote(error)),
            Ok(other) => Err(TransportError::InvalidResponse {
                action: action.to_string(),
                message: format!("unexpected {:?}", other.message_type()),
            }),
            Err(e) => Err(TransportError::InvalidResponse {
                action: action.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

/// Remote half of a request: decode, handle, encode the reply
async fn serve(
    handler: Arc<dyn RequestHandler>,
    wire: Vec<u8>,
    request_id: u64,
) -> crate::Result<Vec<u8>> {
    let (from, request) = match ReplicationMessage::decode(&wire)? {
        ReplicationMessage::Request { from, request, .. } => (from, request),
        other => {
            return Err(crate::Error::codec(format!(
                "expected a request, got {:?}",
                other.message_type()
            )));
        }
    };
    let reply = match handler.handle(&from, request).await {
        Ok(response) => ReplicationMessage::Response {
            request_id,
            response,
        },
        Err(e) => ReplicationMessage::Error {
            request_id,
            error: e.to_remote(),
        },
    };
    reply.encode()
}

/// [`Transport`] of one node attached to a [`LocalHub`]
pub struct LocalTransport {
    node: NodeId,
    hub: Arc<LocalHub>,
}

impl LocalTransport {
    /// Hub this transport sends through
    pub fn hub(&self) -> &Arc<LocalHub> {
        &self.hub
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send_request(
        &self,
        target: &str,
        action: &str,
        request: &ReplicationRequest,
        options: RequestOptions,
    ) -> Result<ReplicationResponse, TransportError> {
        self.hub
            .dispatch(&self.node, target, action, request, options)
            .await
    }

    fn local_node(&self) -> &str {
        &self.node
    }
}
