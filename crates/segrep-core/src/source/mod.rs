//! Primary side of segment replication
//!
//! A replica pull opens a [`SourceReplicationSession`] through the
//! [`OngoingReplications`] table; the session pins the primary's current
//! checkpoint and pushes the files the replica asks for.

pub mod ongoing;
pub mod service;
pub mod session;
pub mod throttle;
mod transfer;

pub use ongoing::OngoingReplications;
pub use service::SourceService;
pub use session::{SessionResources, SourceReplicationSession};
pub use throttle::TransferThrottle;
