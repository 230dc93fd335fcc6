//! Table of active source sessions, one per primary shard and replica

use super::session::{SessionResources, SourceReplicationSession};
use crate::checkpoint::{AllocationId, ShardId};
use crate::copy_state::CopyStateRegistry;
use crate::protocol::{
    CancelReplicationRequest, CheckpointInfoRequest, GetSegmentFilesRequest, GetSegmentFilesResponse,
};
use crate::{Error, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

type SessionKey = (ShardId, AllocationId);

/// Active replication sessions of a primary node
pub struct OngoingReplications {
    copy_states: Arc<CopyStateRegistry>,
    resources: SessionResources,
    lease: Duration,
    stale_checkpoint_retries: u32,
    sessions: DashMap<SessionKey, Arc<SourceReplicationSession>>,
}

impl OngoingReplications {
    /// Create an empty session table
    pub fn new(
        copy_states: Arc<CopyStateRegistry>,
        resources: SessionResources,
        lease: Duration,
        stale_checkpoint_retries: u32,
    ) -> Self {
        Self {
            copy_states,
            resources,
            lease,
            stale_checkpoint_retries,
            sessions: DashMap::new(),
        }
    }

    /// Pinned checkpoints shared by the sessions
    pub fn copy_states(&self) -> &Arc<CopyStateRegistry> {
        &self.copy_states
    }

    /// Pin the current checkpoint of the requested shard and open a session
    /// for the replica.
    ///
    /// A second session for the same replica is refused while the first is
    /// alive; one whose lease expired is cancelled and replaced.
    pub fn prepare_for_replication(
        &self,
        request: &CheckpointInfoRequest,
    ) -> Result<Arc<SourceReplicationSession>> {
        let shard = &request.checkpoint.shard_id;
        let key = (shard.clone(), request.replica.clone());

        match self.sessions.entry(key) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get();
                if !existing.is_cancelled() && !existing.is_expired(Instant::now()) {
                    return Err(Error::ReplicationAlreadyInProgress {
                        shard: shard.to_string(),
                        replica: request.replica.clone(),
                    });
                }
                existing.cancel("replication lease expired");
                let session = self.open_session(request)?;
                occupied.insert(Arc::clone(&session));
                Ok(session)
            }
            Entry::Vacant(vacant) => {
                let session = self.open_session(request)?;
                vacant.insert(Arc::clone(&session));
                Ok(session)
            }
        }
    }

    fn open_session(&self, request: &CheckpointInfoRequest) -> Result<Arc<SourceReplicationSession>> {
        let copy_state = self
            .copy_states
            .acquire_current(&request.checkpoint.shard_id, self.stale_checkpoint_retries)?;
        let session = SourceReplicationSession::new(
            request.replication_id,
            request.replica.clone(),
            request.target_node.clone(),
            copy_state,
            self.lease,
            self.resources.clone(),
        );
        tracing::debug!(
            "Opened replication session {} serving {} to {} [{}]",
            session.id(),
            session.checkpoint(),
            request.replica,
            request.target_node
        );
        Ok(Arc::new(session))
    }

    /// Run the file transfer of an open session. The session is removed
    /// afterwards whatever the outcome.
    pub async fn start_segment_copy(
        &self,
        request: &GetSegmentFilesRequest,
    ) -> Result<GetSegmentFilesResponse> {
        let key = (request.checkpoint.shard_id.clone(), request.replica.clone());
        let session = self
            .get(&key.0, &key.1)
            .ok_or_else(|| {
                Error::protocol(format!(
                    "no replication session for {} [{}]",
                    key.0, request.replica
                ))
            })?;
        if session.replication_id() != request.replication_id {
            return Err(Error::protocol(format!(
                "replication id {} does not match session {}",
                request.replication_id,
                session.replication_id()
            )));
        }
        if session.checkpoint().key() != request.checkpoint.key() {
            return Err(Error::protocol(format!(
                "session serves {}, not {}",
                session.checkpoint(),
                request.checkpoint
            )));
        }

        let _guard = SessionGuard {
            sessions: &self.sessions,
            key,
            session: Arc::clone(&session),
        };
        let transferred_files = session.send_files(&request.requested_files).await?;
        Ok(GetSegmentFilesResponse { transferred_files })
    }

    fn cancel_where<F>(&self, reason: &str, predicate: F) -> usize
    where
        F: Fn(&SessionKey, &SourceReplicationSession) -> bool,
    {
        let mut cancelled = 0;
        self.sessions.retain(|key, session| {
            if predicate(key, session.as_ref()) {
                session.cancel(reason);
                cancelled += 1;
                false
            } else {
                true
            }
        });
        cancelled
    }

    /// Cancel every session of a primary shard
    pub fn cancel_for_shard(&self, shard: &ShardId, reason: &str) -> usize {
        self.cancel_where(reason, |key, _| &key.0 == shard)
    }

    /// Cancel every session pushing files to `node`
    pub fn cancel_for_node(&self, node: &str, reason: &str) -> usize {
        self.cancel_where(reason, |_, session| session.target_node() == node)
    }

    /// Cancel every session serving `allocation`
    pub fn cancel_for_allocation(&self, allocation: &str, reason: &str) -> usize {
        self.cancel_where(reason, |key, _| key.1 == allocation)
    }

    /// Cancel sessions of `shard` whose replica fell out of the in-sync set
    pub fn clear_out_of_sync(&self, shard: &ShardId, in_sync: &[AllocationId]) -> usize {
        self.cancel_where("replica is no longer in sync", |key, _| {
            &key.0 == shard && !in_sync.contains(&key.1)
        })
    }

    /// Cancel the session a replica abandoned. Returns whether one matched.
    ///
    /// Without a replication id any session of the replica for the shard
    /// matches; a replica only ever runs one pull per shard.
    pub fn cancel_replication(&self, request: &CancelReplicationRequest) -> bool {
        let key = (request.shard_id.clone(), request.replica.clone());
        let removed = self.sessions.remove_if(&key, |_, session| {
            request
                .replication_id
                .is_none_or(|id| session.replication_id() == id)
        });
        match removed {
            Some((_, session)) => {
                session.cancel(&request.reason);
                true
            }
            None => false,
        }
    }

    /// Number of open sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Session of a shard/replica pair
    pub fn get(&self, shard: &ShardId, allocation: &str) -> Option<Arc<SourceReplicationSession>> {
        self.sessions
            .get(&(shard.clone(), allocation.to_string()))
            .map(|session| Arc::clone(session.value()))
    }
}

/// Removes a session from the table once its transfer ends, including when
/// the transfer future is dropped.
struct SessionGuard<'a> {
    sessions: &'a DashMap<SessionKey, Arc<SourceReplicationSession>>,
    key: SessionKey,
    session: Arc<SourceReplicationSession>,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.sessions
            .remove_if(&self.key, |_, current| Arc::ptr_eq(current, &self.session));
        self.session.close();
    }
}
