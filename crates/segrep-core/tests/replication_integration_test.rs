//! Segment Replication Integration Tests
//!
//! Drives primaries and replicas wired over the in-process transport:
//! - Full and incremental pulls
//! - Superseded pulls and ordering
//! - Retries, cancellation and cluster hooks
//! - Apply failures and pinning under compaction
//! - Merged-segment pre-copy and throttled transfers

use parking_lot::Mutex;
use segrep_core::checkpoint::ShardId;
use segrep_core::error::Error;
use segrep_core::protocol::{CheckpointInfoRequest, actions};
use segrep_core::replica::{FailureKind, ReplicationStage, ShardFailureListener};
use segrep_core::storage::{ReplicationMode, SegmentStore};
use segrep_core::testing::TestCluster;
use segrep_core::transport::Fault;
use segrep_core::ReplicationSettings;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const WAIT: Duration = Duration::from_secs(30);

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

fn shard() -> ShardId {
    ShardId::new("logs", 0)
}

fn cluster() -> TestCluster {
    init_tracing();
    let cluster = TestCluster::new(
        ReplicationSettings::default().with_jitter(0.0),
        &["primary", "replica"],
    );
    cluster.add_shard(&shard(), "primary", &[("replica", "r1")]);
    cluster
}

#[derive(Default)]
struct RecordingListener {
    failed: Mutex<Vec<ShardId>>,
}

impl ShardFailureListener for RecordingListener {
    fn on_shard_failed(&self, shard: &ShardId, _error: &Error) {
        self.failed.lock().push(shard.clone());
    }
}

/// Test a replica pulling a primary's checkpoint end to end
#[tokio::test]
async fn test_replica_catches_up_with_primary() {
    let cluster = cluster();
    cluster.commit("primary", &shard(), &[("_0.cfs", "alpha"), ("_0.si", "info")]);
    let checkpoint = cluster.publish("primary", &shard(), &["replica"]).await;

    assert!(
        cluster
            .wait_for_checkpoint("replica", &shard(), &checkpoint, WAIT)
            .await
    );

    let replica = cluster.node("replica");
    assert_eq!(
        replica.store.file_contents(&shard(), "_0.cfs").unwrap(),
        Bytes::from_static(b"alpha")
    );
    assert_eq!(
        replica.store.local_files(&shard()).unwrap(),
        cluster.node("primary").store.local_files(&shard()).unwrap()
    );

    let state = cluster.state("replica", &shard());
    assert_eq!(state.stage, ReplicationStage::Idle);
    assert_eq!(state.completed_pulls, 1);
    assert!(state.applied_at.is_some());
    assert!(state.last_failure.is_none());

    // the replica reports back and the primary releases everything
    let primary = cluster.node("primary");
    assert!(
        cluster
            .wait_until(WAIT, || {
                primary.node.replica_checkpoints(&shard()).get("r1") == Some(&checkpoint)
            })
            .await
    );
    assert_eq!(primary.store.pin_count(&shard()), 0);
    assert_eq!(primary.node.source().ongoing().session_count(), 0);
}

/// Test that later pulls only transfer files the replica lacks
#[tokio::test]
async fn test_incremental_pull_transfers_only_missing_files() {
    let cluster = cluster();
    let hub = cluster.hub().clone();

    cluster.commit("primary", &shard(), &[("_0.cfs", "alpha"), ("_1.cfs", "beta")]);
    let c1 = cluster.publish("primary", &shard(), &["replica"]).await;
    assert!(cluster.wait_for_checkpoint("replica", &shard(), &c1, WAIT).await);
    assert_eq!(hub.attempts(actions::FILE_CHUNK), 2);

    cluster.commit("primary", &shard(), &[("_2.cfs", "gamma")]);
    let c2 = cluster.publish("primary", &shard(), &["replica"]).await;
    assert!(cluster.wait_for_checkpoint("replica", &shard(), &c2, WAIT).await);
    assert_eq!(hub.attempts(actions::FILE_CHUNK), 3);

    cluster
        .node("primary")
        .store
        .merge(
            &shard(),
            &["_0.cfs", "_1.cfs"],
            ("_3.cfs".to_string(), Bytes::from_static(b"alphabeta")),
        )
        .unwrap();
    let c3 = cluster.publish("primary", &shard(), &["replica"]).await;
    assert!(cluster.wait_for_checkpoint("replica", &shard(), &c3, WAIT).await);
    assert_eq!(hub.attempts(actions::FILE_CHUNK), 4);

    let names: Vec<String> = cluster
        .node("replica")
        .store
        .local_files(&shard())
        .unwrap()
        .into_keys()
        .collect();
    assert_eq!(names, vec!["_2.cfs", "_3.cfs"]);
}

/// Test that an older checkpoint never replaces a newer one
#[tokio::test]
async fn test_replica_never_regresses() {
    let cluster = cluster();
    let c1 = cluster.commit("primary", &shard(), &[("_0.cfs", "alpha")]);
    cluster.commit("primary", &shard(), &[("_1.cfs", "beta")]);
    let c2 = cluster.publish("primary", &shard(), &["replica"]).await;
    assert!(cluster.wait_for_checkpoint("replica", &shard(), &c2, WAIT).await);

    let replica = cluster.node("replica");
    assert!(!replica.node.on_new_checkpoint(c1.clone(), "primary"));
    assert!(!replica.node.on_new_checkpoint(c2.clone(), "primary"));
    assert_eq!(cluster.state("replica", &shard()).last_applied, Some(c2));
}

/// Test that a newer checkpoint cancels a pull still in flight
#[tokio::test(start_paused = true)]
async fn test_newer_checkpoint_supersedes_inflight_pull() {
    let cluster = cluster();
    cluster
        .hub()
        .fail_next_to("replica", actions::FILE_CHUNK, 3, Fault::ConnectRefused);

    cluster.commit("primary", &shard(), &[("_0.cfs", "alpha")]);
    let c1 = cluster.publish("primary", &shard(), &["replica"]).await;
    assert!(
        cluster
            .wait_until(WAIT, || cluster.hub().attempts(actions::FILE_CHUNK) >= 1)
            .await
    );
    assert_eq!(
        cluster.state("replica", &shard()).in_progress.map(|p| p.checkpoint),
        Some(c1)
    );

    cluster.commit("primary", &shard(), &[("_1.cfs", "beta")]);
    let c2 = cluster.publish("primary", &shard(), &["replica"]).await;
    assert!(cluster.wait_for_checkpoint("replica", &shard(), &c2, WAIT).await);

    let state = cluster.state("replica", &shard());
    assert_eq!(state.last_applied, Some(c2));
    assert_eq!(state.completed_pulls, 1);

    let primary = cluster.node("primary");
    assert!(
        cluster
            .wait_until(WAIT, || primary.store.pin_count(&shard()) == 0)
            .await
    );
    assert_eq!(primary.node.source().ongoing().session_count(), 0);
}

/// Test that connectivity failures during transfer are retried transparently
#[tokio::test(start_paused = true)]
async fn test_transfer_retries_connect_failures() {
    let cluster = cluster();
    cluster
        .hub()
        .fail_next_to("replica", actions::FILE_CHUNK, 2, Fault::ConnectRefused);

    cluster.commit("primary", &shard(), &[("_0.cfs", "alpha")]);
    let checkpoint = cluster.publish("primary", &shard(), &["replica"]).await;
    assert!(
        cluster
            .wait_for_checkpoint("replica", &shard(), &checkpoint, WAIT)
            .await
    );
    assert_eq!(cluster.hub().attempts(actions::FILE_CHUNK), 3);
    assert!(cluster.state("replica", &shard()).last_failure.is_none());
}

/// Test that a pull whose requests never get through fails as transient
#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_pull_as_transient() {
    init_tracing();
    let settings = ReplicationSettings::default()
        .with_jitter(0.0)
        .with_retry(Duration::from_millis(200), Duration::from_secs(2));
    let cluster = TestCluster::new(settings, &["primary", "replica"]);
    cluster.add_shard(&shard(), "primary", &[("replica", "r1")]);
    cluster
        .hub()
        .fail_next_to("primary", actions::GET_CHECKPOINT_INFO, 1000, Fault::ConnectRefused);

    let before = cluster.state("replica", &shard()).last_applied;
    cluster.commit("primary", &shard(), &[("_0.cfs", "alpha")]);
    cluster.publish("primary", &shard(), &["replica"]).await;

    assert!(
        cluster
            .wait_until(WAIT, || cluster.state("replica", &shard()).last_failure.is_some())
            .await
    );
    let state = cluster.state("replica", &shard());
    assert_eq!(state.last_failure.map(|f| f.kind), Some(FailureKind::Transient));
    assert_eq!(state.last_applied, before);
    assert_eq!(state.stage, ReplicationStage::Idle);
    assert!(state.in_progress.is_none());
    assert_eq!(cluster.node("primary").store.pin_count(&shard()), 0);
}

/// Test that a failed apply is fatal and leaves the old checkpoint visible
#[tokio::test]
async fn test_apply_failure_keeps_last_applied() {
    let cluster = cluster();
    let listener = Arc::new(RecordingListener::default());
    cluster
        .node("replica")
        .node
        .set_failure_listener(listener.clone());

    cluster.commit("primary", &shard(), &[("_0.cfs", "alpha")]);
    let c1 = cluster.publish("primary", &shard(), &["replica"]).await;
    assert!(cluster.wait_for_checkpoint("replica", &shard(), &c1, WAIT).await);

    cluster.node("replica").store.fail_next_apply(1);
    cluster.commit("primary", &shard(), &[("_1.cfs", "beta")]);
    cluster.publish("primary", &shard(), &["replica"]).await;

    assert!(
        cluster
            .wait_until(WAIT, || !listener.failed.lock().is_empty())
            .await
    );
    let state = cluster.state("replica", &shard());
    assert_eq!(state.last_applied, Some(c1));
    assert_eq!(state.last_failure.map(|f| f.kind), Some(FailureKind::Fatal));
    assert_eq!(state.stage, ReplicationStage::Idle);
    assert_eq!(listener.failed.lock().as_slice(), &[shard()]);
    assert!(
        !cluster
            .node("replica")
            .store
            .contains_file(&shard(), "_1.cfs")
    );
}

/// Test that cancelling on the replica frees the primary's session and pin
#[tokio::test(start_paused = true)]
async fn test_cancel_replication_releases_primary_pin() {
    let cluster = cluster();
    cluster
        .hub()
        .fail_next_to("replica", actions::FILE_CHUNK, 1000, Fault::ConnectRefused);
    let primary = cluster.node("primary");

    cluster.commit("primary", &shard(), &[("_0.cfs", "alpha")]);
    cluster.publish("primary", &shard(), &["replica"]).await;
    assert!(
        cluster
            .wait_until(WAIT, || primary.store.pin_count(&shard()) == 1
                && cluster.hub().attempts(actions::FILE_CHUNK) >= 1)
            .await
    );

    assert!(cluster.node("replica").node.cancel_replication(&shard(), "test"));
    assert!(
        cluster
            .wait_until(WAIT, || primary.store.pin_count(&shard()) == 0
                && primary.node.source().ongoing().session_count() == 0)
            .await
    );
    let state = cluster.state("replica", &shard());
    assert_eq!(state.stage, ReplicationStage::Cancelled);
    assert!(state.last_failure.is_none());
}

/// Test that removing a node cancels the sessions feeding it
#[tokio::test(start_paused = true)]
async fn test_node_removal_cancels_sessions() {
    let cluster = cluster();
    cluster
        .hub()
        .fail_next_to("replica", actions::FILE_CHUNK, 1000, Fault::ConnectRefused);
    let primary = cluster.node("primary");

    cluster.commit("primary", &shard(), &[("_0.cfs", "alpha")]);
    cluster.publish("primary", &shard(), &["replica"]).await;
    assert!(
        cluster
            .wait_until(WAIT, || primary.node.source().ongoing().session_count() == 1)
            .await
    );

    primary.node.on_node_removed("replica");
    assert_eq!(primary.node.source().ongoing().session_count(), 0);
    assert_eq!(primary.store.pin_count(&shard()), 0);
}

/// Test that compaction keeps files pinned by a running session
#[tokio::test(start_paused = true)]
async fn test_compaction_never_deletes_pinned_files() {
    let cluster = cluster();
    cluster
        .hub()
        .fail_next_to("replica", actions::FILE_CHUNK, 1000, Fault::ConnectRefused);
    let primary = cluster.node("primary");

    cluster.commit("primary", &shard(), &[("_0.cfs", "alpha"), ("_1.cfs", "beta")]);
    cluster.publish("primary", &shard(), &["replica"]).await;
    assert!(
        cluster
            .wait_until(WAIT, || primary.store.pin_count(&shard()) == 1)
            .await
    );

    primary
        .store
        .merge(
            &shard(),
            &["_0.cfs", "_1.cfs"],
            ("_2.cfs".to_string(), Bytes::from_static(b"alphabeta")),
        )
        .unwrap();
    assert!(primary.store.compact(&shard()).unwrap().is_empty());
    assert!(primary.store.contains_file(&shard(), "_0.cfs"));

    primary.node.before_shard_closed(&shard());
    assert_eq!(primary.store.pin_count(&shard()), 0);
    assert_eq!(
        primary.store.compact(&shard()).unwrap(),
        vec!["_0.cfs", "_1.cfs"]
    );
}

/// Test that logical replicas trim their translog after applying
#[tokio::test]
async fn test_logical_replica_trims_translog() {
    init_tracing();
    let cluster = TestCluster::new(ReplicationSettings::default(), &["primary", "replica"]);
    cluster.add_shard_with_mode(&shard(), "primary", &[("replica", "r1")], ReplicationMode::Logical);

    cluster.commit("primary", &shard(), &[("_0.cfs", "alpha")]);
    let checkpoint = cluster.publish("primary", &shard(), &["replica"]).await;
    assert!(
        cluster
            .wait_for_checkpoint("replica", &shard(), &checkpoint, WAIT)
            .await
    );

    assert_eq!(
        cluster.node("replica").store.translog_trimmed_to(&shard()),
        Some(checkpoint.key())
    );
    assert_eq!(
        cluster.state("replica", &shard()).mode,
        ReplicationMode::Logical
    );
}

/// Test that a local file disagreeing with the primary fails the pull
#[tokio::test]
async fn test_conflicting_local_file_fails_pull() {
    let cluster = cluster();
    cluster
        .node("replica")
        .store
        .commit(&shard(), vec![("_0.cfs".to_string(), Bytes::from_static(b"stale"))], &[])
        .unwrap();

    let before = cluster.state("replica", &shard()).last_applied;
    cluster.commit("primary", &shard(), &[("_0.cfs", "alpha")]);
    cluster.publish("primary", &shard(), &["replica"]).await;

    assert!(
        cluster
            .wait_until(WAIT, || cluster.state("replica", &shard()).last_failure.is_some())
            .await
    );
    let state = cluster.state("replica", &shard());
    assert_eq!(state.last_failure.map(|f| f.kind), Some(FailureKind::Session));
    assert_eq!(state.last_applied, before);
    assert_eq!(cluster.hub().attempts(actions::FILE_CHUNK), 0);
    assert!(
        cluster
            .wait_until(WAIT, || cluster.node("primary").store.pin_count(&shard()) == 0)
            .await
    );
}

/// Test that a closed replica shard ignores new checkpoints
#[tokio::test]
async fn test_closed_replica_ignores_checkpoints() {
    let cluster = cluster();
    let replica = cluster.node("replica");
    replica.node.close_replica(&shard());

    let checkpoint = cluster.commit("primary", &shard(), &[("_0.cfs", "alpha")]);
    assert!(!replica.node.on_new_checkpoint(checkpoint, "primary"));
    assert!(replica.node.replication_state(&shard()).is_none());
}

/// Test publishing to several replicas at once
#[tokio::test]
async fn test_publish_to_multiple_replicas() {
    init_tracing();
    let cluster = TestCluster::new(ReplicationSettings::default(), &["primary", "a", "b"]);
    cluster.add_shard(&shard(), "primary", &[("a", "ra"), ("b", "rb")]);

    cluster.commit("primary", &shard(), &[("_0.cfs", "alpha")]);
    let replicas = vec!["a".to_string(), "b".to_string()];
    let outcome = cluster
        .node("primary")
        .node
        .on_checkpoint_committed(&shard(), &replicas)
        .await
        .unwrap();
    assert_eq!(outcome.acknowledged, vec!["a", "b"]);
    assert!(outcome.failed.is_empty());

    let checkpoint = cluster
        .node("primary")
        .store
        .current_checkpoint(&shard())
        .unwrap();
    for replica in ["a", "b"] {
        assert!(
            cluster
                .wait_for_checkpoint(replica, &shard(), &checkpoint, WAIT)
                .await
        );
    }
    let primary = cluster.node("primary");
    assert!(
        cluster
            .wait_until(WAIT, || primary.node.replica_checkpoints(&shard()).len() == 2)
            .await
    );
}

/// Test that the worker goes quiet once a checkpoint is applied
#[tokio::test(start_paused = true)]
async fn test_worker_idles_after_apply() {
    let cluster = cluster();
    cluster.commit("primary", &shard(), &[("_0.cfs", "alpha")]);
    let checkpoint = cluster.publish("primary", &shard(), &["replica"]).await;
    assert!(
        cluster
            .wait_for_checkpoint("replica", &shard(), &checkpoint, WAIT)
            .await
    );
    let primary = cluster.node("primary");
    assert!(
        cluster
            .wait_until(WAIT, || primary.node.replica_checkpoints(&shard()).contains_key("r1"))
            .await
    );
    let attempts = cluster.hub().total_attempts();

    // a spinning worker would keep the paused clock from ever advancing
    tokio::time::sleep(Duration::from_secs(3600)).await;

    let state = cluster.state("replica", &shard());
    assert_eq!(state.stage, ReplicationStage::Idle);
    assert_eq!(state.completed_pulls, 1);
    assert_eq!(cluster.hub().total_attempts(), attempts);
}

/// Test that a transfer may outlast the per-request timeout
#[tokio::test(start_paused = true)]
async fn test_slow_transfer_outlasts_request_timeout() {
    init_tracing();
    let settings = ReplicationSettings::default()
        .with_jitter(0.0)
        .with_request_timeout(Duration::from_secs(1))
        .with_retry(Duration::from_millis(500), Duration::from_secs(60));
    let cluster = TestCluster::new(settings, &["primary", "replica"]);
    cluster.add_shard(&shard(), "primary", &[("replica", "r1")]);
    cluster
        .hub()
        .fail_next_to("replica", actions::FILE_CHUNK, 3, Fault::ConnectRefused);

    cluster.commit("primary", &shard(), &[("_0.cfs", "alpha")]);
    let checkpoint = cluster.publish("primary", &shard(), &["replica"]).await;
    assert!(
        cluster
            .wait_for_checkpoint("replica", &shard(), &checkpoint, WAIT)
            .await
    );
    assert_eq!(cluster.hub().attempts(actions::FILE_CHUNK), 4);
    assert_eq!(cluster.hub().attempts(actions::GET_SEGMENT_FILES), 1);

    let stats = cluster.state("replica", &shard()).last_pull.unwrap();
    assert_eq!(stats.files, 1);
    assert_eq!(stats.bytes, 5);
    assert!(stats.duration >= Duration::from_millis(3500));
}

/// Test that a session the replica abandoned on the primary does not block
/// the next pull
#[tokio::test(start_paused = true)]
async fn test_abandoned_primary_session_is_replaced() {
    init_tracing();
    let settings = ReplicationSettings::default()
        .with_jitter(0.0)
        .with_session_lease(Duration::from_secs(3600));
    let cluster = TestCluster::new(settings, &["primary", "replica"]);
    cluster.add_shard(&shard(), "primary", &[("replica", "r1")]);
    let primary = cluster.node("primary");

    let stale = primary
        .node
        .source()
        .ongoing()
        .prepare_for_replication(&CheckpointInfoRequest {
            replication_id: 999,
            checkpoint: primary.store.current_checkpoint(&shard()).unwrap(),
            replica: "r1".into(),
            target_node: "replica".into(),
        })
        .unwrap();

    cluster.commit("primary", &shard(), &[("_0.cfs", "alpha")]);
    let checkpoint = cluster.publish("primary", &shard(), &["replica"]).await;
    assert!(
        cluster
            .wait_for_checkpoint("replica", &shard(), &checkpoint, WAIT)
            .await
    );
    assert!(stale.is_cancelled());
    assert_eq!(cluster.hub().attempts(actions::GET_CHECKPOINT_INFO), 2);
    assert!(
        cluster
            .wait_until(WAIT, || primary.node.source().ongoing().session_count() == 0
                && primary.store.pin_count(&shard()) == 0)
            .await
    );
}

/// Test that a merged segment copied ahead is not sent again by the pull
/// that commits the merge
#[tokio::test]
async fn test_merged_segment_precopy_skips_transfer() {
    let cluster = cluster();
    cluster.commit("primary", &shard(), &[("_0.cfs", "alpha"), ("_1.cfs", "beta")]);
    let c1 = cluster.publish("primary", &shard(), &["replica"]).await;
    assert!(cluster.wait_for_checkpoint("replica", &shard(), &c1, WAIT).await);

    let merged = cluster.stage_merge("primary", &shard(), "_2.cfs", "alphabeta");
    let outcome = cluster.publish_merged("primary", merged, &["replica"]).await;
    assert_eq!(outcome.acknowledged, vec!["replica"]);

    let replica = cluster.node("replica");
    assert!(replica.store.is_precopied(&shard(), "_2.cfs"));
    assert!(!replica.store.local_files(&shard()).unwrap().contains_key("_2.cfs"));
    assert!(cluster.hub().attempts(actions::MERGED_SEGMENT_FILE_CHUNK) >= 1);

    let chunks = cluster.hub().attempts(actions::FILE_CHUNK);
    let c2 = cluster.commit_merge("primary", &shard(), &["_0.cfs", "_1.cfs"], ("_2.cfs", "alphabeta"));
    cluster.publish("primary", &shard(), &["replica"]).await;
    assert!(cluster.wait_for_checkpoint("replica", &shard(), &c2, WAIT).await);

    assert_eq!(cluster.hub().attempts(actions::FILE_CHUNK), chunks);
    assert_eq!(
        replica.store.file_contents(&shard(), "_2.cfs").unwrap(),
        Bytes::from_static(b"alphabeta")
    );
    assert!(!replica.store.is_precopied(&shard(), "_2.cfs"));
    assert_eq!(cluster.state("replica", &shard()).last_pull.map(|p| p.files), Some(0));
}

/// Test that chunk sends respect the configured byte rate
#[tokio::test]
async fn test_transfer_is_throttled() {
    init_tracing();
    let settings = ReplicationSettings::default()
        .with_jitter(0.0)
        .with_chunk_size(500)
        .with_max_bytes_per_sec(Some(1000));
    let cluster = TestCluster::new(settings, &["primary", "replica"]);
    cluster.add_shard(&shard(), "primary", &[("replica", "r1")]);

    let contents = "x".repeat(2000);
    cluster.commit("primary", &shard(), &[("_0.cfs", contents.as_str())]);
    let started = std::time::Instant::now();
    let checkpoint = cluster.publish("primary", &shard(), &["replica"]).await;
    assert!(
        cluster
            .wait_for_checkpoint("replica", &shard(), &checkpoint, WAIT)
            .await
    );
    // one second of burst, then 1000 bytes at 1000 bytes/s
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert_eq!(cluster.hub().attempts(actions::FILE_CHUNK), 4);
}
