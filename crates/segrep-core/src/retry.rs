//! Retry with backoff for node-to-node requests
//!
//! [`RetryState`] is a plain state machine (attempt count, next delay,
//! deadline) with no timers of its own; [`RetryableClient`] drives it with
//! `tokio::time`, racing every send and every delay against a cancellation
//! token.

use crate::checkpoint::NodeId;
use crate::config::ReplicationSettings;
use crate::error::is_retryable;
use crate::protocol::{ReplicationRequest, ReplicationResponse};
use crate::transport::{RequestOptions, Transport};
use crate::{Error, Result};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

/// How the delay between attempts grows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Always wait the initial delay
    Fixed,
    /// Multiply the delay after every failure, up to `max_delay`
    Exponential {
        /// Growth factor, at least 1.0
        multiplier: f64,
        /// Upper bound of a single delay
        #[serde(with = "serde_millis")]
        max_delay: Duration,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Exponential {
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay that follows `current`
    pub fn next_delay(&self, current: Duration) -> Duration {
        match self {
            Self::Fixed => current,
            Self::Exponential {
                multiplier,
                max_delay,
            } => current.mul_f64(*multiplier).min(*max_delay),
        }
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Fixed => Ok(()),
            Self::Exponential {
                multiplier,
                max_delay,
            } => {
                if !multiplier.is_finite() || *multiplier < 1.0 {
                    return Err(Error::config("backoff multiplier must be >= 1.0"));
                }
                if max_delay.is_zero() {
                    return Err(Error::config("backoff max_delay must be non-zero"));
                }
                Ok(())
            }
        }
    }
}

/// Retry bookkeeping for one request
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: BackoffPolicy,
    jitter_factor: f64,
    attempts: u32,
    next_delay: Duration,
    deadline: Instant,
}

impl RetryState {
    /// Start retrying at `now`, giving up `timeout` later
    pub fn new(
        policy: BackoffPolicy,
        initial_delay: Duration,
        jitter_factor: f64,
        timeout: Duration,
        now: Instant,
    ) -> Self {
        Self {
            policy,
            jitter_factor,
            attempts: 0,
            next_delay: initial_delay,
            deadline: now + timeout,
        }
    }

    /// Record that an attempt is about to be made
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Time left before the deadline
    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    /// After a retryable failure: the delay before the next attempt, or
    /// `None` when no attempt fits before the deadline.
    pub fn on_retryable_failure(&mut self, now: Instant) -> Option<Duration> {
        let remaining = self.remaining(now);
        let delay = jitter(self.next_delay, self.jitter_factor);
        if delay >= remaining {
            return None;
        }
        self.next_delay = self.policy.next_delay(self.next_delay);
        Some(delay)
    }
}

fn jitter(delay: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return delay;
    }
    let spread = rand::thread_rng().gen_range(-factor..=factor);
    delay.mul_f64((1.0 + spread).max(0.0))
}

/// Timing of a [`RetryableClient`]
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Overall time budget of one `execute`
    pub retry_timeout: Duration,
    /// Timeout of a single attempt
    pub request_timeout: Duration,
    /// Timeout of one attempt of a request that stays open for a whole file
    /// transfer
    pub transfer_timeout: Duration,
    /// Delay growth
    pub backoff: BackoffPolicy,
    /// Jitter fraction
    pub jitter_factor: f64,
}

impl From<&ReplicationSettings> for RetryConfig {
    fn from(settings: &ReplicationSettings) -> Self {
        Self {
            initial_delay: settings.initial_retry_delay,
            retry_timeout: settings.retry_timeout,
            request_timeout: settings.request_timeout,
            transfer_timeout: settings.transfer_timeout,
            backoff: settings.backoff.clone(),
            jitter_factor: settings.jitter_factor,
        }
    }
}

/// Sends requests to one target node, retrying connectivity failures
pub struct RetryableClient {
    transport: Arc<dyn Transport>,
    target: NodeId,
    config: RetryConfig,
    root: CancellationToken,
    cancel_reason: Mutex<Option<String>>,
    in_flight: AtomicUsize,
}

impl RetryableClient {
    /// Create a client for `target`
    pub fn new(transport: Arc<dyn Transport>, target: impl Into<NodeId>, config: RetryConfig) -> Self {
        Self {
            transport,
            target: target.into(),
            config,
            root: CancellationToken::new(),
            cancel_reason: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Cancel this client's actions whenever `parent` is cancelled
    pub fn with_parent(mut self, parent: &CancellationToken) -> Self {
        self.root = parent.child_token();
        self
    }

    /// Override the overall retry budget
    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.config.retry_timeout = timeout;
        self
    }

    /// Target node
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Actions currently executing
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Whether the client was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Cancel every in-flight action and close the client.
    ///
    /// Actions registered afterwards fail immediately with
    /// [`Error::Cancelled`].
    pub fn cancel_all(&self, reason: &str) {
        {
            let mut current = self.cancel_reason.lock();
            if current.is_none() {
                *current = Some(reason.to_string());
            }
        }
        tracing::debug!("Cancelling requests to {}: {}", self.target, reason);
        self.root.cancel();
    }

    fn cancelled_error(&self) -> Error {
        let reason = self
            .cancel_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "parent cancelled".to_string());
        Error::cancelled(reason)
    }

    /// Send `request` under `action`, retrying retryable failures until the
    /// retry timeout elapses, and convert the response to `R`.
    pub async fn execute<R>(&self, action: &'static str, request: ReplicationRequest) -> Result<R>
    where
        R: TryFrom<ReplicationResponse, Error = Error>,
    {
        self.execute_with_timeout(action, request, self.config.request_timeout)
            .await
    }

    /// [`RetryableClient::execute`] with a per-attempt timeout of
    /// `attempt_timeout`. The retry budget is stretched to at least one full
    /// attempt, so long-running requests are not cut short by it.
    pub async fn execute_with_timeout<R>(
        &self,
        action: &'static str,
        request: ReplicationRequest,
        attempt_timeout: Duration,
    ) -> Result<R>
    where
        R: TryFrom<ReplicationResponse, Error = Error>,
    {
        let token = self.root.child_token();
        if token.is_cancelled() {
            return Err(self.cancelled_error());
        }

        let _in_flight = InFlight::enter(&self.in_flight);
        let budget = self.config.retry_timeout.max(attempt_timeout);
        self.run(action, &request, &token, attempt_timeout, budget)
            .await
            .and_then(R::try_from)
    }

    async fn run(
        &self,
        action: &'static str,
        request: &ReplicationRequest,
        token: &CancellationToken,
        attempt_timeout: Duration,
        budget: Duration,
    ) -> Result<ReplicationResponse> {
        let mut state = RetryState::new(
            self.config.backoff.clone(),
            self.config.initial_delay,
            self.config.jitter_factor,
            budget,
            Instant::now(),
        );

        loop {
            let attempt = state.begin_attempt();
            let timeout = attempt_timeout
                .min(state.remaining(Instant::now()))
                .max(Duration::from_millis(1));

            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(self.cancelled_error()),
                outcome = self.transport.send_request(
                    &self.target,
                    action,
                    request,
                    RequestOptions::with_timeout(timeout),
                ) => outcome,
            };

            let error = match outcome {
                Ok(response) => {
                    if attempt > 1 {
                        tracing::debug!(
                            "{} to {} succeeded after {} attempts",
                            action,
                            self.target,
                            attempt
                        );
                    }
                    return Ok(response);
                }
                Err(e) => Error::from(e),
            };

            if !is_retryable(&error) {
                return Err(error);
            }

            let Some(delay) = state.on_retryable_failure(Instant::now()) else {
                tracing::warn!(
                    "Giving up on {} to {} after {} attempts: {}",
                    action,
                    self.target,
                    attempt,
                    error
                );
                return Err(Error::RetriesExhausted {
                    action: action.to_string(),
                    attempts: attempt,
                    source: Box::new(error),
                });
            };

            tracing::debug!(
                "Retrying {} to {} in {:?} (attempt {}): {}",
                action,
                self.target,
                delay,
                attempt,
                error
            );

            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(self.cancelled_error()),
                _ = sleep(delay) => {}
            }
        }
    }
}

/// Counts an executing action until dropped, including when the `execute`
/// future is dropped mid-flight
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Checkpoint, ShardId};
    use crate::error::TransportError;
    use crate::protocol::{Ack, PublishCheckpointRequest, actions};
    use crate::transport::{Fault, LocalHub, RequestHandler};
    use async_trait::async_trait;
    use proptest::prelude::*;

    struct AckAll;

    #[async_trait]
    impl RequestHandler for AckAll {
        async fn handle(&self, _from: &str, _request: ReplicationRequest) -> Result<ReplicationResponse> {
            Ok(ReplicationResponse::Ack)
        }
    }

    struct Hang;

    #[async_trait]
    impl RequestHandler for Hang {
        async fn handle(&self, _from: &str, _request: ReplicationRequest) -> Result<ReplicationResponse> {
            std::future::pending::<()>().await;
            Ok(ReplicationResponse::Ack)
        }
    }

    struct Slow(Duration);

    #[async_trait]
    impl RequestHandler for Slow {
        async fn handle(&self, _from: &str, _request: ReplicationRequest) -> Result<ReplicationResponse> {
            sleep(self.0).await;
            Ok(ReplicationResponse::Ack)
        }
    }

    fn request() -> ReplicationRequest {
        ReplicationRequest::PublishCheckpoint(PublishCheckpointRequest {
            checkpoint: Checkpoint::empty(ShardId::new("logs", 0), 1, "c"),
            primary_node: "primary".into(),
        })
    }

    fn config() -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(200),
            retry_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(1),
            transfer_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            jitter_factor: 0.0,
        }
    }

    fn client(hub: &Arc<LocalHub>) -> RetryableClient {
        RetryableClient::new(hub.transport("primary"), "replica", config())
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = BackoffPolicy::Exponential {
            multiplier: 2.0,
            max_delay: Duration::from_millis(500),
        };
        let d1 = policy.next_delay(Duration::from_millis(200));
        let d2 = policy.next_delay(d1);
        assert_eq!(d1, Duration::from_millis(400));
        assert_eq!(d2, Duration::from_millis(500));
        assert_eq!(
            BackoffPolicy::Fixed.next_delay(Duration::from_millis(200)),
            Duration::from_millis(200)
        );
    }

    #[test]
    fn test_retry_state_stops_at_deadline() {
        let now = Instant::now();
        let mut state = RetryState::new(
            BackoffPolicy::default(),
            Duration::from_millis(200),
            0.0,
            Duration::from_millis(500),
            now,
        );
        state.begin_attempt();
        assert_eq!(state.on_retryable_failure(now), Some(Duration::from_millis(200)));
        state.begin_attempt();
        // next delay is 400ms but only 300ms are left
        assert_eq!(
            state.on_retryable_failure(now + Duration::from_millis(200)),
            None
        );
        assert_eq!(state.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_connect_failures_then_success() {
        let hub = LocalHub::new();
        hub.register("replica", Arc::new(AckAll));
        hub.fail_next(actions::PUBLISH_CHECKPOINT, 2, Fault::ConnectRefused);

        let result: Result<Ack> = client(&hub)
            .execute(actions::PUBLISH_CHECKPOINT, request())
            .await;
        assert!(result.is_ok());
        assert_eq!(hub.attempts(actions::PUBLISH_CHECKPOINT), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_and_rejection_are_retried() {
        let hub = LocalHub::new();
        hub.register("replica", Arc::new(AckAll));
        hub.fail_next(actions::PUBLISH_CHECKPOINT, 1, Fault::SendFailure);
        hub.fail_next(actions::PUBLISH_CHECKPOINT, 1, Fault::Rejected);

        let result: Result<Ack> = client(&hub)
            .execute(actions::PUBLISH_CHECKPOINT, request())
            .await;
        assert!(result.is_ok());
        assert_eq!(hub.attempts(actions::PUBLISH_CHECKPOINT), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_propagates_immediately() {
        let hub = LocalHub::new();
        hub.register("replica", Arc::new(AckAll));
        hub.fail_next(
            actions::PUBLISH_CHECKPOINT,
            1,
            Fault::Remote(crate::error::RemoteErrorKind::Protocol),
        );

        let err = client(&hub)
            .execute::<Ack>(actions::PUBLISH_CHECKPOINT, request())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(hub.attempts(actions::PUBLISH_CHECKPOINT), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_surfaces_last_failure() {
        let hub = LocalHub::new();
        let started = Instant::now();

        let err = client(&hub)
            .execute::<Ack>(actions::PUBLISH_CHECKPOINT, request())
            .await
            .unwrap_err();
        match err {
            Error::RetriesExhausted { attempts, source, .. } => {
                assert!(attempts > 1);
                assert!(matches!(*source, Error::Transport(_)));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(started.elapsed() <= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_aborts_in_flight_and_closes() {
        let hub = LocalHub::new();
        hub.register("replica", Arc::new(Hang));
        let client = Arc::new(client(&hub).with_retry_timeout(Duration::from_secs(3600)));

        let running = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .execute::<Ack>(actions::PUBLISH_CHECKPOINT, request())
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(client.in_flight(), 1);

        client.cancel_all("shard closed");
        let err = running.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(client.in_flight(), 0);

        let late = client
            .execute::<Ack>(actions::PUBLISH_CHECKPOINT, request())
            .await
            .unwrap_err();
        assert!(matches!(late, Error::Cancelled { ref reason } if reason == "shard closed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_execute_leaves_nothing_in_flight() {
        let hub = LocalHub::new();
        hub.register("replica", Arc::new(Hang));
        let client = client(&hub);

        let dropped = tokio::time::timeout(
            Duration::from_millis(100),
            client.execute::<Ack>(actions::PUBLISH_CHECKPOINT, request()),
        )
        .await;
        assert!(dropped.is_err());
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_outlasts_request_timeout() {
        let hub = LocalHub::new();
        hub.register("replica", Arc::new(Slow(Duration::from_secs(8))));
        let client = client(&hub);

        let err = client
            .execute::<Ack>(actions::PUBLISH_CHECKPOINT, request())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::Timeout { .. })));

        let long: Result<Ack> = client
            .execute_with_timeout(actions::PUBLISH_CHECKPOINT, request(), config().transfer_timeout)
            .await;
        assert!(long.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_token_cancels_client() {
        let hub = LocalHub::new();
        let parent = CancellationToken::new();
        let client = client(&hub).with_parent(&parent);
        parent.cancel();

        let err = client
            .execute::<Ack>(actions::PUBLISH_CHECKPOINT, request())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(hub.total_attempts(), 0);
    }

    proptest! {
        #[test]
        fn prop_delays_fit_within_timeout(
            initial_ms in 1u64..500,
            timeout_ms in 1u64..20_000,
            multiplier in 1.0f64..4.0,
            jitter_factor in 0.0f64..0.5,
        ) {
            let start = Instant::now();
            let timeout = Duration::from_millis(timeout_ms);
            let mut state = RetryState::new(
                BackoffPolicy::Exponential { multiplier, max_delay: Duration::from_secs(2) },
                Duration::from_millis(initial_ms),
                jitter_factor,
                timeout,
                start,
            );
            let mut now = start;
            while let Some(delay) = state.on_retryable_failure(now) {
                now += delay;
                prop_assert!(now - start < timeout);
                state.begin_attempt();
            }
        }
    }
}
