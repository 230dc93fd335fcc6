//! Replication settings

use crate::retry::BackoffPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Default chunk size for file transfer (512 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// Default delay before the first retry
pub const DEFAULT_INITIAL_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Default cap on chunk bytes a node sends per second (40 MiB)
pub const DEFAULT_MAX_BYTES_PER_SEC: u64 = 40 * 1024 * 1024;

/// Prefix of environment variables read by [`ReplicationSettings::from_env`]
pub const ENV_PREFIX: &str = "SEGREP_";

/// Settings shared by the primary and replica sides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationSettings {
    /// Maximum bytes per file chunk
    pub chunk_size: usize,

    /// Delay before the first retry of a failed request
    #[serde(with = "serde_millis")]
    pub initial_retry_delay: Duration,

    /// How long a retryable request keeps retrying overall
    #[serde(with = "serde_millis")]
    pub retry_timeout: Duration,

    /// Timeout of one request attempt
    #[serde(with = "serde_millis")]
    pub request_timeout: Duration,

    /// Timeout of a whole file transfer request, which stays open while
    /// chunks are pushed
    #[serde(with = "serde_millis")]
    pub transfer_timeout: Duration,

    /// Timeout of a merged segment pre-copy, including its chunk retries
    #[serde(with = "serde_millis")]
    pub merged_segment_timeout: Duration,

    /// Chunk bytes a node may send per second; `None` disables throttling
    pub max_bytes_per_sec: Option<u64>,

    /// Growth of the retry delay
    pub backoff: BackoffPolicy,

    /// Jitter applied to retry delays, as a fraction of the delay (0.0 - 1.0)
    pub jitter_factor: f64,

    /// Idle time after which a source session is considered abandoned
    #[serde(with = "serde_millis")]
    pub session_lease: Duration,

    /// Overall timeout for publishing a checkpoint to one replica
    #[serde(with = "serde_millis")]
    pub publish_timeout: Duration,

    /// File transfers a primary node runs at once
    pub max_concurrent_transfers: usize,

    /// Pulls a replica node runs at once
    pub max_concurrent_replications: usize,

    /// Attempts at pinning the current checkpoint when it keeps moving
    pub stale_checkpoint_retries: u32,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            initial_retry_delay: DEFAULT_INITIAL_RETRY_DELAY,
            retry_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(15),
            transfer_timeout: Duration::from_secs(30 * 60),
            merged_segment_timeout: Duration::from_secs(15 * 60),
            max_bytes_per_sec: Some(DEFAULT_MAX_BYTES_PER_SEC),
            backoff: BackoffPolicy::default(),
            jitter_factor: 0.1,
            session_lease: Duration::from_secs(60),
            publish_timeout: Duration::from_secs(30),
            max_concurrent_transfers: 2,
            max_concurrent_replications: 2,
            stale_checkpoint_retries: 3,
        }
    }
}

impl ReplicationSettings {
    /// Load settings from `SEGREP_*` environment variables over the defaults
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings from an arbitrary key lookup over the defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("CHUNK_SIZE") {
            settings.chunk_size = parse("CHUNK_SIZE", &v)?;
        }
        if let Some(v) = get("RETRY_INITIAL_DELAY_MS") {
            settings.initial_retry_delay = Duration::from_millis(parse("RETRY_INITIAL_DELAY_MS", &v)?);
        }
        if let Some(v) = get("RETRY_TIMEOUT_MS") {
            settings.retry_timeout = Duration::from_millis(parse("RETRY_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("REQUEST_TIMEOUT_MS") {
            settings.request_timeout = Duration::from_millis(parse("REQUEST_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("TRANSFER_TIMEOUT_MS") {
            settings.transfer_timeout = Duration::from_millis(parse("TRANSFER_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("MERGED_SEGMENT_TIMEOUT_MS") {
            settings.merged_segment_timeout =
                Duration::from_millis(parse("MERGED_SEGMENT_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("MAX_BYTES_PER_SEC") {
            // 0 turns throttling off
            let limit: u64 = parse("MAX_BYTES_PER_SEC", &v)?;
            settings.max_bytes_per_sec = (limit > 0).then_some(limit);
        }
        if let Some(v) = get("JITTER_FACTOR") {
            settings.jitter_factor = parse("JITTER_FACTOR", &v)?;
        }
        if let Some(v) = get("SESSION_LEASE_MS") {
            settings.session_lease = Duration::from_millis(parse("SESSION_LEASE_MS", &v)?);
        }
        if let Some(v) = get("PUBLISH_TIMEOUT_MS") {
            settings.publish_timeout = Duration::from_millis(parse("PUBLISH_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("MAX_CONCURRENT_TRANSFERS") {
            settings.max_concurrent_transfers = parse("MAX_CONCURRENT_TRANSFERS", &v)?;
        }
        if let Some(v) = get("MAX_CONCURRENT_REPLICATIONS") {
            settings.max_concurrent_replications = parse("MAX_CONCURRENT_REPLICATIONS", &v)?;
        }
        if let Some(v) = get("STALE_CHECKPOINT_RETRIES") {
            settings.stale_checkpoint_retries = parse("STALE_CHECKPOINT_RETRIES", &v)?;
        }
        if let Some(v) = get("BACKOFF") {
            settings.backoff = match v.to_ascii_lowercase().as_str() {
                "fixed" => BackoffPolicy::Fixed,
                "exponential" => BackoffPolicy::default(),
                other => {
                    return Err(Error::config(format!(
                        "{ENV_PREFIX}BACKOFF must be 'fixed' or 'exponential', got '{other}'"
                    )));
                }
            };
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Set chunk size
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set retry timing
    pub fn with_retry(mut self, initial_delay: Duration, retry_timeout: Duration) -> Self {
        self.initial_retry_delay = initial_delay;
        self.retry_timeout = retry_timeout;
        self
    }

    /// Set the per-attempt request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the timeout of a whole file transfer
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    /// Set the chunk throughput cap, `None` for unlimited
    pub fn with_max_bytes_per_sec(mut self, limit: Option<u64>) -> Self {
        self.max_bytes_per_sec = limit;
        self
    }

    /// Set backoff policy
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set jitter factor
    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// Set session lease
    pub fn with_session_lease(mut self, lease: Duration) -> Self {
        self.session_lease = lease;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::config("chunk_size must be at least 1"));
        }
        if self.initial_retry_delay.is_zero() {
            return Err(Error::config("initial_retry_delay must be non-zero"));
        }
        if self.request_timeout.is_zero() || self.retry_timeout.is_zero() {
            return Err(Error::config("request and retry timeouts must be non-zero"));
        }
        if self.transfer_timeout.is_zero() || self.merged_segment_timeout.is_zero() {
            return Err(Error::config("transfer timeouts must be non-zero"));
        }
        if let Some(limit) = self.max_bytes_per_sec {
            if limit == 0 || limit > u64::from(u32::MAX) {
                return Err(Error::config(format!(
                    "max_bytes_per_sec must be within 1..={}",
                    u32::MAX
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(Error::config("jitter_factor must be within 0.0..=1.0"));
        }
        if self.max_concurrent_transfers == 0 || self.max_concurrent_replications == 0 {
            return Err(Error::config("concurrency limits must be at least 1"));
        }
        if self.stale_checkpoint_retries == 0 {
            return Err(Error::config("stale_checkpoint_retries must be at least 1"));
        }
        self.backoff.validate()
    }
}

fn parse<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::config(format!("invalid {ENV_PREFIX}{name} '{value}': {e}")))
}
