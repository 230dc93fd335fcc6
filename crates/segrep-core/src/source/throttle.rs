//! Node-wide cap on chunk bytes sent per second

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

/// GCRA bucket over chunk bytes, shared by every transfer of a node
pub struct TransferThrottle {
    limiter: DefaultDirectRateLimiter,
    burst: NonZeroU32,
}

impl TransferThrottle {
    /// Allow `bytes_per_sec`, with a burst of one second's worth
    pub fn new(bytes_per_sec: NonZeroU32) -> Self {
        Self {
            limiter: RateLimiter::direct(Quota::per_second(bytes_per_sec)),
            burst: bytes_per_sec,
        }
    }

    /// Throttle for a configured limit; `None` when unlimited
    pub fn from_limit(limit: Option<u64>) -> Option<Arc<Self>> {
        limit
            .and_then(|limit| u32::try_from(limit).ok())
            .and_then(NonZeroU32::new)
            .map(|rate| Arc::new(Self::new(rate)))
    }

    /// Wait until `bytes` more may be sent
    pub async fn acquire(&self, bytes: usize) {
        let burst = self.burst.get() as usize;
        let mut remaining = bytes;
        while remaining > 0 {
            let step = remaining.min(burst);
            remaining -= step;
            let Some(cells) = u32::try_from(step).ok().and_then(NonZeroU32::new) else {
                continue;
            };
            if self.limiter.until_n_ready(cells).await.is_err() {
                tracing::warn!("Chunk of {} bytes exceeds throttle burst {}", step, burst);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn rate(bytes: u32) -> NonZeroU32 {
        NonZeroU32::new(bytes).unwrap()
    }

    #[tokio::test]
    async fn test_burst_passes_then_waits() {
        let throttle = TransferThrottle::new(rate(1000));
        let start = Instant::now();
        throttle.acquire(1000).await;
        assert!(start.elapsed() < Duration::from_millis(200));

        throttle.acquire(500).await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_acquire_larger_than_burst_is_split() {
        let throttle = TransferThrottle::new(rate(1000));
        let start = Instant::now();
        throttle.acquire(2500).await;
        assert!(start.elapsed() >= Duration::from_millis(1400));
    }

    #[test]
    fn test_from_limit() {
        assert!(TransferThrottle::from_limit(None).is_none());
        assert!(TransferThrottle::from_limit(Some(0)).is_none());
        assert!(TransferThrottle::from_limit(Some(4096)).is_some());
    }
}
