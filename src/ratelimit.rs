//! Process-wide outbound rate limiting (§5): a single token-bucket limiter
//! shared by every issue-tracker and project-tracker call so a burst of
//! parallel groups can't trip the host's own rate limiting.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorRateLimiter};

use crate::config::RateLimitConfig;

type Limiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Shared limiter handle. Cheap to clone — cloning shares the same bucket.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Limiter>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let per_second = config.requests_per_second.max(0.1).round() as u32;
        let burst = config.burst.max(1);
        let quota = Quota::per_second(NonZeroU32::new(per_second.max(1)).unwrap())
            .allow_burst(NonZeroU32::new(burst).unwrap());
        Self {
            inner: Arc::new(GovernorRateLimiter::direct(quota)),
        }
    }

    /// Blocks until a token is available, then consumes it. Call this
    /// immediately before every outbound GitHub/Asana request.
    pub async fn acquire(&self) {
        self.inner.until_ready().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn acquire_does_not_block_within_burst() {
        let limiter = RateLimiter::new(&RateLimitConfig { requests_per_second: 5.0, burst: 5 });
        let started = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(started.elapsed().as_millis() < 500);
    }

    #[tokio::test]
    async fn acquire_throttles_once_burst_is_exhausted() {
        let limiter = RateLimiter::new(&RateLimitConfig { requests_per_second: 10.0, burst: 1 });
        limiter.acquire().await;
        let started = Instant::now();
        limiter.acquire().await;
        assert!(started.elapsed().as_millis() >= 50);
    }
}
