//! Minimum-interval rate limiter shared by every outbound search/fetch.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Serializes callers so that two acquisitions are never closer than
/// `min_interval`. One instance is owned by the tool provider and shared by
/// `Arc`; tests build their own.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// A limiter that never waits.
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until the interval since the previous acquisition has elapsed.
    ///
    /// The lock is held across the sleep, so concurrent callers queue up.
    pub async fn acquire(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Forget the previous acquisition; the next call proceeds immediately.
    pub async fn reset(&self) {
        *self.last.lock().await = None;
    }
}
