use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;

/// Bounded retry loop for lease creation.
///
/// Each attempt reports `Ok(true)` on success and `Ok(false)` when the lease
/// is held elsewhere. Errors abort the loop immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    interval: Duration,
}

impl RetryPolicy {
    /// Retry without pausing between attempts.
    pub fn immediate(attempts: u32) -> Self {
        Self::fixed(attempts, Duration::ZERO)
    }

    /// Sleep a fixed `interval` after every failed attempt except the last.
    pub fn fixed(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn run<F, Fut>(&self, mut attempt: F) -> Result<bool>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        for i in 0..self.attempts {
            if attempt(i).await? {
                return Ok(true);
            }
            let last = i + 1 == self.attempts;
            debug!(attempt = i + 1, of = self.attempts, "lease attempt failed");
            if !last && !self.interval.is_zero() {
                tokio::time::sleep(self.interval).await;
            }
        }
        Ok(false)
    }
}
