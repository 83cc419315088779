use std::time::Duration;

use crate::error::{LockError, Result};

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_ATTEMPTS: u32 = 3;
pub const DEFAULT_ATTEMPT_INTERVAL: Duration = Duration::from_millis(100);

/// Per-call options for [`LeaseKeeper::lock`](crate::LeaseKeeper::lock).
///
/// `attempt_interval` and `lock_space` only affect the advisory-lock
/// backend; the conditional-write backend retries immediately and has no
/// key namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// Upper bound on critical-section execution, and the expiry window of
    /// conditional-write leases.
    pub ttl: Duration,
    /// Maximum number of create attempts.
    pub attempts: u32,
    pub attempt_interval: Duration,
    pub lock_space: Option<i32>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            attempts: DEFAULT_ATTEMPTS,
            attempt_interval: DEFAULT_ATTEMPT_INTERVAL,
            lock_space: None,
        }
    }
}

impl LockOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_attempt_interval(mut self, interval: Duration) -> Self {
        self.attempt_interval = interval;
        self
    }

    pub fn with_lock_space(mut self, lock_space: i32) -> Self {
        self.lock_space = Some(lock_space);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.attempts == 0 {
            return Err(LockError::InvalidOptions(
                "attempts must be greater than 0".to_string(),
            ));
        }
        if self.ttl.is_zero() {
            return Err(LockError::InvalidOptions(
                "ttl must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let opts = LockOptions::default();
        assert_eq!(opts.ttl, Duration::from_secs(60));
        assert_eq!(opts.attempts, 3);
        assert_eq!(opts.attempt_interval, Duration::from_millis(100));
        assert_eq!(opts.lock_space, None);
    }

    #[test]
    fn validate_rejects_zero_attempts_and_zero_ttl() {
        assert!(LockOptions::new().with_attempts(0).validate().is_err());
        assert!(LockOptions::new().with_ttl(Duration::ZERO).validate().is_err());
        assert!(LockOptions::new().validate().is_ok());
    }
}
