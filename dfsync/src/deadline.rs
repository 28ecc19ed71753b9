//! Caller-supplied call deadlines.

use std::time::Duration;
use tokio::time::Instant;

use crate::error::{DfsError, DfsResult};

/// Absolute expiry of one call, fixed when the call header arrives.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            expires_at: Instant::now() + timeout,
        }
    }

    /// Deadline from the wire field. Zero means "already expired".
    pub fn from_millis(ms: u64) -> Self {
        Self::after(Duration::from_millis(ms))
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// `Err(DeadlineExceeded)` once the deadline has passed.
    pub fn check(&self) -> DfsResult<()> {
        if self.is_expired() {
            Err(DfsError::DeadlineExceeded)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_deadline_is_expired() {
        let deadline = Deadline::from_millis(0);
        assert!(deadline.is_expired());
        assert!(matches!(deadline.check(), Err(DfsError::DeadlineExceeded)));
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let deadline = Deadline::from_millis(20);
        assert!(deadline.check().is_ok());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(deadline.check().is_err());
    }
}
