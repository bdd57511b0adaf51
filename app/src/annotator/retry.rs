// ==============================================================================
// annotator/retry.rs - Chunk Retry Policy
// ==============================================================================
// Description: Exponential backoff schedule for failed annotation attempts
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================

use std::time::Duration;

/// Retries after the first attempt, so a chunk gets at most `max_retries + 1` tries
pub const DEFAULT_MAX_RETRIES: u32 = 4;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Delay before retry `k` is `base * 2^(k-1)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration) -> Self {
        Self { max_retries, base }
    }

    /// Sleep after failed attempt number `failures` (1-based), or None once exhausted
    pub fn delay_after(&self, failures: u32) -> Option<Duration> {
        if failures == 0 || failures > self.max_retries {
            return None;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_after(2), Some(Duration::from_secs(10)));
        assert_eq!(policy.delay_after(3), Some(Duration::from_secs(20)));
        assert_eq!(policy.delay_after(4), Some(Duration::from_secs(40)));
        assert_eq!(policy.delay_after(5), None);
    }

    #[test]
    fn test_zero_retries_fails_immediately() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1));
        assert_eq!(policy.delay_after(1), None);
    }

    #[test]
    fn test_large_attempt_counts_saturate() {
        let policy = RetryPolicy::new(100, Duration::from_secs(1));
        assert!(policy.delay_after(40).is_some());
    }
}
