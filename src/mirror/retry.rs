//! Replay fault retry budget

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Bounded number of recoveries within a sliding time window
#[derive(Debug, Clone)]
pub struct RetryBudget {
    limit: u32,
    window: Duration,
    failures: VecDeque<Instant>,
}

impl RetryBudget {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            failures: VecDeque::new(),
        }
    }

    /// Record a failure at `now`; returns true if another attempt is allowed
    pub fn record_failure(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.failures.front() {
            if now.duration_since(*oldest) > self.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.failures.push_back(now);
        self.failures.len() as u32 <= self.limit
    }

    /// Failures inside the current window
    pub fn failures(&self) -> usize {
        self.failures.len()
    }

    /// Forget every recorded failure
    pub fn reset(&mut self) {
        self.failures.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_exhausts_within_window() {
        let mut budget = RetryBudget::new(2, Duration::from_secs(60));
        let now = Instant::now();

        assert!(budget.record_failure(now));
        assert!(budget.record_failure(now + Duration::from_secs(1)));
        assert!(!budget.record_failure(now + Duration::from_secs(2)));

        budget.reset();
        assert_eq!(budget.failures(), 0);
        assert!(budget.record_failure(now + Duration::from_secs(3)));
    }

    #[test]
    fn test_old_failures_leave_the_window() {
        let mut budget = RetryBudget::new(1, Duration::from_secs(10));
        let now = Instant::now();

        assert!(budget.record_failure(now));
        assert!(!budget.record_failure(now + Duration::from_secs(5)));
        assert!(budget.record_failure(now + Duration::from_secs(30)));
    }

    #[test]
    fn test_zero_limit_never_retries() {
        let mut budget = RetryBudget::new(0, Duration::from_secs(10));
        assert!(!budget.record_failure(Instant::now()));
    }
}
