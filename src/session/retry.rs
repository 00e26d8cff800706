//! Retry policy for network-bound session calls

use crate::error::ApiError;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `delay`; `attempt` is the 1-based number of the next try
    Retry { attempt: u32, delay: Duration },
    /// Network failures used up every attempt
    Exhausted,
    /// Not a network failure
    NotRetryable,
}

/// Counts failed attempts of one call site
#[derive(Debug, Clone)]
pub struct RetryCounter {
    max_attempts: u32,
    delay: Duration,
    failures: u32,
}

impl RetryCounter {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            failures: 0,
        }
    }

    /// Record a failure. Exhausting or giving up resets the counter.
    pub fn on_failure(&mut self, error: &ApiError) -> RetryDecision {
        if !error.is_network() {
            self.reset();
            return RetryDecision::NotRetryable;
        }
        self.failures += 1;
        if self.failures < self.max_attempts {
            RetryDecision::Retry {
                attempt: self.failures + 1,
                delay: self.delay,
            }
        } else {
            self.reset();
            RetryDecision::Exhausted
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
