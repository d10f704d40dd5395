//! Retry schedules for the two local-recovery points.
//!
//! Exactly two places in the system retry on failure: the command
//! processor (slow schedule, seconds) and the concurrent event dispatcher
//! (fast schedule, tens of milliseconds). Both use a linear backoff: the
//! sleep before attempt N is N times the backoff unit.

use std::time::Duration;

/// Configuration for bounded-retry invocation.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Backoff unit; the sleep before attempt N is `N × backoff_unit`.
    pub backoff_unit: Duration,
}

impl RetryConfig {
    /// The command processor's schedule: 3 attempts, sleeping N seconds
    /// before attempt N.
    pub const fn command_processing() -> Self {
        Self {
            max_attempts: 3,
            backoff_unit: Duration::from_millis(1000),
        }
    }

    /// The concurrent event dispatcher's schedule: 3 attempts, sleeping
    /// N × 50 ms before attempt N.
    pub const fn event_dispatch() -> Self {
        Self {
            max_attempts: 3,
            backoff_unit: Duration::from_millis(50),
        }
    }

    /// The sleep to take before the given attempt (1-based). The first
    /// attempt runs immediately.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            Duration::ZERO
        } else {
            self.backoff_unit * attempt
        }
    }
}
