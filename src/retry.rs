//! Retry budget and backoff between attempts.
//!
//! Every job is enqueued with the same policy: three attempts in total and an
//! exponential backoff starting at five seconds. Producers can delay or
//! schedule a job, but they cannot change how it is retried.
//!
//! # Examples
//!
//! ```rust
//! use bellwork::retry::{Backoff, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::default();
//! assert_eq!(policy.attempts, 3);
//!
//! // 5s after the first failure, 10s after the second.
//! assert_eq!(policy.backoff.delay_for_attempt(1), Duration::from_secs(5));
//! assert_eq!(policy.backoff.delay_for_attempt(2), Duration::from_secs(10));
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Total attempts a job gets, the first run included.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Delay before the first retry; doubles for every following one.
pub const DEFAULT_BACKOFF_DELAY: Duration = Duration::from_millis(5000);

/// How long to wait before re-running a failed job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay after every failure.
    Fixed {
        #[serde(with = "millis")]
        delay: Duration,
    },

    /// `delay * 2^(attempt - 1)`: 5s, 10s, 20s... for the default base.
    Exponential {
        #[serde(with = "millis")]
        delay: Duration,
    },
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Backoff::Fixed { delay }
    }

    pub fn exponential(delay: Duration) -> Self {
        Backoff::Exponential { delay }
    }

    /// Delay to apply after `attempt` (1-based) has failed.
    ///
    /// ```rust
    /// use bellwork::retry::Backoff;
    /// use std::time::Duration;
    ///
    /// let backoff = Backoff::exponential(Duration::from_secs(1));
    /// assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(1));
    /// assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(4));
    /// ```
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = match self {
            Backoff::Fixed { delay } => *delay,
            Backoff::Exponential { delay } => {
                let exponent = attempt.saturating_sub(1).min(31);
                delay.saturating_mul(1u32 << exponent)
            }
        };

        // Never retry in a hot loop
        delay.max(Duration::from_millis(1))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::exponential(DEFAULT_BACKOFF_DELAY)
    }
}

/// Attempt budget plus backoff shape, stamped onto each job at enqueue time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Whether a job that has now failed `attempts_made` times gets another run.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            backoff: Backoff::default(),
        }
    }
}

/// Serialize durations as integer milliseconds so they survive a round trip
/// through a Redis hash untouched.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
