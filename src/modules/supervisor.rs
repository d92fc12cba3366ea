//! Retry and deadline bookkeeping shared by the helper client and the
//! takeover coordinator.

use std::thread;
use std::time::{Duration, Instant};

use crate::modules::constants::{
    HELPER_RETRY_ATTEMPTS, HELPER_RETRY_INITIAL_DELAY, HELPER_RETRY_MAX_DELAY,
};

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Delay before the second attempt
    pub initial: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: HELPER_RETRY_ATTEMPTS,
            initial: HELPER_RETRY_INITIAL_DELAY,
            max: HELPER_RETRY_MAX_DELAY,
        }
    }
}

impl Backoff {
    pub fn new(attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            initial,
            max,
        }
    }

    /// Delays to wait between consecutive attempts: `attempts - 1` values,
    /// doubling from `initial` and capped at `max`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let max = self.max;
        let mut next = self.initial.min(max);
        (1..self.attempts).map(move |_| {
            let delay = next;
            next = next.saturating_mul(2).min(max);
            delay
        })
    }

    /// Runs `op` until it succeeds or attempts run out, sleeping between
    /// tries. Returns the last error on exhaustion.
    pub fn retry<T, E>(&self, mut op: impl FnMut(u32) -> Result<T, E>) -> Result<T, E> {
        let mut delays = self.delays();
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) => match delays.next() {
                    Some(delay) => {
                        thread::sleep(delay);
                        attempt += 1;
                    }
                    None => return Err(e),
                },
            }
        }
    }
}

/// About a century.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// An absolute point in time bounding a multi-step operation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    end: Instant,
}

impl Deadline {
    /// A deadline `limit` from now. Limits past what `Instant` can represent
    /// are clamped to a point that never arrives in practice.
    pub fn after(limit: Duration) -> Self {
        let now = Instant::now();
        let end = now
            .checked_add(limit)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        Self { end }
    }

    /// Time left, or `None` once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.end
            .checked_duration_since(Instant::now())
            .filter(|left| !left.is_zero())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_and_cap() {
        let backoff = Backoff::new(6, Duration::from_millis(100), Duration::from_millis(500));
        let delays: Vec<u128> = backoff.delays().map(|d| d.as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_default_policy() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delays().count() as u32, HELPER_RETRY_ATTEMPTS - 1);
        assert!(backoff.delays().all(|d| d <= HELPER_RETRY_MAX_DELAY));
    }

    #[test]
    fn test_retry_stops_on_success_and_exhaustion() {
        let backoff = Backoff::new(3, Duration::from_millis(1), Duration::from_millis(1));

        let mut calls = 0;
        let result: Result<u32, &str> = backoff.retry(|attempt| {
            calls += 1;
            if attempt == 2 {
                Ok(attempt)
            } else {
                Err("not yet")
            }
        });
        assert_eq!(result, Ok(2));
        assert_eq!(calls, 2);

        let mut calls = 0;
        let result: Result<(), &str> = backoff.retry(|_| {
            calls += 1;
            Err("down")
        });
        assert_eq!(result, Err("down"));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_deadline_expires() {
        let deadline = Deadline::after(Duration::from_millis(20));
        assert!(!deadline.expired());
        thread::sleep(Duration::from_millis(30));
        assert!(deadline.expired());
        assert_eq!(deadline.remaining(), None);
    }

    #[test]
    fn test_deadline_saturates_on_huge_limits() {
        let deadline = Deadline::after(Duration::MAX);
        assert!(!deadline.expired());
        assert!(deadline.remaining().is_some());

        let deadline = Deadline::after(Duration::from_secs(u64::MAX));
        assert!(!deadline.expired());
    }
}
