// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Bounded waits.
//!
//! Every wait in the runtime (handshake, join, mailbox) is a short sleep
//! loop against a deadline. State changes arrive on the interrupt thread, so
//! the waiting thread only has to re-check under the registry lock.

use std::ops::ControlFlow;
use std::time::{Duration, Instant};

/// How long a blocking call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Wait until the condition holds.
    #[default]
    Infinite,
    /// Check once and return.
    NoWait,
    /// Wait at most this long.
    After(Duration),
}

impl Timeout {
    /// Numeric form: `-1` waits forever, `-2` does not wait, anything else is
    /// milliseconds (negative values other than the two markers clamp to 0).
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            -1 => Timeout::Infinite,
            -2 => Timeout::NoWait,
            ms => Timeout::After(Duration::from_millis(ms.max(0) as u64)),
        }
    }

    fn deadline(self, started: Instant) -> Option<Instant> {
        match self {
            Timeout::Infinite => None,
            Timeout::NoWait => Some(started),
            // A budget past the end of the clock waits forever.
            Timeout::After(limit) => started.checked_add(limit),
        }
    }

    /// What is left of this budget when it started at `started`.
    pub fn remaining(self, started: Instant) -> Timeout {
        match self {
            Timeout::Infinite | Timeout::NoWait => self,
            Timeout::After(limit) => Timeout::After(limit.saturating_sub(started.elapsed())),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(limit: Duration) -> Self {
        Timeout::After(limit)
    }
}

/// Re-run `check` every `interval` until it breaks or `timeout` passes.
///
/// `check` always runs at least once. Returns `None` only after the full
/// budget has elapsed.
pub(crate) fn poll_until<T>(
    timeout: Timeout,
    interval: Duration,
    mut check: impl FnMut() -> ControlFlow<T>,
) -> Option<T> {
    let started = Instant::now();
    let deadline = timeout.deadline(started);
    loop {
        if let ControlFlow::Break(value) = check() {
            return Some(value);
        }
        let pause = match deadline {
            None => interval,
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return None;
                }
                interval.min(deadline - now)
            }
        };
        std::thread::sleep(pause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_markers() {
        assert_eq!(Timeout::from_millis(-1), Timeout::Infinite);
        assert_eq!(Timeout::from_millis(-2), Timeout::NoWait);
        assert_eq!(
            Timeout::from_millis(250),
            Timeout::After(Duration::from_millis(250))
        );
        assert_eq!(Timeout::from_millis(-9), Timeout::After(Duration::ZERO));
    }

    #[test]
    fn test_no_wait_checks_exactly_once() {
        let mut calls = 0;
        let out: Option<()> = poll_until(Timeout::NoWait, Duration::from_millis(1), || {
            calls += 1;
            ControlFlow::Continue(())
        });
        assert!(out.is_none());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_timeout_never_fires_early() {
        let limit = Duration::from_millis(30);
        let started = Instant::now();
        let out: Option<()> = poll_until(Timeout::After(limit), Duration::from_millis(2), || {
            ControlFlow::Continue(())
        });
        assert!(out.is_none());
        assert!(started.elapsed() >= limit);
    }

    #[test]
    fn test_break_value_is_returned() {
        let mut n = 0;
        let out = poll_until(Timeout::Infinite, Duration::from_micros(50), || {
            n += 1;
            if n == 5 {
                ControlFlow::Break(n * 10)
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(out, Some(50));
    }

    #[test]
    fn test_unbounded_duration_waits_forever() {
        let started = Instant::now();
        assert_eq!(Timeout::After(Duration::MAX).deadline(started), None);

        let mut n = 0;
        let out = poll_until(Timeout::After(Duration::MAX), Duration::from_micros(50), || {
            n += 1;
            if n == 3 {
                ControlFlow::Break("done")
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(out, Some("done"));
        assert!(matches!(
            Timeout::After(Duration::MAX).remaining(started),
            Timeout::After(_)
        ));
    }

    #[test]
    fn test_remaining_saturates() {
        let started = Instant::now() - Duration::from_millis(50);
        let left = Timeout::After(Duration::from_millis(10)).remaining(started);
        assert_eq!(left, Timeout::After(Duration::ZERO));
        assert_eq!(Timeout::Infinite.remaining(started), Timeout::Infinite);
    }
}
