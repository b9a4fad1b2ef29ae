//! Deadlines and the wake-up primitive behind `wait` / `wait_many`.
//!
//! Every state change in a core bumps a single epoch counter and wakes
//! all sleepers. A waiter snapshots the epoch, evaluates the signals it
//! cares about, and only sleeps if the epoch has not moved since the
//! snapshot, so no wake-up is lost between the check and the sleep.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// When a wait gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Wait until the condition is resolved one way or another.
    Infinite,
    /// Give up at this instant.
    At(Instant),
}

impl Deadline {
    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(at) => Self::At(at),
            None => Self::Infinite,
        }
    }

    /// A deadline that has already passed: evaluate once and return.
    pub fn immediate() -> Self {
        Self::At(Instant::now())
    }

    pub fn has_passed(&self, now: Instant) -> bool {
        match self {
            Self::Infinite => false,
            Self::At(at) => now >= *at,
        }
    }

    /// Time left before the deadline, `None` when infinite.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        match self {
            Self::Infinite => None,
            Self::At(at) => Some(at.saturating_duration_since(now)),
        }
    }
}

impl From<Duration> for Deadline {
    fn from(timeout: Duration) -> Self {
        Self::after(timeout)
    }
}

impl From<Instant> for Deadline {
    fn from(at: Instant) -> Self {
        Self::At(at)
    }
}

/// Core-wide change counter with a condition variable.
#[derive(Debug, Default)]
pub(crate) struct Notifier {
    epoch: Mutex<u64>,
    cond: Condvar,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn epoch(&self) -> u64 {
        *self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a state change and wake every sleeper.
    pub(crate) fn notify(&self) {
        let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        *epoch = epoch.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Sleep until the epoch moves past `seen` or `until` elapses.
    ///
    /// Returns the epoch observed on wake-up.
    pub(crate) fn wait_past(&self, seen: u64, until: Deadline) -> u64 {
        let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        while *epoch == seen {
            match until.remaining(Instant::now()) {
                None => {
                    epoch = self
                        .cond
                        .wait(epoch)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(left) if left.is_zero() => break,
                Some(left) => {
                    epoch = self
                        .cond
                        .wait_timeout(epoch, left)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        *epoch
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn immediate_deadline_has_passed() {
        let deadline = Deadline::immediate();
        assert!(deadline.has_passed(Instant::now()));
        assert!(!Deadline::Infinite.has_passed(Instant::now()));
        assert_eq!(Deadline::Infinite.remaining(Instant::now()), None);
    }

    #[test]
    fn huge_timeout_saturates_to_infinite() {
        assert_eq!(Deadline::after(Duration::MAX), Deadline::Infinite);
    }

    #[test]
    fn wait_past_times_out_without_a_notify() {
        let notifier = Notifier::new();
        let seen = notifier.epoch();
        let started = Instant::now();
        let epoch = notifier.wait_past(seen, Deadline::after(Duration::from_millis(20)));
        assert_eq!(epoch, seen);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn notify_wakes_an_infinite_sleeper() {
        let notifier = Arc::new(Notifier::new());
        let seen = notifier.epoch();

        let sleeper = {
            let notifier = Arc::clone(&notifier);
            thread::spawn(move || notifier.wait_past(seen, Deadline::Infinite))
        };
        thread::sleep(Duration::from_millis(10));
        notifier.notify();

        assert_eq!(sleeper.join().unwrap(), seen + 1);
    }

    #[test]
    fn notify_before_sleep_is_not_lost() {
        let notifier = Notifier::new();
        let seen = notifier.epoch();
        notifier.notify();
        assert_eq!(notifier.wait_past(seen, Deadline::Infinite), seen + 1);
    }
}
