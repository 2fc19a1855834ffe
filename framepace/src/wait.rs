// SPDX-FileCopyrightText: 2025 Contributors to the framepace project.
// SPDX-License-Identifier: Apache-2.0

//! Deadline-bounded waiting.
//!
//! Configuration acks, buffer availability, flush acks and capture results
//! all block with a timeout. They share two small types:
//!
//! - [`Deadline`] turns a caller timeout into an absolute instant and hands
//!   out the remaining budget for each condvar wait.
//! - [`Completion`] is a resettable one-shot signal, a promise without a
//!   value, that any number of threads can wait on with a timeout.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Shortest single condvar wait, so a zero poll interval cannot spin.
pub const MIN_POLL: Duration = Duration::from_millis(1);

/// An absolute point in time derived from a relative timeout.
///
/// A timeout too large to represent as an [`Instant`] (such as
/// [`Duration::MAX`]) never expires.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// Creates a deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(timeout),
        }
    }

    /// Time left before the deadline, zero once it has passed.
    ///
    /// [`Duration::MAX`] for a deadline that never expires.
    pub fn remaining(&self) -> Duration {
        match self.at {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    /// Waits on `condvar` until `done` returns `true` or the deadline passes.
    ///
    /// Each individual wait is capped at `poll` so callers can observe
    /// external conditions (stop flags) that are not signalled through the
    /// condvar. Returns the final value of `done`.
    pub fn wait_until<T, F>(
        &self,
        condvar: &Condvar,
        guard: &mut MutexGuard<'_, T>,
        poll: Duration,
        mut done: F,
    ) -> bool
    where
        F: FnMut(&mut T) -> bool,
    {
        loop {
            if done(&mut **guard) {
                return true;
            }
            let remaining = self.remaining();
            if remaining.is_zero() {
                return false;
            }
            condvar.wait_for(guard, remaining.min(poll.max(MIN_POLL)));
        }
    }
}

/// A resettable completion signal.
///
/// [`set`](Self::set) wakes every waiter. The signal stays set until
/// [`reset`](Self::reset), so a waiter that arrives late returns immediately.
#[derive(Debug, Default)]
pub struct Completion {
    signalled: Mutex<bool>,
    condvar: Condvar,
}

impl Completion {
    /// Creates an unsignalled completion.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals the completion and wakes all waiters.
    pub fn set(&self) {
        *self.signalled.lock() = true;
        self.condvar.notify_all();
    }

    /// Clears the signal.
    pub fn reset(&self) {
        *self.signalled.lock() = false;
    }

    /// Returns `true` if the completion is currently signalled.
    pub fn is_set(&self) -> bool {
        *self.signalled.lock()
    }

    /// Blocks until signalled or `timeout` elapses.
    ///
    /// Returns `true` if the completion was signalled.
    ///
    /// # Examples
    ///
    /// ```
    /// use framepace::wait::Completion;
    /// use std::{sync::Arc, thread, time::Duration};
    ///
    /// let done = Arc::new(Completion::new());
    /// let signaller = done.clone();
    /// thread::spawn(move || signaller.set());
    /// assert!(done.wait_for(Duration::from_secs(5)));
    /// ```
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Deadline::after(timeout);
        let mut signalled = self.signalled.lock();
        deadline.wait_until(&self.condvar, &mut signalled, timeout, |s| *s)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn unsignalled_completion_times_out() {
        let completion = Completion::new();
        let start = Instant::now();
        assert!(!completion.wait_for(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn set_before_wait_returns_immediately() {
        let completion = Completion::new();
        completion.set();
        assert!(completion.wait_for(Duration::ZERO));
        completion.reset();
        assert!(!completion.is_set());
    }

    #[test]
    fn set_from_other_thread_wakes_waiter() {
        let completion = Arc::new(Completion::new());
        let signaller = completion.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signaller.set();
        });
        assert!(completion.wait_for(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn unrepresentable_timeout_never_expires() {
        let deadline = Deadline::after(Duration::MAX);
        assert_eq!(deadline.remaining(), Duration::MAX);

        let lock = Mutex::new(false);
        let condvar = Condvar::new();
        let mut guard = lock.lock();
        let mut polls = 0;
        let done = deadline.wait_until(&condvar, &mut guard, Duration::from_millis(1), |_| {
            polls += 1;
            polls == 3
        });
        assert!(done);
    }

    #[test]
    fn completion_waits_forever_until_set() {
        let completion = Arc::new(Completion::new());
        let signaller = completion.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signaller.set();
        });
        assert!(completion.wait_for(Duration::MAX));
        handle.join().unwrap();
    }

    #[test]
    fn zero_poll_interval_still_sleeps() {
        let lock = Mutex::new(());
        let condvar = Condvar::new();
        let deadline = Deadline::after(Duration::from_millis(20));
        let mut guard = lock.lock();
        let mut polls = 0;
        assert!(!deadline.wait_until(&condvar, &mut guard, Duration::ZERO, |_| {
            polls += 1;
            false
        }));
        // Each wait lasts at least a millisecond, so a 20 ms budget cannot
        // produce more than about 21 predicate calls.
        assert!(polls <= 25, "{polls} polls");
    }

    #[test]
    fn deadline_wait_observes_predicate() {
        let lock = Mutex::new(3_u32);
        let condvar = Condvar::new();
        let deadline = Deadline::after(Duration::from_secs(1));
        let mut guard = lock.lock();
        // Predicate mutates state and succeeds after a few polls.
        let done = deadline.wait_until(&condvar, &mut guard, Duration::from_millis(1), |n| {
            *n = n.saturating_sub(1);
            *n == 0
        });
        assert!(done);
        assert_eq!(*guard, 0);
    }
}
