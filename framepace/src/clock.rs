// SPDX-FileCopyrightText: 2025 Contributors to the framepace project.
// SPDX-License-Identifier: Apache-2.0

//! Reference clock contract and two implementations.
//!
//! The presenter never reads a global clock. A [`ReferenceClock`] is injected
//! at construction and provides:
//!
//! - absolute time in nanoseconds ([`ReferenceClock::now`]),
//! - a blocking wait that reports when it actually woke up
//!   ([`ReferenceClock::wait_until`]),
//! - the measured display refresh period, if the clock is synced to vsync,
//! - a sink for the fine rate adjustment computed by the timing loop.
//!
//! [`SystemClock`] sleeps on the OS monotonic clock. [`ManualClock`] is fully
//! deterministic: time only moves when told to, and waits snap to a
//! simulated vsync grid. It is what the tests and the example use.

use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Nanoseconds per second.
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Converts seconds to nanoseconds, saturating at the `u64` range.
pub fn secs_to_ns(secs: f64) -> u64 {
    if secs <= 0.0 {
        0
    } else {
        (secs * NANOS_PER_SEC as f64).min(u64::MAX as f64) as u64
    }
}

/// Converts nanoseconds to seconds.
pub fn ns_to_secs(ns: u64) -> f64 {
    ns as f64 / NANOS_PER_SEC as f64
}

/// Time source and fine-rate sink used by the presenter.
///
/// Implementations must be shareable between the producer and consumer
/// threads.
pub trait ReferenceClock: Send + Sync {
    /// Current absolute time in nanoseconds.
    fn now(&self) -> u64;

    /// Blocks until the clock reaches `target` and returns the wake time.
    ///
    /// Returns immediately with the current time if `target` already passed.
    fn wait_until(&self, target: u64) -> u64;

    /// Measured display refresh period.
    ///
    /// `None` when the clock is not locked to the display's vertical sync.
    /// The timing loop is bypassed in that case.
    fn refresh_period(&self) -> Option<Duration>;

    /// Returns `true` while playback runs at a non-unity speed.
    fn speed_adjusted(&self) -> bool {
        false
    }

    /// Receives the fine rate multiplier (close to `1.0`) computed by the
    /// timing loop.
    fn set_fine_adjust(&self, factor: f64);
}

/// Monotonic wall clock backed by [`Instant`].
///
/// The refresh period is supplied by the host (for instance from the display
/// mode). Fine adjustments are recorded but not applied, because the OS clock
/// cannot be slewed from user space.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
    refresh_period: Option<Duration>,
    speed_adjusted: AtomicBool,
    fine_adjust: AtomicU64,
}

impl SystemClock {
    /// Creates a clock reporting `refresh_period` as the display period.
    pub fn new(refresh_period: Option<Duration>) -> Self {
        Self {
            origin: Instant::now(),
            refresh_period,
            speed_adjusted: AtomicBool::new(false),
            fine_adjust: AtomicU64::new(1.0_f64.to_bits()),
        }
    }

    /// Marks playback as running at a non-unity speed.
    pub fn set_speed_adjusted(&self, adjusted: bool) {
        self.speed_adjusted.store(adjusted, Ordering::Release);
    }

    /// Last fine adjustment received.
    pub fn fine_adjust(&self) -> f64 {
        f64::from_bits(self.fine_adjust.load(Ordering::Acquire))
    }
}

impl ReferenceClock for SystemClock {
    fn now(&self) -> u64 {
        self.origin.elapsed().as_nanos().min(u64::MAX as u128) as u64
    }

    fn wait_until(&self, target: u64) -> u64 {
        let now = self.now();
        if target > now {
            std::thread::sleep(Duration::from_nanos(target - now));
        }
        self.now()
    }

    fn refresh_period(&self) -> Option<Duration> {
        self.refresh_period
    }

    fn speed_adjusted(&self) -> bool {
        self.speed_adjusted.load(Ordering::Acquire)
    }

    fn set_fine_adjust(&self, factor: f64) {
        self.fine_adjust.store(factor.to_bits(), Ordering::Release);
    }
}

#[derive(Debug)]
struct ManualState {
    now: u64,
    fine_adjust: Vec<f64>,
}

/// Deterministic clock for tests and simulation.
///
/// Time starts at zero and only moves through [`advance`](Self::advance),
/// [`set`](Self::set) or a wait. With a refresh period configured, waits
/// wake on the next vsync edge at or after the target. Edges sit at
/// `phase + k * period`, which models a display whose pulses are offset from
/// the stream's timestamps.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
    refresh_period: Option<Duration>,
    vsync_phase: u64,
    speed_adjusted: AtomicBool,
}

impl ManualClock {
    /// Creates a clock at time zero.
    ///
    /// # Arguments
    ///
    /// * `refresh_period` - Simulated display period, `None` for a free-running clock
    /// * `vsync_phase` - Offset of the first vsync edge from time zero
    pub fn new(refresh_period: Option<Duration>, vsync_phase: Duration) -> Self {
        let vsync_phase = match refresh_period {
            Some(period) if !period.is_zero() => {
                (vsync_phase.as_nanos() % period.as_nanos()) as u64
            }
            _ => 0,
        };
        Self {
            state: Mutex::new(ManualState {
                now: 0,
                fine_adjust: Vec::new(),
            }),
            refresh_period,
            vsync_phase,
            speed_adjusted: AtomicBool::new(false),
        }
    }

    /// Moves time forward.
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock();
        state.now = state.now.saturating_add(by.as_nanos() as u64);
    }

    /// Jumps to an absolute time. Time never moves backwards.
    pub fn set(&self, now: u64) {
        let mut state = self.state.lock();
        state.now = state.now.max(now);
    }

    /// Marks playback as running at a non-unity speed.
    pub fn set_speed_adjusted(&self, adjusted: bool) {
        self.speed_adjusted.store(adjusted, Ordering::Release);
    }

    /// Every fine adjustment received, oldest first.
    pub fn fine_adjust_history(&self) -> Vec<f64> {
        self.state.lock().fine_adjust.clone()
    }

    fn next_edge(&self, target: u64) -> u64 {
        let Some(period) = self.refresh_period.filter(|p| !p.is_zero()) else {
            return target;
        };
        let period = period.as_nanos() as u64;
        if target <= self.vsync_phase {
            return self.vsync_phase;
        }
        let since = target - self.vsync_phase;
        let k = since.div_ceil(period);
        self.vsync_phase + k * period
    }
}

impl ReferenceClock for ManualClock {
    fn now(&self) -> u64 {
        self.state.lock().now
    }

    fn wait_until(&self, target: u64) -> u64 {
        let mut state = self.state.lock();
        if target > state.now {
            state.now = self.next_edge(target);
        }
        state.now
    }

    fn refresh_period(&self) -> Option<Duration> {
        self.refresh_period
    }

    fn speed_adjusted(&self) -> bool {
        self.speed_adjusted.load(Ordering::Acquire)
    }

    fn set_fine_adjust(&self, factor: f64) {
        self.state.lock().fine_adjust.push(factor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions() {
        assert_eq!(secs_to_ns(1.5), 1_500_000_000);
        assert_eq!(secs_to_ns(-1.0), 0);
        assert!((ns_to_secs(250_000_000) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn manual_clock_snaps_to_vsync() {
        let clock = ManualClock::new(
            Some(Duration::from_millis(10)),
            Duration::from_millis(3),
        );
        assert_eq!(clock.wait_until(1_000_000), 3_000_000);
        assert_eq!(clock.wait_until(3_000_001), 13_000_000);
        // Past targets do not move time.
        assert_eq!(clock.wait_until(5_000_000), 13_000_000);
    }

    #[test]
    fn free_running_manual_clock_wakes_on_target() {
        let clock = ManualClock::new(None, Duration::ZERO);
        assert_eq!(clock.wait_until(42), 42);
        clock.advance(Duration::from_nanos(8));
        assert_eq!(clock.now(), 50);
        clock.set(10);
        assert_eq!(clock.now(), 50);
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new(None);
        let a = clock.now();
        let b = clock.wait_until(a + 1_000_000);
        assert!(b >= a + 1_000_000);
        clock.set_fine_adjust(0.999);
        assert_eq!(clock.fine_adjust(), 0.999);
    }
}
