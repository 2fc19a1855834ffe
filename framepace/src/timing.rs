// SPDX-FileCopyrightText: 2025 Contributors to the framepace project.
// SPDX-License-Identifier: Apache-2.0

//! Vsync-centred present timing.
//!
//! [`TimingController`] turns a target present time into a blocking wait on
//! the [`ReferenceClock`]. It then measures where inside the refresh period
//! the wait actually ended. The goal is to wake halfway between two vsync
//! pulses. Then small jitter on either side never moves the frame to a
//! different refresh.
//!
//! The measured phase error feeds a slow integral loop:
//!
//! ```text
//!   e      = (wake - present) / frame_time - 0.5
//!   e      = wrap(e, -0.5, 0.5)             one-frame slips are not errors
//!   e      = e / (2 * (1 - 0.5))   if e > 0
//!          = e / (2 * 0.5)         otherwise
//!   avg    = mean(last 30 e)
//!   corr   = clamp(corr + avg * 0.01, -0.1, 0.1)
//!   adjust = 1 - avg * 0.01 - corr * 0.01    -> ReferenceClock::set_fine_adjust
//! ```
//!
//! Without a measured refresh period, or while playback speed is adjusted,
//! the loop is bypassed. The wait still happens but the error state resets.

use std::time::Duration;

use tracing::trace;

use crate::clock::{ReferenceClock, ns_to_secs};

/// Number of phase-error samples averaged by the loop.
pub const ERROR_RING_LEN: usize = 30;

/// Target phase inside the refresh period (0.5 = centred).
const TARGET: f64 = 0.5;

/// Integral gain of the correction loop.
const INTEGRAL_GAIN: f64 = 0.01;

/// Bound on the accumulated correction, in frames.
const MAX_CORRECTION: f64 = 0.1;

/// Wraps `x` into the half-open interval `[min, max)`.
pub(crate) fn wrap(x: f64, min: f64, max: f64) -> f64 {
    if (min..max).contains(&x) {
        return x;
    }
    let span = max - min;
    (x - min).rem_euclid(span) + min
}

/// Closed-loop present timing state.
///
/// Owned by the consumer. Reset whenever the pipeline is reconfigured.
#[derive(Debug, Clone)]
pub struct TimingController {
    errors: [f64; ERROR_RING_LEN],
    index: usize,
    avg_error: f64,
    last_error: f64,
    correction: f64,
}

impl Default for TimingController {
    fn default() -> Self {
        Self::new()
    }
}

impl TimingController {
    /// Creates a controller with an empty error history.
    pub fn new() -> Self {
        Self {
            errors: [0.0; ERROR_RING_LEN],
            index: 0,
            avg_error: 0.0,
            last_error: 0.0,
            correction: 0.0,
        }
    }

    /// Clears the error history and the accumulated correction.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Mean of the error history.
    pub fn avg_error(&self) -> f64 {
        self.avg_error
    }

    /// Raw (unwrapped, unscaled) phase error of the last measured wait.
    pub fn last_error(&self) -> f64 {
        self.last_error
    }

    /// Accumulated correction in frames, within `[-0.1, 0.1]`.
    pub fn correction(&self) -> f64 {
        self.correction
    }

    /// Feeds one measured wake-up into the loop.
    ///
    /// # Arguments
    ///
    /// * `wake` - Clock time (ns) at which the wait returned
    /// * `present` - Requested present time (ns)
    /// * `frame_time` - Display refresh period
    ///
    /// # Returns
    ///
    /// The fine rate multiplier to hand to the reference clock.
    pub fn observe(&mut self, wake: u64, present: u64, frame_time: Duration) -> f64 {
        let frame_time = frame_time.as_secs_f64();
        let late = ns_to_secs(wake) - ns_to_secs(present);
        let raw = late / frame_time - TARGET;
        self.last_error = raw;

        let mut error = wrap(raw, -TARGET, 1.0 - TARGET);
        if error > 0.0 {
            error /= 2.0 * (1.0 - TARGET);
        } else {
            error /= 2.0 * TARGET;
        }

        self.errors[self.index] = error;
        self.index = (self.index + 1) % ERROR_RING_LEN;
        self.avg_error = self.errors.iter().sum::<f64>() / ERROR_RING_LEN as f64;

        self.correction = (self.correction + self.avg_error * INTEGRAL_GAIN)
            .clamp(-MAX_CORRECTION, MAX_CORRECTION);

        let adjust = 1.0 - self.avg_error * INTEGRAL_GAIN - self.correction * INTEGRAL_GAIN;
        trace!(
            "present error {:.3}, avg {:.4}, correction {:.4}, fine adjust {:.6}",
            raw, self.avg_error, self.correction, adjust
        );
        adjust
    }

    /// Blocks until `present` and runs one loop iteration.
    ///
    /// Returns the wake time in nanoseconds.
    pub fn wait_present_time(&mut self, clock: &dyn ReferenceClock, present: u64) -> u64 {
        let wake = clock.wait_until(present);
        self.record_wake(clock, wake, present);
        wake
    }

    /// Runs one loop iteration for a wait that already happened.
    ///
    /// Lets callers wait without holding whatever lock guards the controller.
    /// Bypassed (and reset) when the clock has no refresh period or runs at a
    /// non-unity speed.
    pub fn record_wake(&mut self, clock: &dyn ReferenceClock, wake: u64, present: u64) {
        let frame_time = clock.refresh_period().filter(|p| !p.is_zero());
        match frame_time {
            Some(frame_time) if !clock.speed_adjusted() => {
                let adjust = self.observe(wake, present, frame_time);
                clock.set_fine_adjust(adjust);
            }
            _ => self.reset(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::ManualClock;

    use super::*;

    const FRAME: Duration = Duration::from_millis(20);

    #[test]
    fn wrap_into_half_open_range() {
        assert_eq!(wrap(0.25, -0.5, 0.5), 0.25);
        assert!((wrap(0.75, -0.5, 0.5) + 0.25).abs() < 1e-12);
        assert!((wrap(-0.75, -0.5, 0.5) - 0.25).abs() < 1e-12);
        assert!((wrap(0.5, -0.5, 0.5) + 0.5).abs() < 1e-12);
        assert!((wrap(3.1, -0.5, 0.5) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn centred_wake_has_no_error() {
        let mut timing = TimingController::new();
        let adjust = timing.observe(10_000_000, 0, FRAME);
        assert!(timing.last_error().abs() < 1e-12);
        assert_eq!(timing.avg_error(), 0.0);
        assert_eq!(adjust, 1.0);
    }

    #[test]
    fn constant_offset_converges_within_ring_length() {
        // Wake 15 ms after the target on a 20 ms display: 0.75 - 0.5 = 0.25.
        let offset = 15_000_000;
        let expected = 0.25;
        let mut timing = TimingController::new();
        let mut adjusts = Vec::new();
        for i in 0..ERROR_RING_LEN as u64 {
            let present = i * 20_000_000;
            adjusts.push(timing.observe(present + offset, present, FRAME));
        }
        assert!((timing.avg_error() - expected).abs() < 1e-9);
        // The clock is slowed down monotonically to pull the wake earlier.
        assert!(adjusts.windows(2).all(|w| w[1] <= w[0]));
        assert!(*adjusts.last().unwrap() < 1.0);
    }

    #[test]
    fn early_offset_speeds_clock_up() {
        // Wake 2 ms after the target: phase 0.1, error -0.4.
        let mut timing = TimingController::new();
        let mut adjusts = Vec::new();
        for i in 0..(2 * ERROR_RING_LEN) as u64 {
            let present = i * 20_000_000;
            adjusts.push(timing.observe(present + 2_000_000, present, FRAME));
        }
        assert!((timing.avg_error() + 0.4).abs() < 1e-9);
        assert!(adjusts.windows(2).all(|w| w[1] >= w[0]));
        assert!(*adjusts.last().unwrap() > 1.0);
    }

    #[test]
    fn one_frame_slip_is_not_an_error() {
        let mut timing = TimingController::new();
        // 1.5 frames late wraps to the same phase as 0.5 frames late.
        timing.observe(30_000_000, 0, FRAME);
        assert!((timing.last_error() - 1.0).abs() < 1e-12);
        assert!(timing.avg_error().abs() < 1e-12);
    }

    #[test]
    fn correction_is_clamped() {
        let mut timing = TimingController::new();
        for i in 0..1000_u64 {
            let present = i * 20_000_000;
            timing.observe(present + 19_000_000, present, FRAME);
        }
        assert!((timing.correction() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn vsync_clock_drives_fine_adjust() {
        let clock = ManualClock::new(Some(FRAME), Duration::from_millis(5));
        let mut timing = TimingController::new();
        // Targets on the 20 ms grid, edges at 5 ms past: phase 0.25.
        for i in 1..=ERROR_RING_LEN as u64 {
            timing.wait_present_time(&clock, i * 20_000_000);
        }
        assert!((timing.avg_error() + 0.25).abs() < 1e-9);
        let history = clock.fine_adjust_history();
        assert_eq!(history.len(), ERROR_RING_LEN);
        assert!(history.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn bypass_without_refresh_rate_or_with_speed_adjust() {
        let clock = ManualClock::new(None, Duration::ZERO);
        let mut timing = TimingController::new();
        timing.observe(15_000_000, 0, FRAME);
        assert_eq!(timing.wait_present_time(&clock, 1_000), 1_000);
        assert_eq!(timing.avg_error(), 0.0);
        assert!(clock.fine_adjust_history().is_empty());

        let clock = ManualClock::new(Some(FRAME), Duration::from_millis(5));
        timing.observe(15_000_000, 0, FRAME);
        clock.set_speed_adjusted(true);
        timing.wait_present_time(&clock, 20_000_000);
        assert_eq!(timing.avg_error(), 0.0);
        assert_eq!(timing.correction(), 0.0);
        assert!(clock.fine_adjust_history().is_empty());
    }
}
